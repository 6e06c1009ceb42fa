//! # press-limit
//!
//! `press-limit` decides, per request and per route, whether a read-heavy API
//! should serve a request now, serve it after a short delay, or turn it away.
//!
//! ## Core Philosophy
//!
//! Hard rate limits fail abruptly. `press-limit` instead applies *backpressure*:
//! once a route runs above its target throughput, each request is slowed by a
//! small increment that grows with the overage. Only when the slowdown would
//! not fit in the request timeout, or an absolute ceiling is hit, is a request
//! rejected.
//!
//! ## Key Concepts
//!
//! * **Lock-Free Metering**: a [`LoadMeter`] keeps its window and count in one
//!   atomic word, so rotation and increments are a single CAS.
//! * **Frozen Limits**: [`RouteLimitConfig`] and [`AdmissionConfig`] are built
//!   once through a validating step and never change.
//! * **Explicit Handles**: the [`RouteTable`] is passed down the request path;
//!   there is no global state.
//!
//! ## Example
//!
//! ```rust
//! use press_limit::Backpressure;
//! use press_limit::BackpressureController;
//! use press_limit::Decision;
//! use press_limit::RouteClass;
//! use press_limit::RouteLimitConfig;
//!
//! let limits = RouteLimitConfig::builder(100, 10).build().unwrap();
//! let search = BackpressureController::new(RouteClass::Search, limits);
//!
//! match search.admit() {
//!     Decision::Allow => { /* serve */ }
//!     Decision::Delay(wait) => { /* sleep for `wait`, then serve */ }
//!     Decision::Reject(reason) => { /* answer with `reason.retry_after()` */ }
//! }
//! search.record();
//! ```

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

mod config;
mod controller;
mod meter;
mod route;

pub use config::AdmissionConfig;
pub use config::BackPressure;
pub use config::BackPressures;
pub use config::BackoffCurve;
pub use config::ConfigError;
pub use config::MIN_WINDOW;
pub use config::RateLimits;
pub use config::RouteLimitConfig;
pub use config::RouteLimitConfigBuilder;
pub use config::Settings;
pub use controller::BackpressureController;
pub use controller::RouteTable;
pub use meter::LoadMeter;
pub use meter::WindowSnapshot;
pub use route::RouteClass;

/// What to do with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Serve immediately.
    Allow,
    /// Serve after waiting this long.
    Delay(Duration),
    /// Do not serve.
    Reject(Reason),
}

/// Reasons why a request might be rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The backoff delay would not fit inside the request timeout.
    DelayExceedsTimeout { delay: Duration, timeout: Duration },
    /// The route has reached its absolute request ceiling for this window.
    LimitReached { limit: u32, retry_after: Duration },
}

impl Reason {
    /// How long the caller should wait before trying again.
    pub fn retry_after(&self) -> Duration {
        match self {
            Reason::DelayExceedsTimeout { delay, .. } => *delay,
            Reason::LimitReached { retry_after, .. } => *retry_after,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::DelayExceedsTimeout { delay, timeout } => {
                write!(f, "backoff of {delay:?} exceeds the {timeout:?} request timeout")
            }
            Reason::LimitReached { limit, .. } => {
                write!(f, "route limit of {limit} requests/sec reached")
            }
        }
    }
}

/// The admission interface the request path is written against.
///
/// Implementations must be `Send` and `Sync` so one instance can be shared by
/// every in-flight request of a route.
pub trait Backpressure: Debug + Send + Sync {
    /// Decide what to do with a request arriving now.
    ///
    /// This method is non-blocking and does not record the request.
    fn admit(&self) -> Decision;

    /// Account for one request that reached its terminal outcome.
    ///
    /// Call exactly once per admitted *or* rejected request.
    fn record(&self);
}
