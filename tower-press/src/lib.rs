//! # Tower Press
//!
//! `tower-press` applies per-route adaptive backpressure to services built on
//! the [Tower](https://github.com/tower-rs/tower) ecosystem, such as a STAC API.
//!
//! ## How a request is handled
//!
//! 1. **Classification**: a [`Classify`] implementation maps the request to a
//!    [`RouteClass`]. Unclassified requests go straight to the inner service.
//! 2. **Admission**: the route's controller answers allow, delay or reject.
//!    Delays are non-blocking sleeps; rejections never reach the inner service.
//! 3. **Timeout**: a deadline started on arrival covers the delay and the inner
//!    call. Running past it fails with [`AdmissionError::TimeoutExceeded`].
//! 4. **Recording**: every classified request is counted against its route
//!    exactly once, when it finishes, fails, times out or is dropped.
//!
//! Use [`AdmissionLayer`] for the raw middleware or [`ManagedAdmissionLayer`]
//! for a boxed stack whose errors are all [`AdmissionError`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`AdmissionError`], mapping rejections
//!   to 429 with `Retry-After`, timeouts to 504 and inner failures to 500.

mod classify;
mod error;
mod layer;
mod managed_layer;
mod service;
pub mod settings;
mod utils;

#[cfg(test)]
mod tests;

pub use classify::Classify;
pub use classify::StacRouteClassifier;
pub use error::AdmissionError;
pub use layer::AdmissionLayer;
pub use managed_layer::ManagedAdmissionLayer;
pub use service::AdmissionService;
pub use service::ResponseFuture;
pub use utils::ServiceBuilderExt;

pub use press_limit::AdmissionConfig;
pub use press_limit::Decision;
pub use press_limit::Reason;
pub use press_limit::RouteClass;
pub use press_limit::RouteTable;
