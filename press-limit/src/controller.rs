use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;

use crate::AdmissionConfig;
use crate::Backpressure;
use crate::BackoffCurve;
use crate::Decision;
use crate::LoadMeter;
use crate::Reason;
use crate::RouteClass;
use crate::RouteLimitConfig;
use crate::WindowSnapshot;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Turns the observed load on one route into an admission [`Decision`].
#[derive(Debug)]
pub struct BackpressureController {
    route: RouteClass,
    config: RouteLimitConfig,
    meter: LoadMeter,
}

impl BackpressureController {
    pub fn new(route: RouteClass, config: RouteLimitConfig) -> Self {
        Self::with_clock(route, config, Clock::new())
    }

    pub fn with_clock(route: RouteClass, config: RouteLimitConfig, clock: Clock) -> Self {
        let meter = LoadMeter::with_clock(config.window(), clock);
        Self {
            route,
            config,
            meter,
        }
    }

    pub fn route(&self) -> RouteClass {
        self.route
    }

    pub fn config(&self) -> &RouteLimitConfig {
        &self.config
    }

    /// Requests per second currently observed on this route.
    pub fn current_rate(&self) -> f64 {
        self.meter.current_rate()
    }

    /// Decide what to do with a request arriving while the meter reads `snapshot`.
    ///
    /// All comparisons are made on `rate × window` in nanoseconds, so a route
    /// running exactly at its target is never pushed over it by float rounding.
    pub fn decide(&self, snapshot: &WindowSnapshot) -> Decision {
        let window_ns = snapshot.window.as_nanos().max(1);
        let observed = u128::from(snapshot.count) * NANOS_PER_SEC;

        if let Some(limit) = self.config.hard_limit()
            && observed >= u128::from(limit) * window_ns
        {
            return Decision::Reject(Reason::LimitReached {
                limit,
                retry_after: snapshot.remaining(),
            });
        }

        let target = u128::from(self.config.req_per_sec()) * window_ns;
        if observed <= target {
            return Decision::Allow;
        }

        let excess = observed - target;
        let delay = match self.config.curve() {
            BackoffCurve::PerRequest => self.scaled(excess.div_ceil(window_ns)),
            BackoffCurve::Stepped => self.scaled(excess.div_ceil(target)),
            BackoffCurve::Exponential => {
                let steps = excess.div_ceil(target);
                let factor = u32::try_from(steps - 1)
                    .ok()
                    .and_then(|shift| 1u128.checked_shl(shift))
                    .filter(|factor| *factor <= u128::from(u64::MAX))
                    .unwrap_or(u128::from(u64::MAX));
                self.scaled(factor)
            }
        };

        let timeout = self.config.request_timeout();
        if delay > timeout {
            Decision::Reject(Reason::DelayExceedsTimeout { delay, timeout })
        } else {
            Decision::Delay(delay)
        }
    }

    /// `inc_ms × steps`, saturating.
    fn scaled(&self, steps: u128) -> Duration {
        let millis = u128::from(self.config.inc_ms()).saturating_mul(steps);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl Backpressure for BackpressureController {
    fn admit(&self) -> Decision {
        self.decide(&self.meter.snapshot())
    }

    fn record(&self) {
        self.meter.record_request();
    }
}

/// One controller per [`RouteClass`] plus the global request timeout.
///
/// This is the handle the request path carries; clones share controllers.
#[derive(Debug, Clone)]
pub struct RouteTable {
    controllers: [Arc<dyn Backpressure>; 5],
    request_timeout: Duration,
}

impl RouteTable {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: &AdmissionConfig, clock: Clock) -> Self {
        let controllers = RouteClass::ALL.map(|route| {
            let limits = config.route(route).clone();
            tracing::info!(
                route = %route,
                req_per_sec = limits.req_per_sec(),
                inc_ms = limits.inc_ms(),
                hard_limit = ?limits.hard_limit(),
                window = ?limits.window(),
                curve = ?limits.curve(),
                "admission control enabled"
            );
            Arc::new(BackpressureController::with_clock(
                route,
                limits,
                clock.clone(),
            )) as Arc<dyn Backpressure>
        });

        Self {
            controllers,
            request_timeout: config.request_timeout(),
        }
    }

    /// Build a table from arbitrary [`Backpressure`] implementations.
    pub fn from_fn<F>(request_timeout: Duration, f: F) -> Self
    where
        F: FnMut(RouteClass) -> Arc<dyn Backpressure>,
    {
        Self {
            controllers: RouteClass::ALL.map(f),
            request_timeout,
        }
    }

    pub fn controller(&self, route: RouteClass) -> &Arc<dyn Backpressure> {
        &self.controllers[route.index()]
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
