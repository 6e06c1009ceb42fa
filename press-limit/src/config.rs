use std::num::NonZeroU32;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::RouteClass;

/// The shortest measurement window a route may use.
pub const MIN_WINDOW: Duration = Duration::from_millis(100);

const DEFAULT_REQUEST_TIMEOUT_SECS: i64 = 30;
const DEFAULT_WINDOW_MS: i64 = 1000;
const DEFAULT_REQ_PER_SEC: i64 = 50;
const DEFAULT_INC_MS: i64 = 10;

/// Errors raised while turning raw settings into frozen limits.
///
/// Every variant is fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than 0, got {value}")]
    NonPositive { field: &'static str, value: i64 },

    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("window must be at least {min:?}, got {window:?}")]
    WindowTooShort { window: Duration, min: Duration },

    #[error("missing backpressure settings for route '{0}'")]
    MissingRoute(RouteClass),

    #[error("hard_limit ({hard_limit}) must be above req_per_sec ({req_per_sec})")]
    HardLimitNotAboveTarget { hard_limit: u32, req_per_sec: u32 },

    #[error("invalid limits for route '{route}': {source}")]
    Route {
        route: RouteClass,
        #[source]
        source: Box<ConfigError>,
    },
}

/// How the backoff increment scales with the overage above target.
///
/// Every curve is non-decreasing in the overage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    /// One increment per request/sec above target.
    #[default]
    PerRequest,
    /// One increment per started multiple of the target above target.
    Stepped,
    /// The increment doubles for every started multiple of the target.
    Exponential,
}

/// Immutable limits for one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLimitConfig {
    req_per_sec: NonZeroU32,
    inc_ms: NonZeroU32,
    hard_limit: Option<NonZeroU32>,
    request_timeout: Duration,
    window: Duration,
    curve: BackoffCurve,
}

impl RouteLimitConfig {
    /// Start building limits from the two raw backpressure values.
    pub fn builder(req_per_sec: i64, inc_ms: i64) -> RouteLimitConfigBuilder {
        RouteLimitConfigBuilder {
            req_per_sec,
            inc_ms,
            hard_limit: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS as u64),
            window: Duration::from_millis(DEFAULT_WINDOW_MS as u64),
            curve: BackoffCurve::default(),
        }
    }

    /// Target steady-state throughput.
    pub fn req_per_sec(&self) -> u32 {
        self.req_per_sec.get()
    }

    /// The backoff unit, in milliseconds.
    pub fn inc_ms(&self) -> u32 {
        self.inc_ms.get()
    }

    /// Absolute requests/sec ceiling, if any.
    pub fn hard_limit(&self) -> Option<u32> {
        self.hard_limit.map(NonZeroU32::get)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn curve(&self) -> BackoffCurve {
        self.curve
    }
}

/// Collects raw values; [`RouteLimitConfigBuilder::build`] is the only validation step.
#[derive(Debug, Clone)]
pub struct RouteLimitConfigBuilder {
    req_per_sec: i64,
    inc_ms: i64,
    hard_limit: Option<i64>,
    request_timeout: Duration,
    window: Duration,
    curve: BackoffCurve,
}

impl RouteLimitConfigBuilder {
    pub fn hard_limit(mut self, hard_limit: i64) -> Self {
        self.hard_limit = Some(hard_limit);
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn curve(mut self, curve: BackoffCurve) -> Self {
        self.curve = curve;
        self
    }

    pub fn build(self) -> Result<RouteLimitConfig, ConfigError> {
        let req_per_sec = positive_u32("req_per_sec", self.req_per_sec)?;
        let inc_ms = positive_u32("inc_ms", self.inc_ms)?;
        let hard_limit = self
            .hard_limit
            .map(|limit| positive_u32("hard_limit", limit))
            .transpose()?;

        // Traffic at or below the target must always be allowed.
        if let Some(limit) = hard_limit
            && limit <= req_per_sec
        {
            return Err(ConfigError::HardLimitNotAboveTarget {
                hard_limit: limit.get(),
                req_per_sec: req_per_sec.get(),
            });
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "request_timeout",
                value: 0,
            });
        }
        if self.window < MIN_WINDOW {
            return Err(ConfigError::WindowTooShort {
                window: self.window,
                min: MIN_WINDOW,
            });
        }

        Ok(RouteLimitConfig {
            req_per_sec,
            inc_ms,
            hard_limit,
            request_timeout: self.request_timeout,
            window: self.window,
            curve: self.curve,
        })
    }
}

fn positive_u32(field: &'static str, value: i64) -> Result<NonZeroU32, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NonPositive { field, value });
    }
    u32::try_from(value)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(ConfigError::OutOfRange { field, value })
}

/// Backpressure parameters for one route, as they arrive from settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackPressure {
    #[serde(default = "default_req_per_sec")]
    pub req_per_sec: i64,
    #[serde(default = "default_inc_ms")]
    pub inc_ms: i64,
}

impl Default for BackPressure {
    fn default() -> Self {
        Self {
            req_per_sec: DEFAULT_REQ_PER_SEC,
            inc_ms: DEFAULT_INC_MS,
        }
    }
}

impl BackPressure {
    pub fn new(req_per_sec: i64, inc_ms: i64) -> Self {
        Self {
            req_per_sec,
            inc_ms,
        }
    }
}

/// Per-route backpressure sections. Every route must be present.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackPressures {
    pub collections: Option<BackPressure>,
    pub collection: Option<BackPressure>,
    pub item: Option<BackPressure>,
    pub items: Option<BackPressure>,
    pub search: Option<BackPressure>,
}

impl BackPressures {
    /// The same parameters for every route.
    pub fn uniform(back_pressure: BackPressure) -> Self {
        Self {
            collections: Some(back_pressure.clone()),
            collection: Some(back_pressure.clone()),
            item: Some(back_pressure.clone()),
            items: Some(back_pressure.clone()),
            search: Some(back_pressure),
        }
    }

    pub fn get(&self, route: RouteClass) -> Option<&BackPressure> {
        match route {
            RouteClass::Collections => self.collections.as_ref(),
            RouteClass::Collection => self.collection.as_ref(),
            RouteClass::Item => self.item.as_ref(),
            RouteClass::Items => self.items.as_ref(),
            RouteClass::Search => self.search.as_ref(),
        }
    }

    pub fn set(&mut self, route: RouteClass, back_pressure: BackPressure) {
        let slot = match route {
            RouteClass::Collections => &mut self.collections,
            RouteClass::Collection => &mut self.collection,
            RouteClass::Item => &mut self.item,
            RouteClass::Items => &mut self.items,
            RouteClass::Search => &mut self.search,
        };
        *slot = Some(back_pressure);
    }
}

/// Optional hard requests/sec ceilings per route.
///
/// A route without an entry is only ever delayed, never rejected for volume.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub collections: Option<i64>,
    pub collection: Option<i64>,
    pub item: Option<i64>,
    pub items: Option<i64>,
    pub search: Option<i64>,
}

impl RateLimits {
    pub fn get(&self, route: RouteClass) -> Option<i64> {
        match route {
            RouteClass::Collections => self.collections,
            RouteClass::Collection => self.collection,
            RouteClass::Item => self.item,
            RouteClass::Items => self.items,
            RouteClass::Search => self.search,
        }
    }
}

/// Raw admission settings, as deserialised from files and the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub back_pressures: BackPressures,
    /// Seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: i64,
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default)]
    pub backoff_curve: BackoffCurve,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limits: RateLimits::default(),
            back_pressures: BackPressures::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT_SECS,
            window_ms: DEFAULT_WINDOW_MS,
            backoff_curve: BackoffCurve::default(),
        }
    }
}

fn default_request_timeout() -> i64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_window_ms() -> i64 {
    DEFAULT_WINDOW_MS
}

fn default_req_per_sec() -> i64 {
    DEFAULT_REQ_PER_SEC
}

fn default_inc_ms() -> i64 {
    DEFAULT_INC_MS
}

/// Validated limits for every route plus the global request timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    routes: [RouteLimitConfig; 5],
    request_timeout: Duration,
}

impl AdmissionConfig {
    pub fn route(&self, route: RouteClass) -> &RouteLimitConfig {
        &self.routes[route.index()]
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl TryFrom<Settings> for AdmissionConfig {
    type Error = ConfigError;

    fn try_from(settings: Settings) -> Result<Self, Self::Error> {
        let timeout_secs = positive_u32("request_timeout", settings.request_timeout)?;
        let window_ms = positive_u32("window_ms", settings.window_ms)?;
        let request_timeout = Duration::from_secs(u64::from(timeout_secs.get()));
        let window = Duration::from_millis(u64::from(window_ms.get()));

        let build = |route: RouteClass| -> Result<RouteLimitConfig, ConfigError> {
            let back_pressure = settings
                .back_pressures
                .get(route)
                .ok_or(ConfigError::MissingRoute(route))?;
            let mut builder =
                RouteLimitConfig::builder(back_pressure.req_per_sec, back_pressure.inc_ms);
            if let Some(limit) = settings.rate_limits.get(route) {
                builder = builder.hard_limit(limit);
            }
            builder
                .request_timeout(request_timeout)
                .window(window)
                .curve(settings.backoff_curve)
                .build()
                .map_err(|source| ConfigError::Route {
                    route,
                    source: Box::new(source),
                })
        };

        let routes = [
            build(RouteClass::Collections)?,
            build(RouteClass::Collection)?,
            build(RouteClass::Item)?,
            build(RouteClass::Items)?,
            build(RouteClass::Search)?,
        ];

        Ok(Self {
            routes,
            request_timeout,
        })
    }
}
