//! Loading admission settings from files and the environment.
//!
//! Sources are layered with the `config` crate: an optional settings file
//! (format chosen by extension) overlaid by `ADMISSION__*` environment
//! variables, where `__` separates nesting levels:
//!
//! ```text
//! ADMISSION__REQUEST_TIMEOUT=10
//! ADMISSION__BACK_PRESSURES__SEARCH__REQ_PER_SEC=100
//! ADMISSION__RATE_LIMITS__ITEMS=250
//! ```
//!
//! The unprefixed `REQUEST_TIMEOUT` variable of existing deployments is also
//! honoured; `ADMISSION__REQUEST_TIMEOUT` takes precedence over it.
//!
//! The result is validated once into a frozen [`AdmissionConfig`]; any error
//! here is meant to abort startup.

use std::path::Path;

use config::Config;
use config::ConfigBuilder;
use config::Environment;
use config::File;
use config::FileFormat;
use config::Source;
use config::Value;
use config::builder::DefaultState;
use press_limit::AdmissionConfig;
use press_limit::Settings;

/// Environment variable prefix for admission settings.
pub const ENV_PREFIX: &str = "ADMISSION";
/// Separator between the prefix and nested keys.
pub const ENV_SEPARATOR: &str = "__";
/// Unprefixed request timeout variable, in seconds.
pub const REQUEST_TIMEOUT_VAR: &str = "REQUEST_TIMEOUT";

/// Errors produced while loading admission settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load admission settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid admission settings: {0}")]
    Invalid(#[from] press_limit::ConfigError),
}

/// Load settings from `path` (if any) and the process environment.
pub fn load_settings(path: Option<&Path>) -> Result<AdmissionConfig, SettingsError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        tracing::info!(path = %path.display(), "loading admission settings");
        builder = builder.add_source(File::from(path).required(true));
    }
    build(overlay_environment(builder, None))
}

/// Load settings from an in-memory document, overlaid by `env` instead of the
/// process environment when it is given.
pub fn load_settings_from_str(
    content: &str,
    format: FileFormat,
    env: Option<config::Map<String, String>>,
) -> Result<AdmissionConfig, SettingsError> {
    let builder = Config::builder().add_source(File::from_str(content, format));
    build(overlay_environment(builder, env))
}

fn overlay_environment(
    builder: ConfigBuilder<DefaultState>,
    source: Option<config::Map<String, String>>,
) -> ConfigBuilder<DefaultState> {
    let timeout = RequestTimeoutVar::read(source.as_ref());
    let environment = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .source(source);
    builder.add_source(timeout).add_source(environment)
}

/// Maps `REQUEST_TIMEOUT` onto `request_timeout`.
#[derive(Debug, Clone)]
struct RequestTimeoutVar {
    value: Option<String>,
}

impl RequestTimeoutVar {
    fn read(source: Option<&config::Map<String, String>>) -> Self {
        let value = match source {
            Some(vars) => vars.get(REQUEST_TIMEOUT_VAR).cloned(),
            None => std::env::var(REQUEST_TIMEOUT_VAR).ok(),
        };
        Self { value }
    }
}

impl Source for RequestTimeoutVar {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<config::Map<String, Value>, config::ConfigError> {
        let mut map = config::Map::new();
        if let Some(value) = &self.value {
            let origin = REQUEST_TIMEOUT_VAR.to_string();
            map.insert(
                "request_timeout".to_string(),
                Value::new(Some(&origin), value.as_str()),
            );
        }
        Ok(map)
    }
}

fn build(builder: ConfigBuilder<DefaultState>) -> Result<AdmissionConfig, SettingsError> {
    let settings: Settings = builder.build()?.try_deserialize()?;
    let config = AdmissionConfig::try_from(settings)?;
    tracing::debug!(
        request_timeout = ?config.request_timeout(),
        "admission settings validated"
    );
    Ok(config)
}
