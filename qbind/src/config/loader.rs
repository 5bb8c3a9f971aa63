//! Configuration loading.
//!
//! Precedence, lowest first:
//! 1. Default values
//! 2. Configuration file (TOML)
//! 3. Environment variables (`QBIND_` prefix, `__` between path segments)

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, Environment};

use super::{validate_resource_limits, EndpointConfig};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "QBIND";

/// Load, override from the process environment, and validate.
///
/// A missing file is not an error; defaults are used instead.
pub fn load_config(path: impl AsRef<Path>) -> Result<EndpointConfig> {
    load_config_from(path, env_source())
}

/// Like [`load_config`] with an explicit environment source.
pub fn load_config_from(path: impl AsRef<Path>, env: Environment) -> Result<EndpointConfig> {
    let mut config = load_config_file(path.as_ref())?;
    apply_env_overrides(&mut config, env)?;

    config.validate().map_err(|errors| {
        anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
    })?;
    validate_resource_limits(&config);

    Ok(config)
}

/// `QBIND_ENDPOINT__MAX_CONNECTIONS=500` overrides `endpoint.max_connections`
pub fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

fn load_config_file(path: &Path) -> Result<EndpointConfig> {
    if !path.exists() {
        tracing::warn!(
            config_path = %path.display(),
            "Configuration file not found, using defaults"
        );
        return Ok(EndpointConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
}

/// Apply the known environment overrides.
fn apply_env_overrides(config: &mut EndpointConfig, env: Environment) -> Result<()> {
    let overrides = ConfigLoader::builder()
        .add_source(env)
        .build()
        .context("Failed to load environment variables")?;

    if let Ok(max) = overrides.get_int("endpoint.max_connections") {
        config.endpoint.max_connections =
            usize::try_from(max).context("endpoint.max_connections must not be negative")?;
    }
    if let Ok(accept) = overrides.get_bool("endpoint.accept_incoming") {
        config.endpoint.accept_incoming = accept;
    }
    if let Ok(reset) = overrides.get_bool("endpoint.stateless_reset") {
        config.endpoint.stateless_reset = reset;
    }
    if let Ok(ms) = overrides.get_int("connection.idle_timeout_ms") {
        config.connection.idle_timeout_ms =
            u64::try_from(ms).context("connection.idle_timeout_ms must not be negative")?;
    }
    if let Ok(ms) = overrides.get_int("connection.drain_timeout_ms") {
        config.connection.drain_timeout_ms =
            u64::try_from(ms).context("connection.drain_timeout_ms must not be negative")?;
    }
    if let Ok(level) = overrides.get_string("logging.level") {
        match level.parse() {
            Ok(parsed) => config.logging.level = parsed,
            Err(err) => tracing::warn!(%level, error = %err, "Invalid log level override, ignoring"),
        }
    }

    Ok(())
}

/// Default configuration rendered as TOML
pub fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&EndpointConfig::default())
        .context("Failed to serialize default config")
}
