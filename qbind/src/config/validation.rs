//! Configuration validation.

use tracing::warn;

use super::{EndpointConfig, EndpointSettings};

/// Configuration validator trait.
pub trait ConfigValidator {
    /// Returns `Ok(())` if valid, or every error message found.
    fn validate(&self) -> Result<(), Vec<String>>;
}

impl ConfigValidator for EndpointSettings {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("endpoint.max_connections must be greater than 0".to_string());
        }
        if self.supported_versions.is_empty() {
            errors.push("endpoint.supported_versions must not be empty".to_string());
        }
        // RFC 9000 Section 15: 0x?a?a?a?a versions are reserved for negotiation
        for version in &self.supported_versions {
            if version & 0x0f0f_0f0f == 0x0a0a_0a0a {
                errors.push(format!(
                    "endpoint.supported_versions contains reserved version 0x{:08x}",
                    version
                ));
            }
        }
        if self.event_channel_capacity == 0 {
            errors.push("endpoint.event_channel_capacity must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl ConfigValidator for EndpointConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        EndpointConfig::validate(self)
    }
}

/// Cross-section sanity checks.
///
/// Problems found here are logged as warnings and returned; they never fail
/// loading.
pub fn validate_resource_limits(config: &EndpointConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let per_connection = config.connection.initial_max_data;
    let worst_case_mb =
        (config.endpoint.max_connections as u64).saturating_mul(per_connection) / (1024 * 1024);
    if worst_case_mb > 16 * 1024 {
        warnings.push(format!(
            "max_connections ({}) * initial_max_data ({}) may buffer ~{}MB of receive data",
            config.endpoint.max_connections, per_connection, worst_case_mb
        ));
    }

    if config.connection.idle_timeout_ms != 0
        && config.connection.drain_timeout_ms > config.connection.idle_timeout_ms
    {
        warnings.push(format!(
            "connection.drain_timeout_ms ({}) exceeds idle_timeout_ms ({})",
            config.connection.drain_timeout_ms, config.connection.idle_timeout_ms
        ));
    }

    for warning in &warnings {
        warn!("{}", warning);
    }
    warnings
}
