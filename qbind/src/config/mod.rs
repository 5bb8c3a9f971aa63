//! Endpoint configuration.
//!
//! # Example
//!
//! ```toml
//! [endpoint]
//! max_connections = 10000
//! supported_versions = [0x00000001]
//!
//! [connection]
//! idle_timeout_ms = 30000
//! max_streams_bidi = 100
//!
//! [logging]
//! level = "info"
//! ```

pub mod loader;
pub mod validation;

#[cfg(test)]
mod tests;

pub use loader::{load_config, load_config_from};
pub use validation::{validate_resource_limits, ConfigValidator};

use qbind_quic::ConnectionConfig;
use serde::{Deserialize, Serialize};

/// QUIC version 1 (RFC 9000)
pub const VERSION_1: u32 = 0x0000_0001;

/// Top-level configuration composing every subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub endpoint: EndpointSettings,

    /// Applied to every connection the endpoint creates
    pub connection: ConnectionConfig,

    pub logging: LoggingConfig,
}

impl EndpointConfig {
    /// Validate every section, collecting all errors
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.endpoint.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.connection.validate() {
            errors.extend(e.into_iter().map(|err| format!("connection: {}", err)));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Endpoint-wide limits and routing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Upper bound on live connections; new ones are refused beyond it.
    ///
    /// **Default:** `10000`
    pub max_connections: usize,

    /// QUIC versions this endpoint accepts. Anything else gets a
    /// Version Negotiation response.
    ///
    /// **Default:** `[0x00000001]`
    pub supported_versions: Vec<u32>,

    /// Whether unknown connection IDs may open new server connections.
    ///
    /// **Default:** `true`
    pub accept_incoming: bool,

    /// Answer short-header datagrams for unknown connection IDs with a
    /// stateless reset.
    ///
    /// **Default:** `true`
    pub stateless_reset: bool,

    /// Capacity of the event bridge channel per endpoint.
    ///
    /// **Default:** `4096`
    pub event_channel_capacity: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            supported_versions: vec![VERSION_1],
            accept_incoming: true,
            stateless_reset: true,
            event_channel_capacity: 4096,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    ///
    /// **Default:** `info`
    pub level: LogLevel,

    /// Enable ANSI color codes in logs.
    ///
    /// **Default:** `true`
    pub enable_colors: bool,

    /// Include source file and line number in logs.
    ///
    /// **Default:** `false`
    pub include_file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_colors: true,
            include_file_line: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}
