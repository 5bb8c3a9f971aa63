//! Tests for configuration loading and validation.

use std::io::Write;

use config::{Environment, Map};
use tempfile::NamedTempFile;

use super::loader::{default_config_toml, ENV_PREFIX};
use super::*;

fn no_env() -> Environment {
    env_with(&[])
}

fn env_with(vars: &[(&str, &str)]) -> Environment {
    let source: Map<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    loader::env_source().source(Some(source))
}

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

mod defaults_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EndpointConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.supported_versions, vec![VERSION_1]);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("absent.toml"), no_env()).unwrap();
        assert_eq!(config, EndpointConfig::default());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = default_config_toml().unwrap();
        let file = write_config(&rendered);
        let config = load_config_from(file.path(), no_env()).unwrap();
        assert_eq!(config, EndpointConfig::default());
    }
}

mod file_tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
            [endpoint]
            max_connections = 64

            [connection]
            idle_timeout_ms = 5000

            [logging]
            level = "debug"
            "#,
        );
        let config = load_config_from(file.path(), no_env()).unwrap();
        assert_eq!(config.endpoint.max_connections, 64);
        assert_eq!(config.connection.idle_timeout_ms, 5000);
        assert_eq!(config.connection.drain_timeout_ms, 3000);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.endpoint.accept_incoming);
        assert!(config.endpoint.stateless_reset);
    }

    #[test]
    fn test_malformed_toml_is_reported() {
        let file = write_config("[endpoint\nmax_connections = ");
        let err = load_config_from(file.path(), no_env()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse TOML config"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let file = write_config(
            r#"
            [endpoint]
            max_connections = 0
            supported_versions = []

            [connection]
            max_udp_payload_size = 500
            "#,
        );
        let err = load_config_from(file.path(), no_env()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("max_connections"));
        assert!(message.contains("supported_versions"));
        assert!(message.contains("connection: max_udp_payload_size"));
    }
}

mod env_tests {
    use super::*;

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[endpoint]\nmax_connections = 64\n");
        let max_key = format!("{}_ENDPOINT__MAX_CONNECTIONS", ENV_PREFIX);
        let env = env_with(&[
            (max_key.as_str(), "128"),
            ("QBIND_CONNECTION__IDLE_TIMEOUT_MS", "1500"),
            ("QBIND_LOGGING__LEVEL", "warn"),
            ("QBIND_ENDPOINT__ACCEPT_INCOMING", "false"),
            ("QBIND_ENDPOINT__STATELESS_RESET", "false"),
        ]);

        let config = load_config_from(file.path(), env).unwrap();
        assert_eq!(config.endpoint.max_connections, 128);
        assert_eq!(config.connection.idle_timeout_ms, 1500);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(!config.endpoint.accept_incoming);
        assert!(!config.endpoint.stateless_reset);
    }

    #[test]
    fn test_invalid_log_level_override_is_ignored() {
        let env = env_with(&[("QBIND_LOGGING__LEVEL", "chatty")]);
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("none.toml"), env).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_unrelated_variables_are_ignored() {
        let env = env_with(&[("OTHER_ENDPOINT__MAX_CONNECTIONS", "1")]);
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path().join("none.toml"), env).unwrap();
        assert_eq!(config.endpoint.max_connections, 10_000);
    }
}

mod validation_tests {
    use super::*;

    #[test]
    fn test_reserved_version_rejected() {
        let mut settings = EndpointSettings::default();
        settings.supported_versions.push(0x1a2a3a4a);
        let errors = ConfigValidator::validate(&settings).unwrap_err();
        assert!(errors[0].contains("reserved version 0x1a2a3a4a"));
    }

    #[test]
    fn test_resource_warnings() {
        let mut config = EndpointConfig::default();
        config.endpoint.max_connections = 1_000_000;
        config.connection.drain_timeout_ms = 60_000;
        let warnings = validate_resource_limits(&config);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_string(), "trace");
    }
}
