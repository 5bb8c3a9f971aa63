//! Connection configuration.
//!
//! Local settings for a single connection. Deserializable so hosts can embed
//! it in their own configuration files.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::params::{
    TransportParameters, DEFAULT_IDLE_TIMEOUT, DEFAULT_INITIAL_MAX_DATA,
    DEFAULT_INITIAL_MAX_STREAM_DATA, DEFAULT_MAX_STREAMS_BIDI, DEFAULT_MAX_STREAMS_UNI,
};
use crate::types::{DEFAULT_MAX_UDP_PAYLOAD_SIZE, DEFAULT_SCID_LENGTH, MAX_CID_LENGTH};

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Idle timeout advertised to the peer, in milliseconds (0 disables).
    ///
    /// **Default:** `30000`
    pub idle_timeout_ms: u64,

    /// How long `Draining` absorbs stray packets before `Closed`.
    ///
    /// **Default:** `3000`
    pub drain_timeout_ms: u64,

    /// Largest datagram handed back by `produce_datagrams`.
    ///
    /// **Default:** `1200`
    pub max_udp_payload_size: usize,

    /// Upper bound on datagrams produced per `produce_datagrams` call.
    ///
    /// **Default:** `16`
    pub max_datagrams_per_poll: usize,

    /// Connection-level receive window.
    pub initial_max_data: u64,

    /// Per-stream receive window (all stream classes).
    pub initial_max_stream_data: u64,

    /// Concurrent bidirectional streams the peer may open.
    pub max_streams_bidi: u64,

    /// Concurrent unidirectional streams the peer may open.
    pub max_streams_uni: u64,

    /// Length of locally chosen connection IDs.
    ///
    /// **Default:** `18`
    pub scid_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            drain_timeout_ms: 3000,
            max_udp_payload_size: DEFAULT_MAX_UDP_PAYLOAD_SIZE,
            max_datagrams_per_poll: 16,
            initial_max_data: DEFAULT_INITIAL_MAX_DATA,
            initial_max_stream_data: DEFAULT_INITIAL_MAX_STREAM_DATA,
            max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
            scid_length: DEFAULT_SCID_LENGTH,
        }
    }
}

impl ConnectionConfig {
    /// Local idle timeout, or None when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Transport parameters this endpoint advertises
    pub fn local_transport_parameters(&self) -> TransportParameters {
        TransportParameters {
            max_idle_timeout_ms: self.idle_timeout_ms,
            initial_max_data: self.initial_max_data,
            initial_max_stream_data_bidi_local: self.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data,
            initial_max_stream_data_uni: self.initial_max_stream_data,
            initial_max_streams_bidi: self.max_streams_bidi,
            initial_max_streams_uni: self.max_streams_uni,
        }
    }

    /// Validate the configuration.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // RFC 9000 Section 14: datagrams carrying Initial packets are >= 1200
        if self.max_udp_payload_size < DEFAULT_MAX_UDP_PAYLOAD_SIZE {
            errors.push(format!(
                "max_udp_payload_size ({}) must be at least {}",
                self.max_udp_payload_size, DEFAULT_MAX_UDP_PAYLOAD_SIZE
            ));
        }
        if self.max_udp_payload_size > 65527 {
            errors.push(format!(
                "max_udp_payload_size ({}) exceeds the UDP maximum of 65527",
                self.max_udp_payload_size
            ));
        }

        if self.max_datagrams_per_poll == 0 {
            errors.push("max_datagrams_per_poll must be greater than 0".to_string());
        }

        if self.drain_timeout_ms == 0 {
            errors.push("drain_timeout_ms must be greater than 0".to_string());
        }

        if self.initial_max_stream_data > self.initial_max_data {
            errors.push(format!(
                "initial_max_stream_data ({}) exceeds initial_max_data ({})",
                self.initial_max_stream_data, self.initial_max_data
            ));
        }

        if self.scid_length > MAX_CID_LENGTH {
            errors.push(format!(
                "scid_length ({}) exceeds the maximum of {}",
                self.scid_length, MAX_CID_LENGTH
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.drain_timeout(), Duration::from_secs(3));
        assert_eq!(config.max_udp_payload_size, 1200);
        assert_eq!(config.scid_length, 18);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_all_reported() {
        let config = ConnectionConfig {
            max_udp_payload_size: 500,
            max_datagrams_per_poll: 0,
            scid_length: 21,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("max_udp_payload_size")));
        assert!(errors.iter().any(|e| e.contains("max_datagrams_per_poll")));
        assert!(errors.iter().any(|e| e.contains("scid_length")));
    }

    #[test]
    fn test_stream_window_larger_than_connection_window_rejected() {
        let config = ConnectionConfig {
            initial_max_data: 10,
            initial_max_stream_data: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_transport_parameters_mirror_config() {
        let config = ConnectionConfig {
            idle_timeout_ms: 0,
            max_streams_bidi: 7,
            ..Default::default()
        };
        let params = config.local_transport_parameters();
        assert_eq!(params.initial_max_streams_bidi, 7);
        assert_eq!(params.idle_timeout(), None);
    }
}
