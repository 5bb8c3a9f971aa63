//! # Transport Parameters (RFC 9000 Section 18)
//!
//! The subset of transport parameters the binding acts on. Encoding and
//! the handshake exchange belong to the packet engine; the engine hands the
//! peer's decoded values over when the handshake completes.

#![forbid(unsafe_code)]

use core::time::Duration;

/// Default initial connection-level credit (1 MiB)
pub const DEFAULT_INITIAL_MAX_DATA: u64 = 1024 * 1024;

/// Default initial stream-level credit (256 KiB)
pub const DEFAULT_INITIAL_MAX_STREAM_DATA: u64 = 256 * 1024;

/// Default concurrent bidirectional streams
pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;

/// Default concurrent unidirectional streams
pub const DEFAULT_MAX_STREAMS_UNI: u64 = 100;

/// Default idle timeout advertised to the peer
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport parameters relevant to stream orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParameters {
    /// Idle timeout in milliseconds; 0 disables it
    pub max_idle_timeout_ms: u64,

    // Flow Control
    pub initial_max_data: u64,
    /// Credit for streams opened by the sender of these parameters
    pub initial_max_stream_data_bidi_local: u64,
    /// Credit for streams opened by the receiver of these parameters
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,

    // Stream Limits
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            max_idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            initial_max_data: DEFAULT_INITIAL_MAX_DATA,
            initial_max_stream_data_bidi_local: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_stream_data_bidi_remote: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_stream_data_uni: DEFAULT_INITIAL_MAX_STREAM_DATA,
            initial_max_streams_bidi: DEFAULT_MAX_STREAMS_BIDI,
            initial_max_streams_uni: DEFAULT_MAX_STREAMS_UNI,
        }
    }
}

impl TransportParameters {
    /// Idle timeout, or None when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.max_idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Effective idle timeout (RFC 9000 Section 10.1)
///
/// Minimum of the two advertised values, ignoring zeros. None when both
/// endpoints disabled it.
pub fn negotiate_idle_timeout(
    local: Option<Duration>,
    peer: Option<Duration>,
) -> Option<Duration> {
    match (local, peer) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
