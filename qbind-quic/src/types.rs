//! # Core Types
//!
//! Identifiers and clock types shared by every layer of the binding.
//! Nothing here touches the wire; the packet engine owns encoding.

#![forbid(unsafe_code)]

use bytes::Bytes;
use core::time::Duration;
use serde::{Deserialize, Serialize};

// ============================================================================
// Connection ID (RFC 9000 Section 5.1)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000)
pub const MAX_CID_LENGTH: usize = 20;

/// Connection ID
///
/// Opaque byte sequence chosen by an endpoint. Zero-length IDs are valid.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes
    ///
    /// Returns None if length exceeds MAX_CID_LENGTH
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Self::new(Bytes::copy_from_slice(slice))
    }

    /// Access the underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero-length connection ID
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({:02x?})", &self.bytes[..])
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

// ============================================================================
// Side and stream direction
// ============================================================================

/// Connection endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    /// Get the opposite side
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Both endpoints send
    Bidirectional,
    /// Only the initiator sends
    Unidirectional,
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Maximum Stream ID value (2^62 - 1)
pub const MAX_STREAM_ID: u64 = (1u64 << 62) - 1;

/// Stream ID
///
/// The two least significant bits encode initiator and direction:
/// - Bit 0: Initiator (0=client, 1=server)
/// - Bit 1: Direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Build the `index`-th stream ID of the given initiator and direction.
    pub fn from_parts(initiator: Side, direction: StreamDirection, index: u64) -> Self {
        let mut low = 0u64;
        if initiator.is_server() {
            low |= 0x01;
        }
        if direction == StreamDirection::Unidirectional {
            low |= 0x02;
        }
        Self((index << 2) | low)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Which side opened the stream
    pub fn initiator(&self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn direction(&self) -> StreamDirection {
        if self.0 & 0x02 == 0 {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        }
    }

    /// Sequence number within the (initiator, direction) class
    pub fn index(&self) -> u64 {
        self.0 >> 2
    }

    pub fn is_bidirectional(&self) -> bool {
        self.direction() == StreamDirection::Bidirectional
    }

    pub fn is_unidirectional(&self) -> bool {
        !self.is_bidirectional()
    }

    /// Whether `side` opened this stream
    pub fn is_local(&self, side: Side) -> bool {
        self.initiator() == side
    }
}

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset within a stream
pub type StreamOffset = u64;

// ============================================================================
// Time Abstraction
// ============================================================================

/// Monotonic timestamp supplied by the host
///
/// The binding never reads a clock itself; every entry point takes `now`.
/// This keeps connections deterministic under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant {
    /// Nanoseconds since an arbitrary epoch
    nanos: u64,
}

impl Instant {
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Duration since another instant, or None if `other` is later
    pub fn duration_since(&self, other: Instant) -> Option<Duration> {
        self.nanos
            .checked_sub(other.nanos)
            .map(Duration::from_nanos)
    }

    /// Duration from `self` until `other`, saturating at zero
    pub fn saturating_duration_until(&self, other: Instant) -> Duration {
        other.duration_since(*self).unwrap_or(Duration::ZERO)
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        let nanos = u64::try_from(duration.as_nanos()).ok()?;
        self.nanos.checked_add(nanos).map(Instant::from_nanos)
    }

    /// Add a duration, clamping at the far future
    pub fn saturating_add(&self, duration: Duration) -> Instant {
        self.checked_add(duration)
            .unwrap_or(Instant::from_nanos(u64::MAX))
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Default UDP payload size (1200 bytes per RFC 9000 Section 14.1)
pub const DEFAULT_MAX_UDP_PAYLOAD_SIZE: usize = 1200;

/// Default locally chosen connection ID length
pub const DEFAULT_SCID_LENGTH: usize = 18;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_parity() {
        let id = StreamId::from_parts(Side::Client, StreamDirection::Bidirectional, 0);
        assert_eq!(id, StreamId(0));
        assert_eq!(id.initiator(), Side::Client);
        assert!(id.is_bidirectional());

        let id = StreamId::from_parts(Side::Server, StreamDirection::Bidirectional, 0);
        assert_eq!(id, StreamId(1));

        let id = StreamId::from_parts(Side::Client, StreamDirection::Unidirectional, 0);
        assert_eq!(id, StreamId(2));
        assert!(id.is_unidirectional());

        let id = StreamId::from_parts(Side::Server, StreamDirection::Unidirectional, 2);
        assert_eq!(id, StreamId(11));
        assert_eq!(id.index(), 2);
        assert_eq!(id.initiator(), Side::Server);
    }

    #[test]
    fn test_stream_id_is_local() {
        assert!(StreamId(4).is_local(Side::Client));
        assert!(!StreamId(4).is_local(Side::Server));
        assert!(StreamId(7).is_local(Side::Server));
    }

    #[test]
    fn test_cid_too_long_fails() {
        assert!(ConnectionId::from_slice(&[0u8; MAX_CID_LENGTH]).is_some());
        assert!(ConnectionId::from_slice(&[0u8; MAX_CID_LENGTH + 1]).is_none());
        assert!(ConnectionId::empty().is_empty());
    }

    #[test]
    fn test_cid_display_is_hex() {
        let cid = ConnectionId::from_slice(&[0xab, 0x01]).unwrap();
        assert_eq!(cid.to_string(), "ab01");
    }

    #[test]
    fn test_instant_arithmetic() {
        let t0 = Instant::from_millis(10);
        let t1 = t0.checked_add(Duration::from_millis(5)).unwrap();
        assert_eq!(t1.duration_since(t0), Some(Duration::from_millis(5)));
        assert_eq!(t0.duration_since(t1), None);
        assert_eq!(t1.saturating_duration_until(t0), Duration::ZERO);
        assert_eq!(
            Instant::from_nanos(u64::MAX - 1).saturating_add(Duration::from_secs(1)),
            Instant::from_nanos(u64::MAX)
        );
    }
}
