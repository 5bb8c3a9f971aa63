//! # Packet Engine Adapter
//!
//! Seam between the binding and the external QUIC packet engine.
//!
//! The engine owns wire encoding, TLS, loss recovery and congestion control.
//! It is driven synchronously: `read_datagram` hands it one UDP payload and
//! the engine records what it learned as [`EngineCallback`]s, which the
//! adapter drains; `write_datagram` pulls one outbound datagram at a time.
//! Nothing here reassembles or reorders: the engine's own verdict is the only
//! one surfaced.
//!
//! Each connection owns its engine instance exclusively.

#![forbid(unsafe_code)]

pub mod scripted;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{trace, warn};

use crate::error::{TransportError, TransportErrorCode};
use crate::params::TransportParameters;
use crate::types::{Instant, StreamDirection, StreamId, StreamOffset};

pub use scripted::{decode_frames, Frame, Reaction, ScriptedEngine};

/// Typed callback recorded by the engine while processing input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCallback {
    /// Handshake confirmed; carries the peer's transport parameters
    HandshakeCompleted { peer_params: TransportParameters },

    /// In-order stream data (STREAM frame payload after reassembly)
    StreamData {
        stream_id: StreamId,
        offset: StreamOffset,
        data: Bytes,
        fin: bool,
    },

    /// RESET_STREAM
    StreamReset {
        stream_id: StreamId,
        error_code: u64,
        final_size: StreamOffset,
    },

    /// STOP_SENDING
    StopSending { stream_id: StreamId, error_code: u64 },

    /// MAX_STREAM_DATA
    MaxStreamData { stream_id: StreamId, limit: u64 },

    /// MAX_DATA
    MaxData { limit: u64 },

    /// MAX_STREAMS
    MaxStreams { direction: StreamDirection, max: u64 },

    /// Peer acknowledged `len` more bytes of stream data
    StreamAcked { stream_id: StreamId, len: u64 },

    /// Peer sent CONNECTION_CLOSE
    ConnectionClose { error_code: u64, reason: Bytes },
}

/// Raw engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("malformed packet")]
    Malformed,

    /// TLS alert raised during the handshake
    #[error("crypto failure (alert {alert})")]
    Crypto { alert: u8 },

    #[error("version negotiation required")]
    VersionNegotiation,

    #[error("out of memory")]
    OutOfMemory,

    /// Any other engine-detected violation, with its transport error code
    #[error("protocol error (code 0x{code:x})")]
    Protocol { code: u64 },
}

impl From<EngineError> for TransportError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Malformed => TransportError::MalformedPacket,
            EngineError::Crypto { alert } => TransportError::HandshakeFailure {
                code: TransportErrorCode::CryptoError.code() + u64::from(alert),
            },
            EngineError::VersionNegotiation => TransportError::VersionMismatch,
            EngineError::OutOfMemory => TransportError::ResourceExhausted,
            EngineError::Protocol { code } => TransportError::ProtocolViolation { code },
        }
    }
}

/// External QUIC packet engine.
///
/// Implementations are driven from one thread at a time; the trait has no
/// `Sync` requirement.
pub trait PacketEngine {
    /// Process one inbound UDP payload.
    fn read_datagram(&mut self, datagram: &[u8], now: Instant) -> Result<(), EngineError>;

    /// Next callback recorded since the last poll
    fn poll_callback(&mut self) -> Option<EngineCallback>;

    /// Write at most one datagram of at most `max_len` bytes into `out`.
    ///
    /// Returns the number of bytes written; 0 means nothing to send.
    fn write_datagram(
        &mut self,
        out: &mut BytesMut,
        max_len: usize,
        now: Instant,
    ) -> Result<usize, EngineError>;

    /// Queue stream data for transmission
    fn submit_stream_data(&mut self, stream_id: StreamId, data: Bytes, fin: bool);

    /// Send RESET_STREAM
    fn shutdown_stream_write(&mut self, stream_id: StreamId, error_code: u64);

    /// Send STOP_SENDING
    fn shutdown_stream_read(&mut self, stream_id: StreamId, error_code: u64);

    /// Grant the peer `len` more bytes on `stream_id`
    fn extend_stream_offset(&mut self, stream_id: StreamId, len: u64);

    /// Grant the peer `len` more bytes on the connection
    fn extend_connection_offset(&mut self, len: u64);

    /// Queue CONNECTION_CLOSE
    fn close(&mut self, error_code: u64, reason: &[u8]);

    /// Deadline of the engine's loss-recovery and ack timers
    fn expiry(&self) -> Option<Instant>;

    fn handle_expiry(&mut self, now: Instant) -> Result<(), EngineError>;
}

/// Drives a [`PacketEngine`] for one connection
#[derive(Debug)]
pub struct EngineAdapter<E> {
    engine: E,
    max_udp_payload_size: usize,
    max_datagrams_per_poll: usize,
}

impl<E: PacketEngine> EngineAdapter<E> {
    pub fn new(engine: E, max_udp_payload_size: usize, max_datagrams_per_poll: usize) -> Self {
        Self {
            engine,
            max_udp_payload_size,
            max_datagrams_per_poll,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Feed one datagram to the engine and collect what it produced.
    ///
    /// On rejection the error is returned and any callbacks the engine
    /// recorded before rejecting stay queued for [`drain_callbacks`](Self::drain_callbacks).
    pub fn ingest(
        &mut self,
        datagram: &[u8],
        now: Instant,
    ) -> Result<Vec<EngineCallback>, TransportError> {
        trace!(len = datagram.len(), "ingest datagram");
        if let Err(err) = self.engine.read_datagram(datagram, now) {
            let err = TransportError::from(err);
            if err.is_fatal() {
                warn!(error = %err, "engine rejected datagram");
            } else {
                trace!(error = %err, "engine rejected datagram");
            }
            return Err(err);
        }
        Ok(self.drain_callbacks())
    }

    /// Callbacks still queued in the engine
    pub fn drain_callbacks(&mut self) -> Vec<EngineCallback> {
        std::iter::from_fn(|| self.engine.poll_callback()).collect()
    }

    /// Pull outbound datagrams, bounded by the per-poll limit.
    pub fn produce_datagrams(&mut self, now: Instant) -> Result<Vec<Bytes>, TransportError> {
        let max_len = self.max_udp_payload_size;
        let mut datagrams = Vec::new();

        while datagrams.len() < self.max_datagrams_per_poll {
            let mut buf = BytesMut::with_capacity(max_len);
            let written = self.engine.write_datagram(&mut buf, max_len, now)?;
            if written == 0 {
                break;
            }
            if written > max_len || written > buf.len() {
                return Err(TransportError::ProtocolViolation {
                    code: TransportErrorCode::InternalError.code(),
                });
            }
            buf.truncate(written);
            datagrams.push(buf.freeze());
        }

        if !datagrams.is_empty() {
            trace!(count = datagrams.len(), "produced datagrams");
        }
        Ok(datagrams)
    }

    /// Run the engine's timers, returning callbacks they produced
    pub fn handle_expiry(&mut self, now: Instant) -> Result<Vec<EngineCallback>, TransportError> {
        self.engine.handle_expiry(now)?;
        Ok(self.drain_callbacks())
    }

    pub fn expiry(&self) -> Option<Instant> {
        self.engine.expiry()
    }
}
