//! Deterministic in-process packet engine.
//!
//! Reacts to each inbound datagram with a pre-scripted list of callbacks
//! (or an error) and serializes outbound work into a small frame format
//! that [`decode_frames`] reads back. Useful as a loopback engine and for
//! exercising connection logic without a real QUIC stack.
//!
//! Frame layout (big endian):
//!
//! | type            | body                                  |
//! |-----------------|---------------------------------------|
//! | `0x08` / `0x09` | stream id u64, len u16, payload (0x09 = FIN) |
//! | `0x04`          | stream id u64, error code u64         |
//! | `0x05`          | stream id u64, error code u64         |
//! | `0x1c`          | error code u64, len u16, reason       |

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{EngineCallback, EngineError, PacketEngine};
use crate::types::{Instant, StreamId};

const FRAME_STREAM: u8 = 0x08;
const FRAME_STREAM_FIN: u8 = 0x09;
const FRAME_RESET_STREAM: u8 = 0x04;
const FRAME_STOP_SENDING: u8 = 0x05;
const FRAME_CONNECTION_CLOSE: u8 = 0x1c;

const STREAM_HEADER_LEN: usize = 1 + 8 + 2;

/// Frame decoded from a datagram written by [`ScriptedEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    ResetStream {
        stream_id: StreamId,
        error_code: u64,
    },
    StopSending {
        stream_id: StreamId,
        error_code: u64,
    },
    ConnectionClose {
        error_code: u64,
        reason: Bytes,
    },
}

/// Decode every complete frame in `datagram`; stops at the first unknown
/// or truncated one.
pub fn decode_frames(datagram: &[u8]) -> Vec<Frame> {
    let mut buf = datagram;
    let mut frames = Vec::new();

    while buf.has_remaining() {
        let ty = buf.get_u8();
        let frame = match ty {
            FRAME_STREAM | FRAME_STREAM_FIN => {
                if buf.remaining() < 10 {
                    break;
                }
                let stream_id = StreamId(buf.get_u64());
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    break;
                }
                let data = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                Frame::Stream {
                    stream_id,
                    data,
                    fin: ty == FRAME_STREAM_FIN,
                }
            }
            FRAME_RESET_STREAM | FRAME_STOP_SENDING => {
                if buf.remaining() < 16 {
                    break;
                }
                let stream_id = StreamId(buf.get_u64());
                let error_code = buf.get_u64();
                if ty == FRAME_RESET_STREAM {
                    Frame::ResetStream {
                        stream_id,
                        error_code,
                    }
                } else {
                    Frame::StopSending {
                        stream_id,
                        error_code,
                    }
                }
            }
            FRAME_CONNECTION_CLOSE => {
                if buf.remaining() < 10 {
                    break;
                }
                let error_code = buf.get_u64();
                let len = buf.get_u16() as usize;
                if buf.remaining() < len {
                    break;
                }
                let reason = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                Frame::ConnectionClose { error_code, reason }
            }
            _ => break,
        };
        frames.push(frame);
    }

    frames
}

/// Scripted response to a datagram or timer expiry
pub type Reaction = Result<Vec<EngineCallback>, EngineError>;

#[derive(Debug)]
enum Outbound {
    Stream {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    Control(Bytes),
}

/// Scripted [`PacketEngine`]
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    datagram_reactions: VecDeque<Reaction>,
    timeout_reactions: VecDeque<Reaction>,
    callbacks: VecDeque<EngineCallback>,
    outbound: VecDeque<Outbound>,
    received: Vec<Bytes>,

    close_frame: Option<Bytes>,
    close_sent: bool,
    write_failure: Option<EngineError>,
    expiry: Option<Instant>,

    stream_credit: HashMap<StreamId, u64>,
    connection_credit: u64,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reaction to the next unscripted inbound datagram
    pub fn expect_datagram(&mut self, reaction: Reaction) -> &mut Self {
        self.datagram_reactions.push_back(reaction);
        self
    }

    /// Reaction to the next `handle_expiry`
    pub fn expect_timeout(&mut self, reaction: Reaction) -> &mut Self {
        self.timeout_reactions.push_back(reaction);
        self
    }

    /// Queue a callback for the next drain
    pub fn push_callback(&mut self, callback: EngineCallback) -> &mut Self {
        self.callbacks.push_back(callback);
        self
    }

    /// Make the next `write_datagram` fail
    pub fn fail_next_write(&mut self, err: EngineError) -> &mut Self {
        self.write_failure = Some(err);
        self
    }

    pub fn set_expiry(&mut self, expiry: Option<Instant>) -> &mut Self {
        self.expiry = expiry;
        self
    }

    /// Every datagram handed to `read_datagram`
    pub fn received(&self) -> &[Bytes] {
        &self.received
    }

    /// Total receive credit granted on `stream_id`
    pub fn stream_credit(&self, stream_id: StreamId) -> u64 {
        self.stream_credit.get(&stream_id).copied().unwrap_or(0)
    }

    /// Total connection receive credit granted
    pub fn connection_credit(&self) -> u64 {
        self.connection_credit
    }

    pub fn is_closing(&self) -> bool {
        self.close_frame.is_some()
    }

    fn control(&mut self, ty: u8, stream_id: StreamId, error_code: u64) {
        let mut frame = BytesMut::with_capacity(17);
        frame.put_u8(ty);
        frame.put_u64(stream_id.value());
        frame.put_u64(error_code);
        self.outbound.push_back(Outbound::Control(frame.freeze()));
    }
}

impl PacketEngine for ScriptedEngine {
    fn read_datagram(&mut self, datagram: &[u8], _now: Instant) -> Result<(), EngineError> {
        self.received.push(Bytes::copy_from_slice(datagram));
        match self.datagram_reactions.pop_front() {
            Some(Ok(callbacks)) => {
                self.callbacks.extend(callbacks);
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }

    fn poll_callback(&mut self) -> Option<EngineCallback> {
        self.callbacks.pop_front()
    }

    fn write_datagram(
        &mut self,
        out: &mut BytesMut,
        max_len: usize,
        _now: Instant,
    ) -> Result<usize, EngineError> {
        if let Some(err) = self.write_failure.take() {
            return Err(err);
        }

        if let Some(close) = &self.close_frame {
            if self.close_sent || close.len() > max_len {
                return Ok(0);
            }
            out.extend_from_slice(close);
            self.close_sent = true;
            return Ok(close.len());
        }

        let start = out.len();
        while let Some(item) = self.outbound.front_mut() {
            let room = max_len - (out.len() - start);
            let done = match item {
                Outbound::Control(frame) => {
                    if frame.len() > room {
                        break;
                    }
                    out.extend_from_slice(frame);
                    true
                }
                Outbound::Stream {
                    stream_id,
                    data,
                    fin,
                } => {
                    if data.is_empty() && !*fin {
                        true
                    } else {
                        if room < STREAM_HEADER_LEN || (room == STREAM_HEADER_LEN && !data.is_empty()) {
                            break;
                        }
                        let take = data
                            .len()
                            .min(room - STREAM_HEADER_LEN)
                            .min(u16::MAX as usize);
                        let chunk = data.split_to(take);
                        let last = data.is_empty();
                        out.put_u8(if *fin && last {
                            FRAME_STREAM_FIN
                        } else {
                            FRAME_STREAM
                        });
                        out.put_u64(stream_id.value());
                        out.put_u16(chunk.len() as u16);
                        out.extend_from_slice(&chunk);
                        last
                    }
                }
            };
            if !done {
                break;
            }
            self.outbound.pop_front();
        }

        Ok(out.len() - start)
    }

    fn submit_stream_data(&mut self, stream_id: StreamId, data: Bytes, fin: bool) {
        self.outbound.push_back(Outbound::Stream {
            stream_id,
            data,
            fin,
        });
    }

    fn shutdown_stream_write(&mut self, stream_id: StreamId, error_code: u64) {
        self.outbound.retain(|item| {
            !matches!(item, Outbound::Stream { stream_id: id, .. } if *id == stream_id)
        });
        self.control(FRAME_RESET_STREAM, stream_id, error_code);
    }

    fn shutdown_stream_read(&mut self, stream_id: StreamId, error_code: u64) {
        self.control(FRAME_STOP_SENDING, stream_id, error_code);
    }

    fn extend_stream_offset(&mut self, stream_id: StreamId, len: u64) {
        *self.stream_credit.entry(stream_id).or_default() += len;
    }

    fn extend_connection_offset(&mut self, len: u64) {
        self.connection_credit += len;
    }

    fn close(&mut self, error_code: u64, reason: &[u8]) {
        if self.close_frame.is_some() {
            return;
        }
        let reason = &reason[..reason.len().min(u16::MAX as usize)];
        let mut frame = BytesMut::with_capacity(11 + reason.len());
        frame.put_u8(FRAME_CONNECTION_CLOSE);
        frame.put_u64(error_code);
        frame.put_u16(reason.len() as u16);
        frame.extend_from_slice(reason);
        self.close_frame = Some(frame.freeze());
        self.outbound.clear();
    }

    fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    fn handle_expiry(&mut self, _now: Instant) -> Result<(), EngineError> {
        self.expiry = None;
        match self.timeout_reactions.pop_front() {
            Some(Ok(callbacks)) => {
                self.callbacks.extend(callbacks);
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(engine: &mut ScriptedEngine, max_len: usize) -> Vec<Bytes> {
        let mut datagrams = Vec::new();
        loop {
            let mut buf = BytesMut::new();
            let n = engine
                .write_datagram(&mut buf, max_len, Instant::from_millis(0))
                .unwrap();
            if n == 0 {
                return datagrams;
            }
            datagrams.push(buf.freeze());
        }
    }

    #[test]
    fn test_stream_frames_split_and_keep_fin_on_last() {
        let mut engine = ScriptedEngine::new();
        engine.submit_stream_data(StreamId(4), Bytes::from_static(b"abcdefghij"), true);

        let datagrams = drain(&mut engine, STREAM_HEADER_LEN + 4);
        let frames: Vec<Frame> = datagrams.iter().flat_map(|d| decode_frames(d)).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[2],
            Frame::Stream {
                stream_id: StreamId(4),
                data: Bytes::from_static(b"ij"),
                fin: true
            }
        );
        assert!(frames[..2]
            .iter()
            .all(|f| matches!(f, Frame::Stream { fin: false, .. })));
    }

    #[test]
    fn test_bare_fin_is_written() {
        let mut engine = ScriptedEngine::new();
        engine.submit_stream_data(StreamId(0), Bytes::new(), true);
        let datagrams = drain(&mut engine, 1200);
        assert_eq!(
            decode_frames(&datagrams[0]),
            vec![Frame::Stream {
                stream_id: StreamId(0),
                data: Bytes::new(),
                fin: true
            }]
        );
    }

    #[test]
    fn test_close_is_written_once_and_drops_pending_data() {
        let mut engine = ScriptedEngine::new();
        engine.submit_stream_data(StreamId(0), Bytes::from_static(b"late"), false);
        engine.close(0x0a, b"bye");

        let datagrams = drain(&mut engine, 1200);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(
            decode_frames(&datagrams[0]),
            vec![Frame::ConnectionClose {
                error_code: 0x0a,
                reason: Bytes::from_static(b"bye")
            }]
        );
    }

    #[test]
    fn test_reset_drops_queued_stream_data() {
        let mut engine = ScriptedEngine::new();
        engine.submit_stream_data(StreamId(0), Bytes::from_static(b"gone"), false);
        engine.shutdown_stream_write(StreamId(0), 7);

        let datagrams = drain(&mut engine, 1200);
        assert_eq!(
            decode_frames(&datagrams[0]),
            vec![Frame::ResetStream {
                stream_id: StreamId(0),
                error_code: 7
            }]
        );
    }

    #[test]
    fn test_scripted_reactions_in_order() {
        let mut engine = ScriptedEngine::new();
        engine
            .expect_datagram(Err(EngineError::Malformed))
            .expect_datagram(Ok(vec![EngineCallback::MaxData { limit: 5 }]));

        let now = Instant::from_millis(0);
        assert_eq!(engine.read_datagram(b"a", now), Err(EngineError::Malformed));
        assert_eq!(engine.read_datagram(b"b", now), Ok(()));
        assert_eq!(
            engine.poll_callback(),
            Some(EngineCallback::MaxData { limit: 5 })
        );
        assert_eq!(engine.received().len(), 2);
    }
}
