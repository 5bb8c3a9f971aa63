//! # Stream Registry
//!
//! Owns every live stream of one connection, keyed by stream ID, together
//! with the connection-level flow-control windows.
//!
//! The registry never talks to the packet engine. Operations that produce
//! engine work return it (`WriteOutcome`, released credit) and the
//! connection forwards it. Stream events are queued internally in generation
//! order and drained by the connection into the event dispatcher.
//!
//! ## Stream Limits
//!
//! `open_stream` is bounded by the number of *concurrently live*
//! locally-initiated streams per direction against the peer's advertised
//! maximum. A destroyed stream frees its slot. Stream IDs are still
//! allocated monotonically and never reused.
//!
//! ## Blocked Streams
//!
//! A write that runs out of credit (refused or short) parks the stream in a
//! FIFO. When credit arrives the stream is reported writable exactly once.
//! Per-stream credit updates wake streams in the order the engine reported
//! them; a connection-level update wakes parked streams in the order they
//! were parked.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use super::buffer::{RecvBuffer, SendBuffer};
use super::state::{RecvState, SendState, StreamStatus};
use crate::error::{Error, Result, TransportError, TransportErrorCode};
use crate::event::Event;
use crate::flow_control::{ConnectionFlowControl, RecvWindow, SendWindow};
use crate::params::TransportParameters;
use crate::types::{Side, StreamDirection, StreamId, StreamOffset, MAX_STREAM_ID};

#[derive(Debug, Clone, Copy, Default)]
struct PerDirection<T> {
    bidi: T,
    uni: T,
}

impl<T> PerDirection<T> {
    fn get(&self, direction: StreamDirection) -> &T {
        match direction {
            StreamDirection::Bidirectional => &self.bidi,
            StreamDirection::Unidirectional => &self.uni,
        }
    }

    fn get_mut(&mut self, direction: StreamDirection) -> &mut T {
        match direction {
            StreamDirection::Bidirectional => &mut self.bidi,
            StreamDirection::Unidirectional => &mut self.uni,
        }
    }
}

#[derive(Debug)]
struct SendHalf {
    state: SendState,
    window: SendWindow,
    buffer: SendBuffer,
    blocked: bool,
}

#[derive(Debug)]
struct RecvHalf {
    state: RecvState,
    window: RecvWindow,
    buffer: RecvBuffer,

    /// Abandoned by STOP_SENDING before the final size was known. Offsets
    /// are still counted against connection credit until the peer's
    /// RESET_STREAM or FIN settles the final size.
    stopped: bool,
}

#[derive(Debug)]
struct Stream {
    send: Option<SendHalf>,
    recv: Option<RecvHalf>,
}

impl Stream {
    fn status(&self) -> StreamStatus {
        StreamStatus {
            send: self.send.as_ref().map(|s| s.state),
            recv: self.recv.as_ref().map(|r| r.state),
        }
    }

    /// Both halves terminal and nothing left for the application
    fn is_done(&self) -> bool {
        self.status().is_terminal()
            && self
                .recv
                .as_ref()
                .map_or(true, |r| r.buffer.is_empty() && !r.stopped)
    }
}

/// Result of an accepted `write`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes accepted; may be less than requested
    pub accepted: usize,

    /// Accepted prefix, to be handed to the engine
    pub chunk: Bytes,

    /// FIN accepted with this chunk
    pub fin: bool,
}

/// Result of a `read`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub data: Bytes,

    /// Every byte of the stream has now been read
    pub fin: bool,
}

#[derive(Debug)]
pub struct StreamRegistry {
    side: Side,
    streams: BTreeMap<StreamId, Stream>,

    next_local: PerDirection<u64>,
    next_remote: PerDirection<u64>,
    live_local: PerDirection<u64>,
    live_remote: PerDirection<u64>,

    /// Concurrent streams the peer lets us open
    peer_max_streams: PerDirection<u64>,
    /// Concurrent streams we let the peer open
    local_max_streams: PerDirection<u64>,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    flow: ConnectionFlowControl,
    blocked: VecDeque<StreamId>,
    events: VecDeque<Event>,

    /// Set once the connection is closed; no stream may change state after
    frozen: bool,
}

impl StreamRegistry {
    /// Create an empty registry.
    ///
    /// Send credit and the peer's stream limits stay at zero until
    /// [`on_handshake_completed`](Self::on_handshake_completed) supplies the
    /// peer's transport parameters.
    pub fn new(side: Side, local_params: TransportParameters) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            next_local: PerDirection::default(),
            next_remote: PerDirection::default(),
            live_local: PerDirection::default(),
            live_remote: PerDirection::default(),
            peer_max_streams: PerDirection::default(),
            local_max_streams: PerDirection {
                bidi: local_params.initial_max_streams_bidi,
                uni: local_params.initial_max_streams_uni,
            },
            local_params,
            peer_params: None,
            flow: ConnectionFlowControl::new(0, local_params.initial_max_data),
            blocked: VecDeque::new(),
            events: VecDeque::new(),
            frozen: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamStatus> {
        self.streams.get(&id).map(Stream::status)
    }

    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    pub fn connection_flow(&self) -> &ConnectionFlowControl {
        &self.flow
    }

    /// Drain queued stream events in generation order
    pub fn take_events(&mut self) -> std::collections::vec_deque::Drain<'_, Event> {
        self.events.drain(..)
    }

    /// Stop all further state transitions
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.blocked.clear();
    }

    /// Whether accepted bytes are still waiting for acknowledgement
    pub fn writes_incomplete(&self) -> bool {
        self.streams.values().any(|s| {
            s.send
                .as_ref()
                .map_or(false, |send| send.state != SendState::ResetSent && send.buffer.unacked() > 0)
        })
    }

    /// Streams that still hold unread data
    pub fn readable_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|(_, s)| s.recv.as_ref().map_or(false, |r| !r.buffer.is_empty()))
            .map(|(id, _)| *id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------

    /// Open a locally-initiated stream.
    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId> {
        if self.frozen {
            return Err(Error::ConnectionClosed);
        }
        if self.available(direction) == 0 {
            return Err(Error::StreamLimitExceeded);
        }

        let index = *self.next_local.get(direction);
        let id = StreamId::from_parts(self.side, direction, index);
        if id.value() > MAX_STREAM_ID {
            return Err(Error::StreamLimitExceeded);
        }

        *self.next_local.get_mut(direction) += 1;
        *self.live_local.get_mut(direction) += 1;
        let stream = self.new_stream(id);
        self.streams.insert(id, stream);

        debug!(stream_id = %id, ?direction, "stream opened");
        Ok(id)
    }

    /// Accept as much of `data` as current credit allows.
    ///
    /// `fin` takes effect only when every byte is accepted. A refused or
    /// short write parks the stream until credit arrives.
    pub fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<WriteOutcome> {
        if self.frozen {
            return Err(Error::ConnectionClosed);
        }

        let conn_credit = self.flow.send.credit();
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.missing(id));
        };
        let Some(send) = stream.send.as_mut() else {
            return Err(Error::InvalidInput);
        };
        if !send.state.is_writable() {
            return Err(Error::StreamClosed);
        }

        let want = data.len() as u64;
        let granted = want.min(send.window.credit()).min(conn_credit);

        if granted < want && !send.blocked {
            send.blocked = true;
            self.blocked.push_back(id);
            trace!(stream_id = %id, want, granted, "stream blocked on flow control");
        }
        if want > 0 && granted == 0 {
            return Err(Error::FlowControlBlocked);
        }

        send.window.reserve(granted);
        self.flow.send.reserve(granted);
        send.buffer.append(granted as usize);

        let fin = fin && granted == want;
        if fin {
            send.buffer.finish();
            send.state = SendState::DataSent;
        } else if granted > 0 {
            send.state = SendState::Send;
        }

        let accepted = granted as usize;
        Ok(WriteOutcome {
            accepted,
            chunk: Bytes::copy_from_slice(&data[..accepted]),
            fin,
        })
    }

    /// Read up to `max_len` bytes.
    ///
    /// After the connection is frozen, buffered data stays readable and no
    /// credit is released. A FIN that arrived before the freeze is still
    /// reported once; after that an empty buffer reports `ConnectionClosed`.
    pub fn read(&mut self, id: StreamId, max_len: usize) -> Result<ReadOutcome> {
        if max_len == 0 {
            return Err(Error::InvalidInput);
        }

        let frozen = self.frozen;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(if frozen {
                Error::ConnectionClosed
            } else {
                self.missing(id)
            });
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(Error::InvalidInput);
        };

        if frozen {
            if recv.buffer.is_empty() && recv.state != RecvState::SizeKnown {
                return Err(Error::ConnectionClosed);
            }
            let data = recv.buffer.read(max_len);
            let fin = recv.state == RecvState::SizeKnown && recv.buffer.is_empty();
            if fin {
                recv.state = RecvState::DataRecvd;
            }
            return Ok(ReadOutcome { data, fin });
        }

        if recv.state.is_terminal() {
            return Err(Error::StreamClosed);
        }
        if recv.buffer.is_empty() && recv.state != RecvState::SizeKnown {
            return Err(Error::WouldBlock);
        }

        let data = recv.buffer.read(max_len);
        let n = data.len() as u64;
        recv.window.on_read(n);
        self.flow.recv.on_read(n);

        let fin = recv.state == RecvState::SizeKnown && recv.buffer.is_empty();
        if fin {
            recv.state = RecvState::DataRecvd;
        }

        self.reap(id);
        Ok(ReadOutcome { data, fin })
    }

    /// Abandon the send side (RESET_STREAM); unacknowledged bytes are dropped
    pub fn reset_stream(&mut self, id: StreamId) -> Result<()> {
        if self.frozen {
            return Err(Error::ConnectionClosed);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.missing(id));
        };
        let Some(send) = stream.send.as_mut() else {
            return Err(Error::InvalidInput);
        };
        if send.state.is_terminal() {
            return Err(Error::StreamClosed);
        }

        send.state = SendState::ResetSent;
        send.buffer.abandon();
        if send.blocked {
            send.blocked = false;
            self.blocked.retain(|s| *s != id);
        }

        self.reap(id);
        Ok(())
    }

    /// Abandon the receive side (STOP_SENDING); buffered data is discarded.
    ///
    /// Returns the credit released by the discarded bytes. Until the final
    /// size is known the stream keeps counting the peer's bytes, so the
    /// rest of the connection credit comes back with RESET_STREAM or FIN.
    pub fn stop_sending(&mut self, id: StreamId) -> Result<u64> {
        if self.frozen {
            return Err(Error::ConnectionClosed);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(self.missing(id));
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(Error::InvalidInput);
        };
        if recv.state.is_terminal() {
            return Err(Error::StreamClosed);
        }

        let released = recv.buffer.discard() as u64;
        recv.window.on_read(released);
        self.flow.recv.on_read(released);
        recv.stopped = recv.buffer.final_size().is_none();
        recv.state = RecvState::ResetRecvd;

        self.reap(id);
        Ok(released)
    }

    /// Bytes `write` would accept right now
    pub fn send_capacity(&self, id: StreamId) -> Result<u64> {
        if self.frozen {
            return Err(Error::ConnectionClosed);
        }
        let Some(stream) = self.streams.get(&id) else {
            return Err(self.missing(id));
        };
        match stream.send.as_ref() {
            Some(send) if send.state.is_writable() => {
                Ok(send.window.credit().min(self.flow.send.credit()))
            }
            Some(_) => Err(Error::StreamClosed),
            None => Err(Error::InvalidInput),
        }
    }

    // ------------------------------------------------------------------
    // Engine callbacks
    // ------------------------------------------------------------------

    /// Apply the peer's transport parameters once the handshake completes
    pub fn on_handshake_completed(&mut self, peer: TransportParameters) {
        if self.frozen {
            return;
        }
        self.peer_params = Some(peer);
        self.flow.send.extend(peer.initial_max_data);

        let side = self.side;
        for (id, stream) in self.streams.iter_mut() {
            if let Some(send) = stream.send.as_mut() {
                send.window.extend(send_limit_for(side, Some(&peer), *id));
            }
        }

        self.raise_peer_max_streams(StreamDirection::Bidirectional, peer.initial_max_streams_bidi);
        self.raise_peer_max_streams(StreamDirection::Unidirectional, peer.initial_max_streams_uni);
        self.release_blocked();
    }

    /// Stream data delivered in order by the engine.
    ///
    /// Returns connection credit released on the spot, which is non-zero
    /// only for bytes arriving on a stream the application stopped.
    ///
    /// # Errors
    /// Protocol violations (flow control, final size, stream state or
    /// limit) that must close the connection.
    pub fn on_stream_data(
        &mut self,
        id: StreamId,
        offset: StreamOffset,
        data: Bytes,
        fin: bool,
    ) -> core::result::Result<u64, TransportError> {
        if self.frozen || !self.ensure_open(id)? {
            return Ok(0);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(0);
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(protocol(TransportErrorCode::StreamStateError));
        };
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| protocol(TransportErrorCode::FlowControlError))?;

        if recv.stopped {
            let released = settle_stopped(recv, &mut self.flow.recv, end, fin)?;
            self.reap(id);
            return Ok(released);
        }
        if recv.state.is_terminal() {
            trace!(stream_id = %id, "data for finished stream ignored");
            return Ok(0);
        }

        let previous = recv.window.received();
        recv.window.on_received(end)?;
        if end > previous {
            let total = self.flow.recv.received() + (end - previous);
            self.flow.recv.on_received(total)?;
        }

        let had_final_size = recv.buffer.final_size().is_some();
        let added = recv.buffer.insert(offset, data, fin)?;

        if added > 0 {
            self.events.push_back(Event::StreamReadable { stream_id: id });
        }
        if fin && !had_final_size {
            recv.state = RecvState::SizeKnown;
            self.events.push_back(Event::StreamFinished { stream_id: id });
        }
        Ok(0)
    }

    /// Peer reset its send side (RESET_STREAM).
    ///
    /// Returns the connection credit released, counting both discarded and
    /// never-received bytes up to the final size.
    pub fn on_stream_reset(
        &mut self,
        id: StreamId,
        error_code: u64,
        final_size: StreamOffset,
    ) -> core::result::Result<u64, TransportError> {
        if self.frozen || !self.ensure_open(id)? {
            return Ok(0);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(0);
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(protocol(TransportErrorCode::StreamStateError));
        };
        if recv.stopped {
            let released = settle_stopped(recv, &mut self.flow.recv, final_size, true)?;
            trace!(stream_id = %id, final_size, released, "stopped stream reset by peer");
            self.reap(id);
            return Ok(released);
        }
        if recv.state.is_terminal() {
            return Ok(0);
        }

        let final_size_moved = recv.buffer.final_size().map_or(false, |f| f != final_size);
        if final_size < recv.window.received() || final_size_moved {
            return Err(protocol(TransportErrorCode::FinalSizeError));
        }

        let previous = recv.window.received();
        recv.window.on_received(final_size)?;
        if final_size > previous {
            let total = self.flow.recv.received() + (final_size - previous);
            self.flow.recv.on_received(total)?;
        }

        recv.buffer.discard();
        let released = final_size - recv.window.consumed();
        recv.window.on_read(released);
        self.flow.recv.on_read(released);
        recv.state = RecvState::ResetRecvd;

        self.events.push_back(Event::StreamReset {
            stream_id: id,
            error_code,
        });
        self.reap(id);
        Ok(released)
    }

    /// Peer asked us to stop sending.
    ///
    /// Returns true when the send side was reset and the engine must be told.
    pub fn on_stop_sending(
        &mut self,
        id: StreamId,
        error_code: u64,
    ) -> core::result::Result<bool, TransportError> {
        if self.frozen || !self.ensure_open(id)? {
            return Ok(false);
        }
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(false);
        };
        let Some(send) = stream.send.as_mut() else {
            return Err(protocol(TransportErrorCode::StreamStateError));
        };
        if send.state.is_terminal() {
            return Ok(false);
        }

        send.state = SendState::ResetSent;
        send.buffer.abandon();
        if send.blocked {
            send.blocked = false;
            self.blocked.retain(|s| *s != id);
        }

        self.events.push_back(Event::StopSending {
            stream_id: id,
            error_code,
        });
        self.reap(id);
        Ok(true)
    }

    /// MAX_STREAM_DATA from the peer
    pub fn on_max_stream_data(&mut self, id: StreamId, limit: u64) {
        if self.frozen {
            return;
        }
        let conn_credit = self.flow.send.credit();
        let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) else {
            return;
        };
        if !send.window.extend(limit) {
            return;
        }
        if send.blocked && send.window.credit() > 0 && conn_credit > 0 {
            send.blocked = false;
            self.blocked.retain(|s| *s != id);
            self.events.push_back(Event::StreamWritable { stream_id: id });
        }
    }

    /// MAX_DATA from the peer
    pub fn on_max_data(&mut self, limit: u64) {
        if self.frozen {
            return;
        }
        if self.flow.send.extend(limit) {
            self.release_blocked();
        }
    }

    /// MAX_STREAMS from the peer
    pub fn on_max_streams(&mut self, direction: StreamDirection, max: u64) {
        if self.frozen {
            return;
        }
        self.raise_peer_max_streams(direction, max);
    }

    /// The engine reports `len` more bytes of `id` acknowledged
    pub fn on_stream_acked(&mut self, id: StreamId, len: u64) {
        if self.frozen {
            return;
        }
        let Some(send) = self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) else {
            return;
        };
        send.buffer.acknowledge(len);
        if send.state == SendState::DataSent && send.buffer.is_fully_acked() {
            send.state = SendState::DataRecvd;
        }
        self.reap(id);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn available(&self, direction: StreamDirection) -> u64 {
        self.peer_max_streams
            .get(direction)
            .saturating_sub(*self.live_local.get(direction))
    }

    fn raise_peer_max_streams(&mut self, direction: StreamDirection, max: u64) {
        if max <= *self.peer_max_streams.get(direction) {
            return;
        }
        let before = self.available(direction);
        *self.peer_max_streams.get_mut(direction) = max;
        if before == 0 && self.available(direction) > 0 {
            self.events.push_back(Event::StreamsAvailable { direction });
        }
    }

    fn new_stream(&self, id: StreamId) -> Stream {
        let local = id.is_local(self.side);
        let has_send = id.is_bidirectional() || local;
        let has_recv = id.is_bidirectional() || !local;

        let send = has_send.then(|| SendHalf {
            state: SendState::Ready,
            window: SendWindow::new(send_limit_for(self.side, self.peer_params.as_ref(), id)),
            buffer: SendBuffer::new(),
            blocked: false,
        });

        let recv = has_recv.then(|| {
            let window = match (id.direction(), local) {
                (StreamDirection::Unidirectional, _) => self.local_params.initial_max_stream_data_uni,
                (StreamDirection::Bidirectional, true) => {
                    self.local_params.initial_max_stream_data_bidi_local
                }
                (StreamDirection::Bidirectional, false) => {
                    self.local_params.initial_max_stream_data_bidi_remote
                }
            };
            RecvHalf {
                state: RecvState::Recv,
                window: RecvWindow::new(window),
                buffer: RecvBuffer::new(),
                stopped: false,
            }
        });

        Stream { send, recv }
    }

    /// Make sure a stream referenced by the peer exists.
    ///
    /// Opening a remote stream implicitly opens every lower-numbered stream
    /// of the same type. Returns false for stale IDs whose stream is already
    /// gone.
    fn ensure_open(&mut self, id: StreamId) -> core::result::Result<bool, TransportError> {
        if self.streams.contains_key(&id) {
            return Ok(true);
        }

        let direction = id.direction();
        if id.is_local(self.side) {
            if id.index() >= *self.next_local.get(direction) {
                return Err(protocol(TransportErrorCode::StreamStateError));
            }
            return Ok(false);
        }

        let next = *self.next_remote.get(direction);
        if id.index() < next {
            trace!(stream_id = %id, "stale stream id ignored");
            return Ok(false);
        }

        let count = id.index() - next + 1;
        if self.live_remote.get(direction) + count > *self.local_max_streams.get(direction) {
            return Err(protocol(TransportErrorCode::StreamLimitError));
        }

        let initiator = self.side.opposite();
        for index in next..=id.index() {
            let sid = StreamId::from_parts(initiator, direction, index);
            let stream = self.new_stream(sid);
            self.streams.insert(sid, stream);
            self.events.push_back(Event::StreamOpened { stream_id: sid });
            debug!(stream_id = %sid, "peer opened stream");
        }
        *self.next_remote.get_mut(direction) = id.index() + 1;
        *self.live_remote.get_mut(direction) += count;
        Ok(true)
    }

    /// Wake parked streams that now have credit, in parking order
    fn release_blocked(&mut self) {
        if self.flow.send.credit() == 0 {
            return;
        }
        let mut still_blocked = VecDeque::new();
        while let Some(id) = self.blocked.pop_front() {
            match self.streams.get_mut(&id).and_then(|s| s.send.as_mut()) {
                Some(send) if send.window.credit() > 0 => {
                    send.blocked = false;
                    self.events.push_back(Event::StreamWritable { stream_id: id });
                }
                Some(_) => still_blocked.push_back(id),
                None => {}
            }
        }
        self.blocked = still_blocked;
    }

    /// Destroy the stream if both halves are terminal and drained
    fn reap(&mut self, id: StreamId) {
        if !self.streams.get(&id).map_or(false, Stream::is_done) {
            return;
        }
        self.streams.remove(&id);

        let direction = id.direction();
        if id.is_local(self.side) {
            let before = self.available(direction);
            let live = self.live_local.get_mut(direction);
            *live = live.saturating_sub(1);
            if before == 0 && self.available(direction) > 0 {
                self.events.push_back(Event::StreamsAvailable { direction });
            }
        } else {
            let live = self.live_remote.get_mut(direction);
            *live = live.saturating_sub(1);
        }

        self.events.push_back(Event::StreamClosed { stream_id: id });
        debug!(stream_id = %id, "stream closed");
    }

    /// Error for an ID with no live stream
    fn missing(&self, id: StreamId) -> Error {
        let direction = id.direction();
        let next = if id.is_local(self.side) {
            self.next_local.get(direction)
        } else {
            self.next_remote.get(direction)
        };
        if id.index() < *next {
            Error::StreamClosed
        } else {
            Error::StreamNotFound
        }
    }
}

/// Initial send credit for `id` given the peer's parameters (zero before
/// the handshake)
fn send_limit_for(side: Side, peer: Option<&TransportParameters>, id: StreamId) -> u64 {
    let Some(peer) = peer else {
        return 0;
    };
    match (id.direction(), id.is_local(side)) {
        (StreamDirection::Unidirectional, _) => peer.initial_max_stream_data_uni,
        (StreamDirection::Bidirectional, true) => peer.initial_max_stream_data_bidi_remote,
        (StreamDirection::Bidirectional, false) => peer.initial_max_stream_data_bidi_local,
    }
}

/// Count bytes the peer sent on a stopped stream up to `end` and hand the
/// credit straight back. A final `end` ends the bookkeeping.
fn settle_stopped(
    recv: &mut RecvHalf,
    conn: &mut RecvWindow,
    end: StreamOffset,
    is_final: bool,
) -> core::result::Result<u64, TransportError> {
    let previous = recv.window.received();
    if is_final && end < previous {
        return Err(protocol(TransportErrorCode::FinalSizeError));
    }
    recv.window.on_received(end)?;

    let grown = end.saturating_sub(previous);
    if grown > 0 {
        conn.on_received(conn.received() + grown)?;
        recv.window.on_read(grown);
        conn.on_read(grown);
    }
    if is_final {
        recv.stopped = false;
    }
    Ok(grown)
}

fn protocol(code: TransportErrorCode) -> TransportError {
    TransportError::ProtocolViolation { code: code.code() }
}
