//! Connection lifecycle.
//!
//! ```text
//! Initiating ──► Handshaking ──► Active ──► Draining ──► Closed
//!                     │                                    ▲
//!                     └────────── handshake failure ───────┘
//!                                 or handshake idle timeout
//! ```
//!
//! Transitions come from three places only: engine callbacks and verdicts
//! (via [`EngineAdapter`]), the application's `close`, and the host calling
//! `on_timeout`.

#![forbid(unsafe_code)]

use core::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::engine::{EngineAdapter, EngineCallback, PacketEngine};
use crate::error::{Error, Result, TransportError, TransportErrorCode};
use crate::event::{
    CloseKind, CloseReason, Diagnostic, Event, EventDispatcher, EventHandler,
};
use crate::params::negotiate_idle_timeout;
use crate::stream::{StreamRegistry, StreamStatus};
use crate::timer::{TimerKind, TimerSet};
use crate::types::{ConnectionId, Instant, Side, StreamDirection, StreamId};

/// Connection State (RFC 9000 Section 10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet
    Initiating,

    /// First datagram exchanged, handshake in progress
    Handshaking,

    /// Handshake complete
    Active,

    /// Close sent or received; stray packets are absorbed
    Draining,

    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether new application work (open, write) is refused
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Draining | ConnectionState::Closed)
    }
}

/// Connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,

    /// Datagrams dropped unprocessed while draining
    pub datagrams_absorbed: u64,

    pub streams_opened: u64,
    pub transport_errors: u64,

    /// Events handed to handlers or the `poll_event` mailbox
    pub events_delivered: u64,
}

/// One QUIC connection driven over a [`PacketEngine`].
///
/// Single owner: every call must be serialized by the host. Independent
/// connections share nothing and may be driven on separate threads.
pub struct Connection<E> {
    side: Side,
    scid: ConnectionId,
    dcid: ConnectionId,
    state: ConnectionState,
    config: ConnectionConfig,

    adapter: EngineAdapter<E>,
    streams: StreamRegistry,
    dispatcher: EventDispatcher,
    timers: TimerSet,

    idle_timeout: Option<Duration>,
    handshake_complete: bool,
    /// CONNECTION_CLOSE queued and not yet written
    close_pending: bool,
    close_reason: Option<CloseReason>,
    stats: ConnectionStats,
}

impl<E> std::fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("scid", &self.scid)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl<E: PacketEngine> Connection<E> {
    /// Create a connection around a fresh engine instance.
    ///
    /// The handshake idle timer starts at `now`.
    pub fn new(
        side: Side,
        config: ConnectionConfig,
        scid: ConnectionId,
        dcid: ConnectionId,
        engine: E,
        now: Instant,
    ) -> Self {
        let adapter = EngineAdapter::new(
            engine,
            config.max_udp_payload_size,
            config.max_datagrams_per_poll,
        );
        let streams = StreamRegistry::new(side, config.local_transport_parameters());
        let idle_timeout = config.idle_timeout();

        let mut conn = Self {
            side,
            scid,
            dcid,
            state: ConnectionState::Initiating,
            config,
            adapter,
            streams,
            dispatcher: EventDispatcher::new(),
            timers: TimerSet::new(),
            idle_timeout,
            handshake_complete: false,
            close_pending: false,
            close_reason: None,
            stats: ConnectionStats::default(),
        };
        conn.touch(now);
        debug!(?side, scid = %conn.scid, "connection created");
        conn
    }

    pub fn client(
        config: ConnectionConfig,
        scid: ConnectionId,
        dcid: ConnectionId,
        engine: E,
        now: Instant,
    ) -> Self {
        Self::new(Side::Client, config, scid, dcid, engine, now)
    }

    pub fn server(
        config: ConnectionConfig,
        scid: ConnectionId,
        dcid: ConnectionId,
        engine: E,
        now: Instant,
    ) -> Self {
        Self::new(Side::Server, config, scid, dcid, engine, now)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Idle timeout in force: the local value until the handshake
    /// completes, the negotiated one after
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            events_delivered: self.dispatcher.delivered(),
            ..self.stats
        }
    }

    /// Streams that still hold unread data, including after close
    pub fn readable_streams(&self) -> Vec<StreamId> {
        self.streams.readable_streams()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn engine(&self) -> &E {
        self.adapter.engine()
    }

    pub fn engine_mut(&mut self) -> &mut E {
        self.adapter.engine_mut()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        self.dispatcher.diagnostics()
    }

    // ------------------------------------------------------------------
    // Packet Engine Adapter entry points
    // ------------------------------------------------------------------

    /// Feed one inbound datagram.
    ///
    /// Engine rejections never surface here; they become `TransportError`
    /// events (and close the connection when fatal).
    pub fn ingest(&mut self, datagram: &[u8], now: Instant) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        self.stats.datagrams_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if self.state == ConnectionState::Draining {
            self.stats.datagrams_absorbed += 1;
            trace!(len = datagram.len(), "datagram absorbed while draining");
            return Ok(());
        }

        match self.adapter.ingest(datagram, now) {
            Ok(callbacks) => {
                if self.state == ConnectionState::Initiating {
                    self.transition(ConnectionState::Handshaking);
                }
                self.touch(now);
                self.apply_callbacks(callbacks, now);
            }
            Err(err) => {
                let callbacks = self.adapter.drain_callbacks();
                self.apply_callbacks(callbacks, now);
                self.on_transport_error(err, now);
            }
        }

        self.flush_events();
        Ok(())
    }

    /// Pull datagrams the engine wants sent.
    ///
    /// While draining after a local close only the CONNECTION_CLOSE goes
    /// out, once; after that, and once closed, nothing is produced.
    pub fn produce_datagrams(&mut self, now: Instant) -> Result<Vec<Bytes>> {
        match self.state {
            ConnectionState::Closed => return Ok(Vec::new()),
            ConnectionState::Draining if !self.close_pending => return Ok(Vec::new()),
            _ => {}
        }

        let datagrams = match self.adapter.produce_datagrams(now) {
            Ok(datagrams) => datagrams,
            Err(err) => {
                self.on_transport_error(err, now);
                self.flush_events();
                return Ok(Vec::new());
            }
        };

        if self.state == ConnectionState::Draining {
            self.close_pending = false;
        }
        if self.state == ConnectionState::Initiating && !datagrams.is_empty() {
            self.transition(ConnectionState::Handshaking);
        }

        self.stats.datagrams_sent += datagrams.len() as u64;
        self.stats.bytes_sent += datagrams.iter().map(|d| d.len() as u64).sum::<u64>();
        Ok(datagrams)
    }

    // ------------------------------------------------------------------
    // Timer/Scheduler Adapter entry points
    // ------------------------------------------------------------------

    /// Earliest deadline the host must call `on_timeout` at
    pub fn next_deadline(&self) -> Option<Instant> {
        self.current_timers().next_deadline().map(|(_, at)| at)
    }

    /// Time until `on_timeout` is due, or None if nothing is armed
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.current_timers().timeout(now)
    }

    /// Fire every timer due at `now`.
    pub fn on_timeout(&mut self, now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.timers = self.current_timers();

        for kind in self.timers.expired(now) {
            if self.state == ConnectionState::Closed {
                break;
            }
            match kind {
                TimerKind::Drain => {
                    self.finish();
                }
                TimerKind::Idle => {
                    self.timers.clear(TimerKind::Idle);
                    self.on_idle_timeout(now);
                }
                TimerKind::Engine => {
                    self.timers.clear(TimerKind::Engine);
                    if self.state.is_closing() {
                        continue;
                    }
                    match self.adapter.handle_expiry(now) {
                        Ok(callbacks) => self.apply_callbacks(callbacks, now),
                        Err(err) => self.on_transport_error(err, now),
                    }
                }
            }
        }

        self.flush_events();
    }

    fn current_timers(&self) -> TimerSet {
        let mut timers = self.timers;
        if !self.state.is_closing() {
            timers.update(TimerKind::Engine, self.adapter.expiry());
        }
        timers
    }

    fn on_idle_timeout(&mut self, now: Instant) {
        let reason = CloseReason::new(
            CloseKind::IdleTimeout,
            TransportErrorCode::NoError.code(),
            Bytes::new(),
        );
        match self.state {
            ConnectionState::Initiating | ConnectionState::Handshaking => {
                info!(scid = %self.scid, "handshake idle timeout");
                self.close_reason = Some(reason);
                self.finish();
            }
            ConnectionState::Active => {
                info!(scid = %self.scid, "idle timeout");
                // Silent close: nothing is sent to the peer
                self.enter_draining(reason, now);
            }
            ConnectionState::Draining | ConnectionState::Closed => {}
        }
    }

    // ------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------

    pub fn open_stream(&mut self, direction: StreamDirection) -> Result<StreamId> {
        if self.state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let id = self.streams.open_stream(direction)?;
        self.stats.streams_opened += 1;
        Ok(id)
    }

    /// Write as much of `data` as flow control allows.
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()`. Fails with `FlowControlBlocked` when no byte fits;
    /// retry after `StreamWritable`.
    pub fn write(&mut self, stream_id: StreamId, data: &[u8], fin: bool) -> Result<usize> {
        if self.state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let outcome = self.streams.write(stream_id, data, fin)?;
        if outcome.accepted > 0 || outcome.fin {
            self.adapter
                .engine_mut()
                .submit_stream_data(stream_id, outcome.chunk, outcome.fin);
        }
        trace!(%stream_id, accepted = outcome.accepted, fin = outcome.fin, "stream write");
        Ok(outcome.accepted)
    }

    /// Read up to `max_len` buffered bytes; `fin` is true once the whole
    /// stream has been read.
    ///
    /// Buffered data stays readable after the connection closes. Once the
    /// connection is closing, a read that would wait fails with
    /// `ConnectionClosed` since no more data can arrive.
    pub fn read(&mut self, stream_id: StreamId, max_len: usize) -> Result<(Bytes, bool)> {
        let outcome = match self.streams.read(stream_id, max_len) {
            Err(Error::WouldBlock) if self.state.is_closing() => {
                return Err(Error::ConnectionClosed)
            }
            other => other?,
        };

        let consumed = outcome.data.len() as u64;
        if consumed > 0 && !self.state.is_closing() {
            let engine = self.adapter.engine_mut();
            engine.extend_stream_offset(stream_id, consumed);
            engine.extend_connection_offset(consumed);
        }

        self.flush_events();
        Ok((outcome.data, outcome.fin))
    }

    /// Abandon sending on a stream (RESET_STREAM)
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: u64) -> Result<()> {
        if self.state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        self.streams.reset_stream(stream_id)?;
        self.adapter
            .engine_mut()
            .shutdown_stream_write(stream_id, error_code);
        self.flush_events();
        Ok(())
    }

    /// Ask the peer to stop sending (STOP_SENDING); buffered data is dropped
    pub fn stop_sending(&mut self, stream_id: StreamId, error_code: u64) -> Result<()> {
        if self.state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        let released = self.streams.stop_sending(stream_id)?;
        let engine = self.adapter.engine_mut();
        engine.shutdown_stream_read(stream_id, error_code);
        if released > 0 {
            engine.extend_connection_offset(released);
        }
        self.flush_events();
        Ok(())
    }

    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamStatus> {
        self.streams.stream_state(stream_id)
    }

    pub fn send_capacity(&self, stream_id: StreamId) -> Result<u64> {
        if self.state.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        self.streams.send_capacity(stream_id)
    }

    /// Close the connection with an application error code.
    ///
    /// Queues CONNECTION_CLOSE and enters `Draining`. Calling it again while
    /// draining is a no-op.
    pub fn close(&mut self, error_code: u64, reason: &[u8], now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            ConnectionState::Draining => return Ok(()),
            _ => {}
        }

        info!(scid = %self.scid, error_code, "closing connection");
        self.adapter.engine_mut().close(error_code, reason);
        self.close_pending = true;
        self.enter_draining(
            CloseReason::new(CloseKind::Local, error_code, Bytes::copy_from_slice(reason)),
            now,
        );
        self.flush_events();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event Dispatcher
    // ------------------------------------------------------------------

    pub fn set_connection_handler(&mut self, handler: impl EventHandler + 'static) {
        self.dispatcher.set_connection_handler(Box::new(handler));
    }

    pub fn set_default_stream_handler(&mut self, handler: impl EventHandler + 'static) {
        self.dispatcher
            .set_default_stream_handler(Box::new(handler));
    }

    pub fn set_stream_handler(&mut self, stream_id: StreamId, handler: impl EventHandler + 'static) {
        self.dispatcher
            .set_stream_handler(stream_id, Box::new(handler));
    }

    pub fn remove_stream_handler(&mut self, stream_id: StreamId) -> bool {
        self.dispatcher.remove_stream_handler(stream_id)
    }

    /// Deliver queued events to handlers
    pub fn dispatch(&mut self) -> usize {
        self.flush_events()
    }

    /// Next event no handler took
    pub fn poll_event(&mut self) -> Option<Event> {
        self.pump();
        self.dispatcher.poll_event()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn transition(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        debug!(scid = %self.scid, from = ?self.state, to = ?to, "connection state");
        self.state = to;
    }

    /// Restart the idle timer
    fn touch(&mut self, now: Instant) {
        if self.state.is_closing() {
            return;
        }
        let deadline = self.idle_timeout.map(|t| now.saturating_add(t));
        self.timers.update(TimerKind::Idle, deadline);
    }

    fn apply_callbacks(&mut self, callbacks: Vec<EngineCallback>, now: Instant) {
        for callback in callbacks {
            if self.state.is_closing() {
                trace!("ignoring engine callback after close");
                break;
            }
            if let Err(err) = self.apply_callback(callback, now) {
                self.on_transport_error(err, now);
            }
            self.pump();
        }
    }

    fn apply_callback(
        &mut self,
        callback: EngineCallback,
        now: Instant,
    ) -> core::result::Result<(), TransportError> {
        match callback {
            EngineCallback::HandshakeCompleted { peer_params } => {
                if self.handshake_complete {
                    return Ok(());
                }
                self.handshake_complete = true;
                self.idle_timeout =
                    negotiate_idle_timeout(self.config.idle_timeout(), peer_params.idle_timeout());
                self.transition(ConnectionState::Active);
                self.touch(now);
                self.emit(Event::HandshakeCompleted);
                self.streams.on_handshake_completed(peer_params);
                info!(scid = %self.scid, idle_timeout = ?self.idle_timeout, "handshake completed");
            }
            EngineCallback::StreamData {
                stream_id,
                offset,
                data,
                fin,
            } => {
                let released = self.streams.on_stream_data(stream_id, offset, data, fin)?;
                if released > 0 {
                    self.adapter.engine_mut().extend_connection_offset(released);
                }
            }
            EngineCallback::StreamReset {
                stream_id,
                error_code,
                final_size,
            } => {
                let released = self.streams.on_stream_reset(stream_id, error_code, final_size)?;
                if released > 0 {
                    self.adapter.engine_mut().extend_connection_offset(released);
                }
            }
            EngineCallback::StopSending {
                stream_id,
                error_code,
            } => {
                if self.streams.on_stop_sending(stream_id, error_code)? {
                    self.adapter
                        .engine_mut()
                        .shutdown_stream_write(stream_id, error_code);
                }
            }
            EngineCallback::MaxStreamData { stream_id, limit } => {
                self.streams.on_max_stream_data(stream_id, limit);
            }
            EngineCallback::MaxData { limit } => {
                self.streams.on_max_data(limit);
            }
            EngineCallback::MaxStreams { direction, max } => {
                self.streams.on_max_streams(direction, max);
            }
            EngineCallback::StreamAcked { stream_id, len } => {
                self.streams.on_stream_acked(stream_id, len);
            }
            EngineCallback::ConnectionClose { error_code, reason } => {
                info!(scid = %self.scid, error_code, "peer closed connection");
                self.enter_draining(CloseReason::new(CloseKind::Peer, error_code, reason), now);
            }
        }
        Ok(())
    }

    /// Route an engine failure: recoverable ones become events, fatal ones
    /// close the connection.
    fn on_transport_error(&mut self, err: TransportError, now: Instant) {
        self.stats.transport_errors += 1;
        self.emit(Event::TransportError { error: err });

        let handshaking = matches!(
            self.state,
            ConnectionState::Initiating | ConnectionState::Handshaking
        );

        match err {
            TransportError::ResourceExhausted => {
                warn!(scid = %self.scid, "engine out of resources, closing");
                self.close_reason = Some(CloseReason::new(
                    CloseKind::TransportFailure,
                    err.close_code(),
                    Bytes::new(),
                ));
                self.finish();
            }
            TransportError::ProtocolViolation { code } => {
                if self.state.is_closing() {
                    return;
                }
                warn!(scid = %self.scid, code, "protocol violation, closing");
                self.adapter.engine_mut().close(code, b"");
                self.close_pending = true;
                self.enter_draining(
                    CloseReason::new(CloseKind::TransportFailure, code, Bytes::new()),
                    now,
                );
            }
            TransportError::HandshakeFailure { code } if handshaking => {
                warn!(scid = %self.scid, code, "handshake failed");
                self.close_reason = Some(CloseReason::new(
                    CloseKind::HandshakeFailed,
                    code,
                    Bytes::new(),
                ));
                self.finish();
            }
            _ => {
                debug!(scid = %self.scid, error = %err, "recoverable transport error");
            }
        }
    }

    fn enter_draining(&mut self, reason: CloseReason, now: Instant) {
        if self.state.is_closing() {
            return;
        }
        self.transition(ConnectionState::Draining);
        self.timers.clear_all();
        self.timers.set(
            TimerKind::Drain,
            now.saturating_add(self.config.drain_timeout()),
        );
        self.close_reason = Some(reason.clone());
        self.emit(Event::Draining { reason });
    }

    /// Enter `Closed`: freeze streams, discard undelivered events and
    /// queue the terminal event
    fn finish(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let writes_incomplete = self.streams.writes_incomplete();
        self.streams.freeze();
        self.streams.take_events().for_each(drop);

        self.transition(ConnectionState::Closed);
        self.timers.clear_all();
        self.close_pending = false;

        let reason = self.close_reason.clone().unwrap_or_else(|| {
            CloseReason::new(
                CloseKind::Local,
                TransportErrorCode::NoError.code(),
                Bytes::new(),
            )
        });
        info!(
            scid = %self.scid,
            kind = ?reason.kind,
            error_code = reason.error_code,
            writes_incomplete,
            "connection closed"
        );
        self.dispatcher.seal(Event::ConnectionClosed {
            reason,
            writes_incomplete,
        });
    }

    /// Queue a connection-scope event behind pending stream events
    fn emit(&mut self, event: Event) {
        self.pump();
        self.dispatcher.push(event);
    }

    /// Move stream events into the dispatcher, preserving order
    fn pump(&mut self) {
        for event in self.streams.take_events() {
            self.dispatcher.push(event);
        }
    }

    fn flush_events(&mut self) -> usize {
        self.pump();
        self.dispatcher.dispatch()
    }
}
