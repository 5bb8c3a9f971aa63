//! # Event Dispatcher
//!
//! Connection and stream events are queued in the order they are generated
//! and delivered FIFO, each to exactly one handler:
//!
//! 1. the handler registered for the event's stream, else
//! 2. the default stream handler (stream-scope events only), else
//! 3. the connection handler, else
//! 4. the mailbox, drained by `poll_event`.
//!
//! A failing handler never stops delivery. The failure is kept as a
//! [`Diagnostic`] and a `HandlerFailed` event is queued behind everything
//! already pending. Once the connection is closed the queue is sealed: what
//! was still pending is discarded and only the terminal `ConnectionClosed`
//! event is delivered.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::{StreamDirection, StreamId};

/// Why a connection left the `Active` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Application called `close`
    Local,
    /// Peer sent CONNECTION_CLOSE
    Peer,
    /// No activity within the negotiated idle timeout
    IdleTimeout,
    /// Handshake could not complete
    HandshakeFailed,
    /// Fatal transport error (protocol violation, resource exhaustion)
    TransportFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: CloseKind,
    /// Error code carried in CONNECTION_CLOSE
    pub error_code: u64,
    pub reason: Bytes,
}

impl CloseReason {
    pub fn new(kind: CloseKind, error_code: u64, reason: impl Into<Bytes>) -> Self {
        Self {
            kind,
            error_code,
            reason: reason.into(),
        }
    }
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    HandshakeCompleted,

    /// Peer opened a stream (explicitly or implicitly)
    StreamOpened { stream_id: StreamId },

    /// New bytes are buffered for `read`
    StreamReadable { stream_id: StreamId },

    /// Peer's FIN arrived; the final size is known
    StreamFinished { stream_id: StreamId },

    /// Flow-control credit arrived for a stream that was blocked
    StreamWritable { stream_id: StreamId },

    /// Peer sent RESET_STREAM; buffered data was discarded
    StreamReset { stream_id: StreamId, error_code: u64 },

    /// Peer sent STOP_SENDING; the send side was reset in response
    StopSending { stream_id: StreamId, error_code: u64 },

    /// Both halves are terminal and drained; the stream is gone
    StreamClosed { stream_id: StreamId },

    /// `open_stream` can succeed again for this direction
    StreamsAvailable { direction: StreamDirection },

    /// Recoverable transport error reported by the engine
    TransportError { error: TransportError },

    /// A handler returned an error while processing an event
    HandlerFailed {
        stream_id: Option<StreamId>,
        kind: &'static str,
        message: String,
    },

    Draining { reason: CloseReason },

    /// Terminal event; the connection accepts no further work
    ConnectionClosed {
        reason: CloseReason,
        /// Accepted bytes were still unacknowledged when the connection closed
        writes_incomplete: bool,
    },
}

impl Event {
    /// Stream this event belongs to, or None for connection scope
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Event::StreamOpened { stream_id }
            | Event::StreamReadable { stream_id }
            | Event::StreamFinished { stream_id }
            | Event::StreamWritable { stream_id }
            | Event::StreamReset { stream_id, .. }
            | Event::StopSending { stream_id, .. }
            | Event::StreamClosed { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::HandshakeCompleted => "handshake_completed",
            Event::StreamOpened { .. } => "stream_opened",
            Event::StreamReadable { .. } => "stream_readable",
            Event::StreamFinished { .. } => "stream_finished",
            Event::StreamWritable { .. } => "stream_writable",
            Event::StreamReset { .. } => "stream_reset",
            Event::StopSending { .. } => "stop_sending",
            Event::StreamClosed { .. } => "stream_closed",
            Event::StreamsAvailable { .. } => "streams_available",
            Event::TransportError { .. } => "transport_error",
            Event::HandlerFailed { .. } => "handler_failed",
            Event::Draining { .. } => "draining",
            Event::ConnectionClosed { .. } => "connection_closed",
        }
    }

    /// Diagnostics describe other failures and are never re-reported
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Event::HandlerFailed { .. })
    }
}

/// Error returned by an application handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Application callback for connection or stream events.
///
/// Implemented for any `FnMut(&Event) -> Result<(), HandlerError>`.
pub trait EventHandler: Send {
    fn handle(&mut self, event: &Event) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: FnMut(&Event) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, event: &Event) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Recorded handler failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub stream_id: Option<StreamId>,
    pub kind: &'static str,
    pub message: String,
}

pub struct EventDispatcher {
    queue: VecDeque<Event>,
    mailbox: VecDeque<Event>,
    connection_handler: Option<Box<dyn EventHandler>>,
    default_stream_handler: Option<Box<dyn EventHandler>>,
    stream_handlers: HashMap<StreamId, Box<dyn EventHandler>>,
    diagnostics: Vec<Diagnostic>,
    sealed: bool,
    delivered: u64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("queued", &self.queue.len())
            .field("mailbox", &self.mailbox.len())
            .field("stream_handlers", &self.stream_handlers.len())
            .field("diagnostics", &self.diagnostics.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            mailbox: VecDeque::new(),
            connection_handler: None,
            default_stream_handler: None,
            stream_handlers: HashMap::new(),
            diagnostics: Vec::new(),
            sealed: false,
            delivered: 0,
        }
    }

    pub fn set_connection_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.connection_handler = Some(handler);
    }

    pub fn set_default_stream_handler(&mut self, handler: Box<dyn EventHandler>) {
        self.default_stream_handler = Some(handler);
    }

    pub fn set_stream_handler(&mut self, stream_id: StreamId, handler: Box<dyn EventHandler>) {
        self.stream_handlers.insert(stream_id, handler);
    }

    pub fn remove_stream_handler(&mut self, stream_id: StreamId) -> bool {
        self.stream_handlers.remove(&stream_id).is_some()
    }

    /// Queue an event behind everything already pending.
    ///
    /// Returns false if the dispatcher is sealed and the event was dropped.
    pub fn push(&mut self, event: Event) -> bool {
        if self.sealed {
            debug!(kind = event.kind(), "event dropped after close");
            return false;
        }
        self.queue.push_back(event);
        true
    }

    /// Discard pending events, queue the terminal event and stop accepting more
    pub fn seal(&mut self, terminal: Event) {
        if self.sealed {
            return;
        }
        let discarded = self.queue.len() + self.mailbox.len();
        if discarded > 0 {
            debug!(discarded, "discarding undelivered events on close");
        }
        self.queue.clear();
        self.mailbox.clear();
        self.queue.push_back(terminal);
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Deliver every queued event, including failures reported along the way.
    ///
    /// Returns the number of events handed to handlers or the mailbox.
    pub fn dispatch(&mut self) -> usize {
        let mut count = 0;
        while let Some(event) = self.queue.pop_front() {
            self.deliver(event);
            count += 1;
        }
        self.delivered += count as u64;
        count
    }

    fn deliver(&mut self, event: Event) {
        let stream_id = event.stream_id();

        let handler = match stream_id {
            Some(id) => match self.stream_handlers.get_mut(&id) {
                Some(h) => Some(h),
                None => self
                    .default_stream_handler
                    .as_mut()
                    .or(self.connection_handler.as_mut()),
            },
            None => self.connection_handler.as_mut(),
        };

        let Some(handler) = handler else {
            self.mailbox.push_back(event);
            return;
        };

        if let Err(err) = handler.handle(&event) {
            warn!(kind = event.kind(), error = %err, "event handler failed");
            self.diagnostics.push(Diagnostic {
                stream_id,
                kind: event.kind(),
                message: err.message().to_string(),
            });
            if !event.is_diagnostic() {
                self.queue.push_back(Event::HandlerFailed {
                    stream_id,
                    kind: event.kind(),
                    message: err.message().to_string(),
                });
            }
        }

        if let Event::StreamClosed { stream_id } = event {
            self.stream_handlers.remove(&stream_id);
        }
    }

    /// Next event that had no handler
    pub fn poll_event(&mut self) -> Option<Event> {
        self.dispatch();
        self.mailbox.pop_front()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<Event>>>, Box<dyn EventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: &Event| -> Result<(), HandlerError> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        };
        (seen, Box::new(handler))
    }

    #[test]
    fn test_fifo_delivery() {
        let mut dispatcher = EventDispatcher::new();
        let (seen, handler) = recorder();
        dispatcher.set_connection_handler(handler);

        dispatcher.push(Event::StreamReadable { stream_id: StreamId(4) });
        dispatcher.push(Event::HandshakeCompleted);
        dispatcher.push(Event::StreamReadable { stream_id: StreamId(0) });
        assert_eq!(dispatcher.dispatch(), 3);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Event::StreamReadable { stream_id: StreamId(4) },
                Event::HandshakeCompleted,
                Event::StreamReadable { stream_id: StreamId(0) },
            ]
        );
    }

    #[test]
    fn test_exactly_one_handler_per_event() {
        let mut dispatcher = EventDispatcher::new();
        let (conn_seen, conn) = recorder();
        let (default_seen, default) = recorder();
        let (stream_seen, stream) = recorder();
        dispatcher.set_connection_handler(conn);
        dispatcher.set_default_stream_handler(default);
        dispatcher.set_stream_handler(StreamId(8), stream);

        dispatcher.push(Event::StreamReadable { stream_id: StreamId(8) });
        dispatcher.push(Event::StreamReadable { stream_id: StreamId(12) });
        dispatcher.push(Event::HandshakeCompleted);
        dispatcher.dispatch();

        assert_eq!(stream_seen.lock().unwrap().len(), 1);
        assert_eq!(default_seen.lock().unwrap().len(), 1);
        assert_eq!(*conn_seen.lock().unwrap(), vec![Event::HandshakeCompleted]);
    }

    #[test]
    fn test_handler_failure_becomes_diagnostic() {
        let mut dispatcher = EventDispatcher::new();
        let (seen, conn) = recorder();
        dispatcher.set_connection_handler(conn);
        dispatcher.set_stream_handler(
            StreamId(0),
            Box::new(|_: &Event| -> Result<(), HandlerError> { Err(HandlerError::new("boom")) }),
        );

        dispatcher.push(Event::StreamReadable { stream_id: StreamId(0) });
        dispatcher.push(Event::HandshakeCompleted);
        dispatcher.dispatch();

        // Later events still delivered, failure queued after them
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Event::HandshakeCompleted);
        assert!(matches!(
            &seen[1],
            Event::HandlerFailed { stream_id: Some(StreamId(0)), kind: "stream_readable", message } if message == "boom"
        ));
        assert_eq!(dispatcher.diagnostics().len(), 1);
    }

    #[test]
    fn test_failing_diagnostic_handler_does_not_loop() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.set_connection_handler(Box::new(|_: &Event| -> Result<(), HandlerError> {
            Err(HandlerError::new("nope"))
        }));
        dispatcher.push(Event::HandshakeCompleted);

        assert_eq!(dispatcher.dispatch(), 2);
        assert_eq!(dispatcher.diagnostics().len(), 2);
        assert_eq!(dispatcher.dispatch(), 0);
        assert_eq!(dispatcher.delivered(), 2);
    }

    #[test]
    fn test_unhandled_events_reach_mailbox_in_order() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.push(Event::HandshakeCompleted);
        dispatcher.push(Event::StreamOpened { stream_id: StreamId(1) });

        assert_eq!(dispatcher.poll_event(), Some(Event::HandshakeCompleted));
        assert_eq!(
            dispatcher.poll_event(),
            Some(Event::StreamOpened { stream_id: StreamId(1) })
        );
        assert_eq!(dispatcher.poll_event(), None);
    }

    #[test]
    fn test_seal_discards_pending_events() {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.push(Event::StreamReadable { stream_id: StreamId(0) });
        let terminal = Event::ConnectionClosed {
            reason: CloseReason::new(CloseKind::Local, 0, Bytes::new()),
            writes_incomplete: false,
        };
        dispatcher.seal(terminal.clone());

        assert!(!dispatcher.push(Event::HandshakeCompleted));
        assert_eq!(dispatcher.poll_event(), Some(terminal));
        assert_eq!(dispatcher.poll_event(), None);
    }

    #[test]
    fn test_stream_handler_removed_after_stream_closed() {
        let mut dispatcher = EventDispatcher::new();
        let (seen, stream) = recorder();
        dispatcher.set_stream_handler(StreamId(4), stream);
        dispatcher.push(Event::StreamClosed { stream_id: StreamId(4) });
        dispatcher.dispatch();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!dispatcher.remove_stream_handler(StreamId(4)));
    }
}
