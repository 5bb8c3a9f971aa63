//! Channel bridge from a connection's event dispatcher to another thread.
//!
//! The endpoint runs on whichever thread drives the socket; the application
//! may live elsewhere. A [`ChannelHandler`] forwards every event it is given
//! into a bounded crossbeam channel, tagged with its connection. The handler
//! never blocks: a full channel is reported as a handler failure, which the
//! dispatcher records as a diagnostic.

use crossbeam_channel::{Sender, TrySendError};
use qbind_quic::{Event, EventHandler, HandlerError};

use crate::endpoint::ConnectionHandle;

/// An event tagged with the connection it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEvent {
    pub connection: ConnectionHandle,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct ChannelHandler {
    connection: ConnectionHandle,
    tx: Sender<EndpointEvent>,
}

impl ChannelHandler {
    pub fn new(connection: ConnectionHandle, tx: Sender<EndpointEvent>) -> Self {
        Self { connection, tx }
    }
}

impl EventHandler for ChannelHandler {
    fn handle(&mut self, event: &Event) -> Result<(), HandlerError> {
        let tagged = EndpointEvent {
            connection: self.connection,
            event: event.clone(),
        };
        match self.tx.try_send(tagged) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HandlerError::new("event channel full")),
            Err(TrySendError::Disconnected(_)) => {
                Err(HandlerError::new("event receiver dropped"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use qbind_quic::StreamId;

    #[test]
    fn test_forwards_tagged_events() {
        let (tx, rx) = bounded(4);
        let mut handler = ChannelHandler::new(ConnectionHandle(3), tx);
        handler.handle(&Event::HandshakeCompleted).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            EndpointEvent {
                connection: ConnectionHandle(3),
                event: Event::HandshakeCompleted
            }
        );
    }

    #[test]
    fn test_full_channel_is_handler_failure() {
        let (tx, _rx) = bounded(1);
        let mut handler = ChannelHandler::new(ConnectionHandle(0), tx);
        let event = Event::StreamReadable { stream_id: StreamId(0) };

        assert!(handler.handle(&event).is_ok());
        assert_eq!(
            handler.handle(&event),
            Err(HandlerError::new("event channel full"))
        );
    }

    #[test]
    fn test_dropped_receiver_is_handler_failure() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let mut handler = ChannelHandler::new(ConnectionHandle(0), tx);
        assert_eq!(
            handler.handle(&Event::HandshakeCompleted).unwrap_err().message(),
            "event receiver dropped"
        );
    }
}
