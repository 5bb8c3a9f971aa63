//! # Connection Module Tests (RFC 9000 Section 10)
//!
//! State machine transitions, close handling, timers and event delivery
//! driven through the scripted engine.

#![cfg(test)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use core::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::state::{Connection, ConnectionState};
use crate::engine::{decode_frames, EngineCallback, EngineError, Frame, PacketEngine, ScriptedEngine};
use crate::error::{Error, TransportError};
use crate::event::{CloseKind, Event, HandlerError};
use crate::params::TransportParameters;
use crate::types::{ConnectionId, Instant, Side, StreamDirection, StreamId};

fn t(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

fn peer_params() -> TransportParameters {
    TransportParameters {
        max_idle_timeout_ms: 10_000,
        initial_max_data: 10_000,
        initial_max_stream_data_bidi_local: 1_000,
        initial_max_stream_data_bidi_remote: 1_000,
        initial_max_stream_data_uni: 1_000,
        initial_max_streams_bidi: 4,
        initial_max_streams_uni: 4,
    }
}

fn new_conn(side: Side) -> Connection<ScriptedEngine> {
    Connection::new(
        side,
        ConnectionConfig::default(),
        ConnectionId::from_slice(&[1; 8]).unwrap(),
        ConnectionId::from_slice(&[2; 8]).unwrap(),
        ScriptedEngine::new(),
        t(0),
    )
}

fn active_conn(side: Side) -> Connection<ScriptedEngine> {
    let mut conn = new_conn(side);
    conn.engine_mut()
        .expect_datagram(Ok(vec![EngineCallback::HandshakeCompleted {
            peer_params: peer_params(),
        }]));
    conn.ingest(b"handshake", t(1)).unwrap();
    while conn.poll_event().is_some() {}
    conn
}

fn events(conn: &mut Connection<ScriptedEngine>) -> Vec<Event> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_client_starts_initiating_and_handshakes_on_first_send() {
        let mut conn = new_conn(Side::Client);
        assert_eq!(conn.state(), ConnectionState::Initiating);

        conn.engine_mut()
            .submit_stream_data(StreamId(0), Bytes::new(), true);
        let out = conn.produce_datagrams(t(1)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(conn.state(), ConnectionState::Handshaking);
    }

    #[test]
    fn test_handshake_completion_activates() {
        let mut conn = new_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![]))
            .expect_datagram(Ok(vec![EngineCallback::HandshakeCompleted {
                peer_params: peer_params(),
            }]));

        conn.ingest(b"initial", t(1)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Handshaking);

        conn.ingest(b"finished", t(2)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(conn.is_handshake_complete());
        assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(10)));

        let seen = events(&mut conn);
        assert_eq!(seen[0], Event::HandshakeCompleted);
        assert!(seen.contains(&Event::StreamsAvailable {
            direction: StreamDirection::Bidirectional
        }));
    }

    #[test]
    fn test_open_and_write_refused_while_draining() {
        let mut conn = active_conn(Side::Client);
        let id = conn.open_stream(StreamDirection::Bidirectional).unwrap();
        conn.close(0, b"done", t(5)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(
            conn.open_stream(StreamDirection::Bidirectional),
            Err(Error::ConnectionClosed)
        );
        assert_eq!(conn.write(id, b"x", false), Err(Error::ConnectionClosed));
        assert_eq!(conn.send_capacity(id), Err(Error::ConnectionClosed));
    }

    #[test]
    fn test_local_close_sends_close_once() {
        let mut conn = active_conn(Side::Client);
        conn.close(0x0b, b"bye", t(5)).unwrap();

        let out = conn.produce_datagrams(t(6)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            decode_frames(&out[0]),
            vec![Frame::ConnectionClose {
                error_code: 0x0b,
                reason: Bytes::from_static(b"bye")
            }]
        );
        assert!(conn.produce_datagrams(t(7)).unwrap().is_empty());

        let reason = conn.close_reason().unwrap();
        assert_eq!(reason.kind, CloseKind::Local);
        assert_eq!(reason.error_code, 0x0b);
    }

    #[test]
    fn test_second_close_is_noop_while_draining() {
        let mut conn = active_conn(Side::Client);
        conn.close(1, b"", t(5)).unwrap();
        assert_eq!(conn.close(2, b"", t(6)), Ok(()));
        assert_eq!(conn.close_reason().unwrap().error_code, 1);
    }

    #[test]
    fn test_peer_close_enters_draining_and_absorbs() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::ConnectionClose {
                error_code: 0,
                reason: Bytes::from_static(b"later"),
            }]));
        conn.ingest(b"close", t(10)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(conn.close_reason().unwrap().kind, CloseKind::Peer);

        conn.ingest(b"stray", t(11)).unwrap();
        assert_eq!(conn.stats().datagrams_absorbed, 1);
        assert_eq!(conn.engine().received().len(), 2);

        // Nothing is sent in response to a peer close
        assert!(conn.produce_datagrams(t(12)).unwrap().is_empty());
    }

    #[test]
    fn test_drain_timeout_closes() {
        let mut conn = active_conn(Side::Client);
        conn.close(0, b"", t(100)).unwrap();
        while conn.poll_event().is_some() {}

        assert_eq!(conn.next_timeout(t(100)), Some(Duration::from_secs(3)));
        conn.on_timeout(t(3099));
        assert_eq!(conn.state(), ConnectionState::Draining);

        conn.on_timeout(t(3100));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.next_timeout(t(3100)), None);
        assert!(matches!(
            conn.poll_event(),
            Some(Event::ConnectionClosed { reason, writes_incomplete: false }) if reason.kind == CloseKind::Local
        ));
        assert_eq!(conn.ingest(b"late", t(3200)), Err(Error::ConnectionClosed));
    }
}

mod timer_tests {
    use super::*;

    #[test]
    fn test_idle_timeout_negotiated_minimum() {
        let mut conn = active_conn(Side::Client);
        assert_eq!(conn.next_timeout(t(1)), Some(Duration::from_secs(10)));

        // Inbound traffic restarts the idle timer
        conn.ingest(b"ping", t(5_000)).unwrap();
        assert_eq!(conn.next_timeout(t(5_000)), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_idle_timeout_drains_then_closes() {
        let mut conn = active_conn(Side::Client);
        conn.on_timeout(t(10_001));
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(conn.close_reason().unwrap().kind, CloseKind::IdleTimeout);
        // Silent: no CONNECTION_CLOSE on the wire
        assert!(conn.produce_datagrams(t(10_002)).unwrap().is_empty());

        conn.on_timeout(t(13_001));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_handshake_idle_timeout_closes_directly() {
        let mut conn = new_conn(Side::Server);
        conn.ingest(b"initial", t(0)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Handshaking);

        conn.on_timeout(t(30_000));
        assert_eq!(conn.state(), ConnectionState::Closed);
        let seen = events(&mut conn);
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            Event::ConnectionClosed { reason, .. } if reason.kind == CloseKind::IdleTimeout
        ));
    }

    #[test]
    fn test_engine_timer_is_driven() {
        let mut conn = active_conn(Side::Client);
        conn.engine_mut()
            .set_expiry(Some(t(50)))
            .expect_timeout(Ok(vec![EngineCallback::MaxData { limit: 20_000 }]));

        assert_eq!(conn.next_deadline(), Some(t(50)));
        conn.on_timeout(t(50));
        assert_eq!(conn.engine().expiry(), None);
        assert_eq!(conn.streams().connection_flow().send.limit(), 20_000);
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn test_malformed_packet_is_event_not_error() {
        let mut conn = active_conn(Side::Client);
        conn.engine_mut()
            .expect_datagram(Err(EngineError::Malformed));
        assert_eq!(conn.ingest(b"junk", t(5)), Ok(()));
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(
            events(&mut conn),
            vec![Event::TransportError {
                error: TransportError::MalformedPacket
            }]
        );
        assert_eq!(conn.stats().transport_errors, 1);
    }

    #[test]
    fn test_handshake_failure_closes_directly() {
        let mut conn = new_conn(Side::Client);
        conn.engine_mut()
            .expect_datagram(Err(EngineError::Crypto { alert: 42 }));
        conn.ingest(b"bad cert", t(1)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        let reason = conn.close_reason().unwrap();
        assert_eq!(reason.kind, CloseKind::HandshakeFailed);
        assert_eq!(reason.error_code, 0x12a);
    }

    #[test]
    fn test_resource_exhaustion_forces_close() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Err(EngineError::OutOfMemory));
        conn.ingest(b"pkt", t(5)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.close_reason().unwrap().kind,
            CloseKind::TransportFailure
        );
    }

    #[test]
    fn test_peer_flow_control_violation_closes_with_code() {
        let mut conn = active_conn(Side::Server);
        let too_much = Bytes::from(vec![0u8; 300 * 1024]);
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamData {
                stream_id: StreamId(0),
                offset: 0,
                data: too_much,
                fin: false,
            }]));
        conn.ingest(b"flood", t(5)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Draining);
        let out = conn.produce_datagrams(t(6)).unwrap();
        assert!(matches!(
            decode_frames(&out[0])[0],
            Frame::ConnectionClose { error_code: 0x03, .. }
        ));
    }

    #[test]
    fn test_write_failure_is_reported_as_event() {
        let mut conn = active_conn(Side::Client);
        conn.engine_mut()
            .fail_next_write(EngineError::Malformed);
        assert!(conn.produce_datagrams(t(5)).unwrap().is_empty());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.stats().transport_errors, 1);
    }
}

mod stream_tests {
    use super::*;

    #[test]
    fn test_write_reaches_engine() {
        let mut conn = active_conn(Side::Client);
        let id = conn.open_stream(StreamDirection::Bidirectional).unwrap();
        assert_eq!(conn.write(id, b"hello", true), Ok(5));

        let out = conn.produce_datagrams(t(2)).unwrap();
        assert_eq!(
            decode_frames(&out[0]),
            vec![Frame::Stream {
                stream_id: id,
                data: Bytes::from_static(b"hello"),
                fin: true
            }]
        );
        assert_eq!(conn.stats().streams_opened, 1);
    }

    #[test]
    fn test_read_extends_credit() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamData {
                stream_id: StreamId(0),
                offset: 0,
                data: Bytes::from_static(b"request"),
                fin: true,
            }]));
        conn.ingest(b"stream", t(2)).unwrap();

        assert_eq!(
            events(&mut conn),
            vec![
                Event::StreamOpened { stream_id: StreamId(0) },
                Event::StreamReadable { stream_id: StreamId(0) },
                Event::StreamFinished { stream_id: StreamId(0) },
            ]
        );

        let (data, fin) = conn.read(StreamId(0), 64).unwrap();
        assert_eq!(data, Bytes::from_static(b"request"));
        assert!(fin);
        assert_eq!(conn.engine().stream_credit(StreamId(0)), 7);
        assert_eq!(conn.engine().connection_credit(), 7);
        assert!(conn.stats().events_delivered >= 4);
    }

    #[test]
    fn test_stopped_stream_returns_connection_credit_on_peer_reset() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamData {
                stream_id: StreamId(2),
                offset: 0,
                data: Bytes::from_static(b"abcd"),
                fin: false,
            }]));
        conn.ingest(b"stream", t(2)).unwrap();
        conn.stop_sending(StreamId(2), 5).unwrap();
        assert_eq!(conn.engine().connection_credit(), 4);

        conn.engine_mut()
            .expect_datagram(Ok(vec![
                EngineCallback::StreamData {
                    stream_id: StreamId(2),
                    offset: 4,
                    data: Bytes::from_static(b"late"),
                    fin: false,
                },
                EngineCallback::StreamReset {
                    stream_id: StreamId(2),
                    error_code: 5,
                    final_size: 100,
                },
            ]));
        conn.ingest(b"reset", t(3)).unwrap();

        assert_eq!(conn.engine().connection_credit(), 100);
        assert_eq!(conn.streams().connection_flow().recv.received(), 100);
        assert!(!conn.streams().contains(StreamId(2)));
        assert_eq!(conn.state(), ConnectionState::Active);
    }

    #[test]
    fn test_waiting_read_fails_once_draining() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![
                EngineCallback::StreamData {
                    stream_id: StreamId(0),
                    offset: 0,
                    data: Bytes::from_static(b"ab"),
                    fin: false,
                },
                EngineCallback::StreamData {
                    stream_id: StreamId(4),
                    offset: 0,
                    data: Bytes::from_static(b"kept"),
                    fin: false,
                },
            ]));
        conn.ingest(b"stream", t(2)).unwrap();
        assert_eq!(conn.read(StreamId(0), 64).unwrap().0, Bytes::from_static(b"ab"));
        assert_eq!(conn.read(StreamId(0), 64), Err(Error::WouldBlock));

        conn.close(0, b"bye", t(3)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(conn.read(StreamId(0), 64), Err(Error::ConnectionClosed));

        // Buffered data is unaffected
        assert_eq!(conn.readable_streams(), vec![StreamId(4)]);
        assert_eq!(conn.read(StreamId(4), 64).unwrap().0, Bytes::from_static(b"kept"));
    }

    #[test]
    fn test_peer_stop_sending_triggers_reset() {
        let mut conn = active_conn(Side::Client);
        let id = conn.open_stream(StreamDirection::Bidirectional).unwrap();
        conn.write(id, b"abc", false).unwrap();
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StopSending {
                stream_id: id,
                error_code: 77,
            }]));
        conn.ingest(b"stop", t(2)).unwrap();

        let out = conn.produce_datagrams(t(3)).unwrap();
        assert_eq!(
            decode_frames(&out[0]),
            vec![Frame::ResetStream {
                stream_id: id,
                error_code: 77
            }]
        );
        assert_eq!(
            events(&mut conn),
            vec![Event::StopSending {
                stream_id: id,
                error_code: 77
            }]
        );
    }

    #[test]
    fn test_unacked_writes_reported_on_close() {
        let mut conn = active_conn(Side::Client);
        let id = conn.open_stream(StreamDirection::Unidirectional).unwrap();
        conn.write(id, b"pending", true).unwrap();
        conn.close(0, b"", t(2)).unwrap();
        conn.on_timeout(t(10_000));

        let last = events(&mut conn).pop();
        assert!(matches!(
            last,
            Some(Event::ConnectionClosed { writes_incomplete: true, .. })
        ));
    }

    #[test]
    fn test_acked_writes_complete() {
        let mut conn = active_conn(Side::Client);
        let id = conn.open_stream(StreamDirection::Unidirectional).unwrap();
        conn.write(id, b"done", true).unwrap();
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamAcked {
                stream_id: id,
                len: 4,
            }]));
        conn.ingest(b"ack", t(2)).unwrap();
        assert!(conn.stream_state(id).is_none());

        conn.close(0, b"", t(3)).unwrap();
        conn.on_timeout(t(10_000));
        let last = events(&mut conn).pop();
        assert!(matches!(
            last,
            Some(Event::ConnectionClosed { writes_incomplete: false, .. })
        ));
    }
}

mod dispatch_tests {
    use super::*;

    #[test]
    fn test_handler_failure_surfaces_as_diagnostic() {
        let mut conn = active_conn(Side::Server);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.set_connection_handler(move |event: &Event| -> Result<(), HandlerError> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        conn.set_default_stream_handler(|_: &Event| -> Result<(), HandlerError> {
            Err(HandlerError::new("app bug"))
        });

        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamData {
                stream_id: StreamId(4),
                offset: 0,
                data: Bytes::from_static(b"x"),
                fin: false,
            }]));
        conn.ingest(b"data", t(2)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.diagnostics().len(), 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .all(|e| matches!(e, Event::HandlerFailed { message, .. } if message == "app bug")));
    }

    #[test]
    fn test_queued_events_discarded_on_close() {
        let mut conn = active_conn(Side::Server);
        conn.engine_mut()
            .expect_datagram(Ok(vec![EngineCallback::StreamData {
                stream_id: StreamId(0),
                offset: 0,
                data: Bytes::from_static(b"unread"),
                fin: false,
            }]))
            .expect_datagram(Err(EngineError::OutOfMemory));
        conn.ingest(b"data", t(2)).unwrap();
        conn.ingest(b"boom", t(3)).unwrap();

        let seen = events(&mut conn);
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Event::ConnectionClosed { .. }));

        // Unread data survives the close
        let (data, _) = conn.read(StreamId(0), 64).unwrap();
        assert_eq!(data, Bytes::from_static(b"unread"));
    }
}
