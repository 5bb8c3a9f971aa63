//! qbind-quic: QUIC connection and stream orchestration over an external packet engine
//!
//! The packet engine (wire format, TLS 1.3, loss recovery, congestion
//! control) is an external collaborator behind the [`PacketEngine`] trait.
//! This crate drives a connection's lifecycle on top of it, multiplexes
//! application streams with flow control, and turns engine callbacks into
//! ordered application events.
//!
//! # Architecture
//!
//! - **Sans-IO**: `ingest` a datagram, pull `produce_datagrams`, pass `now`
//!   explicitly. No sockets, no clocks, no threads.
//! - **Single owner per connection**: every `Connection` owns its engine
//!   instance; nothing is shared between connections.
//! - **Non-blocking**: writes under backpressure and reads with no data
//!   return immediately; the matching event says when to retry.
//!
//! # Module Organization
//!
//! - `engine`: Packet Engine Adapter and the scripted loopback engine
//! - `stream`: Stream Registry, per-stream states and buffers
//! - `flow_control`: Stream and connection credit windows
//! - `connection`: Connection State Machine
//! - `event`: Event Dispatcher
//! - `timer`: Timer/Scheduler Adapter
//! - `config`, `params`: Local configuration and transport parameters

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow_control;
pub mod params;
pub mod stream;
pub mod timer;
pub mod types;

// Re-export key types
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use engine::{EngineAdapter, EngineCallback, EngineError, PacketEngine, ScriptedEngine};
pub use error::{Error, Result, TransportError, TransportErrorCode};
pub use event::{
    CloseKind, CloseReason, Diagnostic, Event, EventDispatcher, EventHandler, HandlerError,
};
pub use params::TransportParameters;
pub use stream::{RecvState, SendState, StreamRegistry, StreamStatus};
pub use timer::{TimerKind, TimerSet};
pub use types::{ConnectionId, Instant, Side, StreamDirection, StreamId};
