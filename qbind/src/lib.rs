//! qbind endpoint crate.
//!
//! Hosts `qbind-quic` connections: routes inbound datagrams by connection ID,
//! accepts new server connections, issues connection IDs, loads configuration
//! and sets up logging. Socket I/O stays with the caller.

pub mod bridge;
pub mod cid;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod telemetry;

pub use bridge::{ChannelHandler, EndpointEvent};
pub use cid::CidGenerator;
pub use config::{load_config, EndpointConfig};
pub use endpoint::{
    ConnectionHandle, DatagramHeader, DatagramOutcome, DropReason, Endpoint, EngineFactory,
    Transmit,
};
pub use error::EndpointError;
