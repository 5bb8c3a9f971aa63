//! Endpoint errors.

use qbind_quic::EngineError;
use thiserror::Error;

use crate::endpoint::ConnectionHandle;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Operation on a connection failed
    #[error("connection error: {0}")]
    Connection(#[from] qbind_quic::Error),

    /// The engine factory could not create an engine instance
    #[error("engine creation failed: {0}")]
    Engine(#[from] EngineError),

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionHandle),

    /// Operating system entropy source failed
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    #[error("invalid connection ID length {0}")]
    InvalidCidLength(usize),
}

pub type Result<T> = std::result::Result<T, EndpointError>;
