//! # Streams (RFC 9000 Sections 2 and 3)
//!
//! Per-stream state machines, buffers, and the registry that owns them.

pub mod buffer;
pub mod registry;
pub mod state;

pub use buffer::{RecvBuffer, SendBuffer};
pub use registry::{ReadOutcome, StreamRegistry, WriteOutcome};
pub use state::{RecvState, SendState, StreamStatus};
