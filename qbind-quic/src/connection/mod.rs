//! # Connection State Machine (RFC 9000 Section 10)
//!
//! A [`Connection`] ties together one engine instance, the stream registry,
//! the event dispatcher and the connection timers. It is sans-IO: the host
//! moves datagrams in and out and supplies the current time.

pub mod state;

#[cfg(test)]
mod tests;

pub use state::{Connection, ConnectionState, ConnectionStats};
