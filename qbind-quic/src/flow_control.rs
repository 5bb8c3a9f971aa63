//! # Flow Control (RFC 9000 Section 4)
//!
//! Credit tracking at connection and stream level.
//!
//! Both directions keep `consumed <= limit` at all times. A limit only ever
//! grows: MAX_DATA / MAX_STREAM_DATA values at or below the current limit
//! are stale and ignored.

#![forbid(unsafe_code)]

use crate::error::{TransportError, TransportErrorCode};

/// Send-direction window (credit granted by the peer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    /// Bytes accepted for sending so far
    consumed: u64,

    /// Highest offset the peer allows
    limit: u64,
}

impl SendWindow {
    pub fn new(limit: u64) -> Self {
        Self { consumed: 0, limit }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Remaining credit
    pub fn credit(&self) -> u64 {
        self.limit - self.consumed
    }

    /// Take up to `want` bytes of credit, returning how many were granted
    pub fn reserve(&mut self, want: u64) -> u64 {
        let granted = want.min(self.credit());
        self.consumed += granted;
        granted
    }

    /// Raise the limit (MAX_DATA / MAX_STREAM_DATA)
    ///
    /// Returns true if the limit increased.
    pub fn extend(&mut self, limit: u64) -> bool {
        if limit > self.limit {
            self.limit = limit;
            true
        } else {
            false
        }
    }
}

/// Receive-direction window (credit we grant the peer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWindow {
    /// Highest offset received from the peer
    received: u64,

    /// Bytes handed to the application
    read: u64,

    /// Highest offset the peer may send
    limit: u64,

    /// Window size re-advertised as the application reads
    window: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            received: 0,
            read: 0,
            limit: window,
            window,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes consumed by the application so far
    pub fn consumed(&self) -> u64 {
        self.read
    }

    /// Record that the peer's data now reaches `end_offset`
    ///
    /// # Errors
    /// FLOW_CONTROL_ERROR if the peer exceeded the advertised limit.
    pub fn on_received(&mut self, end_offset: u64) -> Result<(), TransportError> {
        if end_offset > self.limit {
            return Err(TransportError::ProtocolViolation {
                code: TransportErrorCode::FlowControlError.code(),
            });
        }
        self.received = self.received.max(end_offset);
        Ok(())
    }

    /// Record `bytes` read by the application and slide the window.
    ///
    /// Returns the number of bytes the advertised limit grew by.
    pub fn on_read(&mut self, bytes: u64) -> u64 {
        self.read += bytes;
        let new_limit = self.read + self.window;
        if new_limit > self.limit {
            let delta = new_limit - self.limit;
            self.limit = new_limit;
            delta
        } else {
            0
        }
    }
}

/// Connection-Level Flow Control
#[derive(Debug, Clone, Copy)]
pub struct ConnectionFlowControl {
    pub send: SendWindow,
    pub recv: RecvWindow,
}

impl ConnectionFlowControl {
    pub fn new(send_limit: u64, recv_window: u64) -> Self {
        Self {
            send: SendWindow::new(send_limit),
            recv: RecvWindow::new(recv_window),
        }
    }
}
