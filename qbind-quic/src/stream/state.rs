//! Per-direction stream states (RFC 9000 Section 3.1 and 3.2).

#![forbid(unsafe_code)]

/// Sending part of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Opened, nothing written yet
    Ready,

    /// Application data accepted
    Send,

    /// FIN accepted, waiting for acknowledgements
    DataSent,

    /// Every byte up to FIN acknowledged (terminal)
    DataRecvd,

    /// Reset by us, either on request or after the peer's STOP_SENDING (terminal)
    ResetSent,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SendState::DataRecvd | SendState::ResetSent)
    }

    /// Whether `write` may still accept bytes
    pub fn is_writable(self) -> bool {
        matches!(self, SendState::Ready | SendState::Send)
    }
}

/// Receiving part of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Receiving data, final size unknown
    Recv,

    /// FIN received; buffered data still waiting for the application
    SizeKnown,

    /// Application consumed everything up to FIN (terminal)
    DataRecvd,

    /// Peer reset the stream, or we abandoned it with STOP_SENDING (terminal)
    ResetRecvd,
}

impl RecvState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecvState::DataRecvd | RecvState::ResetRecvd)
    }
}

/// Snapshot of both halves of a stream.
///
/// A half is `None` when the stream is unidirectional and that direction
/// does not exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub send: Option<SendState>,
    pub recv: Option<RecvState>,
}

impl StreamStatus {
    /// Both existing halves are terminal
    pub fn is_terminal(&self) -> bool {
        self.send.map_or(true, SendState::is_terminal) && self.recv.map_or(true, RecvState::is_terminal)
    }
}
