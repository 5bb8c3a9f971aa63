//! # Stream Buffers
//!
//! The packet engine delivers stream data in order, so the receive side is a
//! plain FIFO of `Bytes` chunks; there is no reassembly here. The send side
//! only tracks accounting: payload bytes are handed to the engine as soon as
//! `write` accepts them, and the engine reports acknowledgements back.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{TransportError, TransportErrorCode};
use crate::types::StreamOffset;

/// Ordered receive buffer for one stream
#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: VecDeque<Bytes>,

    /// Bytes currently buffered
    buffered: usize,

    /// Offset of the next byte expected from the engine
    expected_offset: StreamOffset,

    /// Final size, once FIN was seen
    final_size: Option<StreamOffset>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data delivered by the engine at `offset`.
    ///
    /// Retransmitted bytes that were already delivered are trimmed. Returns
    /// the number of new bytes buffered.
    ///
    /// # Errors
    /// - FINAL_SIZE_ERROR if data runs past a known final size, FIN moves it
    ///   or the end offset overflows
    /// - INTERNAL_ERROR if the engine skipped ahead (it must deliver in order)
    pub fn insert(
        &mut self,
        offset: StreamOffset,
        mut data: Bytes,
        fin: bool,
    ) -> Result<usize, TransportError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(TransportError::ProtocolViolation {
                code: TransportErrorCode::FinalSizeError.code(),
            })?;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(TransportError::ProtocolViolation {
                    code: TransportErrorCode::FinalSizeError.code(),
                });
            }
        }

        if offset > self.expected_offset {
            return Err(TransportError::ProtocolViolation {
                code: TransportErrorCode::InternalError.code(),
            });
        }

        if fin {
            self.final_size = Some(end);
        }

        if end <= self.expected_offset {
            return Ok(0);
        }

        let skip = (self.expected_offset - offset) as usize;
        data.advance(skip);
        let added = data.len();
        self.expected_offset = end;
        self.buffered += added;
        self.chunks.push_back(data);
        Ok(added)
    }

    /// Take up to `max_len` buffered bytes.
    pub fn read(&mut self, max_len: usize) -> Bytes {
        let want = max_len.min(self.buffered);
        if want == 0 {
            return Bytes::new();
        }

        // Fast path: the front chunk alone satisfies the read
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= want {
                let out = front.split_to(want);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                self.buffered -= want;
                return out;
            }
        }

        let mut out = BytesMut::with_capacity(want);
        while out.len() < want {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = (want - out.len()).min(front.len());
            out.extend_from_slice(&front.split_to(take));
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        self.buffered -= out.len();
        out.freeze()
    }

    /// Drop everything buffered, returning how many bytes were discarded
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffered;
        self.chunks.clear();
        self.buffered = 0;
        dropped
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    pub fn final_size(&self) -> Option<StreamOffset> {
        self.final_size
    }
}

/// Send-side accounting for one stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendBuffer {
    /// Bytes accepted from the application and handed to the engine
    accepted: u64,

    /// Bytes the engine reported as acknowledged by the peer
    acked: u64,

    /// FIN queued after `accepted` bytes
    fin: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, len: usize) {
        self.accepted += len as u64;
    }

    pub fn finish(&mut self) {
        self.fin = true;
    }

    /// Discard `len` acknowledged bytes; clamped at what was accepted
    pub fn acknowledge(&mut self, len: u64) {
        self.acked = (self.acked + len).min(self.accepted);
    }

    /// Forget unacknowledged data (after a reset)
    pub fn abandon(&mut self) {
        self.acked = self.accepted;
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn unacked(&self) -> u64 {
        self.accepted - self.acked
    }

    pub fn is_finished(&self) -> bool {
        self.fin
    }

    /// FIN queued and every byte acknowledged
    pub fn is_fully_acked(&self) -> bool {
        self.fin && self.acked == self.accepted
    }
}
