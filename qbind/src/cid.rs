//! Connection ID issuance and stateless reset tokens.
//!
//! Locally chosen connection IDs are random bytes from the OS entropy
//! source. Reset tokens (RFC 9000 Section 10.3) are derived from the
//! connection ID with keyed SipHash-1-3, so any endpoint sharing the key can
//! recompute them without per-connection state.

use std::hash::Hasher;

use bytes::Bytes;
use qbind_quic::types::MAX_CID_LENGTH;
use qbind_quic::ConnectionId;
use siphasher::sip::SipHasher13;

use crate::error::{EndpointError, Result};

/// Key used when none is configured. Rotate by constructing with `with_key`.
const DEFAULT_RESET_KEY: (u64, u64) = (0x0706050403020100, 0x0f0e0d0c0b0a0908);

/// Length of a stateless reset token
pub const RESET_TOKEN_LEN: usize = 16;

/// Smallest stateless reset: five unpredictable bytes, then the token
pub const MIN_STATELESS_RESET_SIZE: usize = 5 + RESET_TOKEN_LEN;

const MAX_STATELESS_RESET_SIZE: usize = 43;

#[derive(Debug, Clone)]
pub struct CidGenerator {
    cid_len: usize,
    key: (u64, u64),
}

impl CidGenerator {
    pub fn new(cid_len: usize) -> Result<Self> {
        Self::with_key(cid_len, DEFAULT_RESET_KEY)
    }

    pub fn with_key(cid_len: usize, key: (u64, u64)) -> Result<Self> {
        if cid_len == 0 || cid_len > MAX_CID_LENGTH {
            return Err(EndpointError::InvalidCidLength(cid_len));
        }
        Ok(Self { cid_len, key })
    }

    pub fn cid_len(&self) -> usize {
        self.cid_len
    }

    /// Fresh random connection ID
    pub fn generate(&self) -> Result<ConnectionId> {
        let mut bytes = [0u8; MAX_CID_LENGTH];
        getrandom::getrandom(&mut bytes[..self.cid_len])
            .map_err(|e| EndpointError::Entropy(e.to_string()))?;
        ConnectionId::from_slice(&bytes[..self.cid_len])
            .ok_or(EndpointError::InvalidCidLength(self.cid_len))
    }

    /// Stateless reset token bound to `cid`
    pub fn reset_token(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_LEN] {
        let mut token = [0u8; RESET_TOKEN_LEN];
        // Two domain-separated hashes fill the 128-bit token
        for (half, chunk) in token.chunks_exact_mut(8).enumerate() {
            let mut hasher = SipHasher13::new_with_keys(self.key.0, self.key.1);
            hasher.write_u8(half as u8);
            hasher.write(cid.as_bytes());
            chunk.copy_from_slice(&hasher.finish().to_be_bytes());
        }
        token
    }

    /// Stateless reset (RFC 9000 Section 10.3) answering a datagram of
    /// `trigger_len` bytes addressed to `cid`.
    ///
    /// The reset is one byte shorter than the trigger so two endpoints
    /// cannot keep resetting each other. Returns None when that would be
    /// below [`MIN_STATELESS_RESET_SIZE`].
    pub fn stateless_reset(&self, cid: &ConnectionId, trigger_len: usize) -> Result<Option<Bytes>> {
        let len = trigger_len.saturating_sub(1).min(MAX_STATELESS_RESET_SIZE);
        if len < MIN_STATELESS_RESET_SIZE {
            return Ok(None);
        }

        let mut packet = vec![0u8; len];
        let token_at = len - RESET_TOKEN_LEN;
        getrandom::getrandom(&mut packet[..token_at])
            .map_err(|e| EndpointError::Entropy(e.to_string()))?;
        // Looks like a short header: form bit clear, fixed bit set
        packet[0] = (packet[0] & 0x3f) | 0x40;
        packet[token_at..].copy_from_slice(&self.reset_token(cid));
        Ok(Some(Bytes::from(packet)))
    }

    /// Constant-time comparison against the expected token for `cid`
    pub fn verify_reset_token(&self, cid: &ConnectionId, token: &[u8]) -> bool {
        let expected = self.reset_token(cid);
        if token.len() != expected.len() {
            return false;
        }
        expected
            .iter()
            .zip(token)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
