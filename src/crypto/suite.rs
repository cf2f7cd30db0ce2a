//! Cipher Suite Parameters
//!
//! A suite names the hash, signature and VRF algorithms together with every
//! size and domain separator the protocol depends on. Only one suite is
//! registered; the wire format reserves a u16 for future ones.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Output of the suite hash.
pub type Hash = [u8; 32];

/// Size of the suite hash output in bytes.
pub const HASH_SIZE: usize = 32;

/// Canonical hash of an empty prefix-tree subtree.
pub const EMPTY_HASH: Hash = [0u8; 32];

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("unknown cipher suite id: {0}")]
    UnknownSuite(u16),
}

/// Registered cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// SHA-256 tree hash, Ed25519 signatures, ECVRF-Edwards25519-SHA512-TAI.
    KtEd25519Sha256,
}

impl CipherSuite {
    pub fn id(&self) -> u16 {
        match self {
            CipherSuite::KtEd25519Sha256 => 0x0001,
        }
    }

    pub fn from_id(id: u16) -> Result<Self, SuiteError> {
        match id {
            0x0001 => Ok(CipherSuite::KtEd25519Sha256),
            other => Err(SuiteError::UnknownSuite(other)),
        }
    }

    pub fn hash_size(&self) -> usize {
        HASH_SIZE
    }

    pub fn signature_size(&self) -> usize {
        64
    }

    pub fn signature_public_key_size(&self) -> usize {
        32
    }

    pub fn vrf_public_key_size(&self) -> usize {
        32
    }

    pub fn vrf_proof_size(&self) -> usize {
        80
    }

    pub fn vrf_output_size(&self) -> usize {
        32
    }

    pub fn commitment_opening_size(&self) -> usize {
        16
    }

    /// Fixed HMAC key for commitments. Public by design: hiding comes from
    /// the random opening, the key only separates this use of HMAC.
    pub fn commitment_fixed_bytes(&self) -> [u8; 16] {
        [
            0xd8, 0x21, 0xf8, 0x79, 0x0d, 0x97, 0x70, 0x97, 0xf6, 0xe8, 0x93, 0xcc, 0x2e, 0x6b,
            0x54, 0xd1,
        ]
    }

    /// Suite hash over one buffer.
    pub fn hash(&self, data: &[u8]) -> Hash {
        let mut h = Sha256::new();
        h.update(data);
        h.finalize().into()
    }

    /// Suite hash over a sequence of buffers.
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Hash {
        let mut h = Sha256::new();
        for p in parts {
            h.update(p);
        }
        h.finalize().into()
    }
}
