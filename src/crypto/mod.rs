//! Cryptographic Primitives
//!
//! Cipher suite constants, HMAC commitments, tree-head signatures, and the
//! VRF that blinds labels before they reach the prefix tree.

pub mod commitment;
pub mod signature;
pub mod suite;
pub mod vrf;

pub use commitment::{commit, generate_opening, verify_commitment};
pub use signature::{SigningKeyPair, VerifierKey};
pub use suite::{CipherSuite, Hash, EMPTY_HASH, HASH_SIZE};
pub use vrf::{VrfPrivateKey, VrfProof, VrfPublicKey};
