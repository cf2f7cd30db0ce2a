//! ktlog - Key Transparency Log Server
//!
//! A transparency log binding user-visible labels to opaque values in a
//! publicly verifiable append-only log. The core is three tightly coupled
//! trees:
//!
//! 1. **Log tree** - a right-appending Merkle tree over log entries,
//!    stored in fixed-shape chunks, with batched inclusion and
//!    consistency proofs (`log_tree`).
//! 2. **Prefix tree** - a versioned Merkle radix tree over VRF outputs,
//!    stored in size-bounded tiles, with batched (non-)inclusion proofs
//!    (`prefix_tree`).
//! 3. **Transparency tree** - their composition: each log entry pins a
//!    timestamp and a prefix root; clients search the log with binary
//!    ladders and monitor their own labels (`transparency`,
//!    `algorithms`).
//!
//! Lookups are blinded: the server's prefix tree is keyed by VRF outputs,
//! so the storage layer never sees raw labels on the read path (`crypto`).

// Core modules
pub mod algorithms;
pub mod api;
pub mod common;
pub mod config;
pub mod crypto;
pub mod ladder;
pub mod log_tree;
pub mod logging;
pub mod prefix_tree;
pub mod sequencer;
pub mod storage;
pub mod transparency;
pub mod treemath;
pub mod wire;

// Re-exports: root error type
pub use common::{KtError, Result};

// Re-exports: configuration and logging
pub use config::{Environment, KtConfig};
pub use logging::{init_from_config, init_logging, LogLevel};

// Re-exports: cryptography
pub use crypto::{CipherSuite, Hash, SigningKeyPair, VerifierKey, VrfPrivateKey, VrfPublicKey};

// Re-exports: storage
pub use storage::{MemoryStore, SqliteStore, TransparencyStore};

// Re-exports: transparency core
pub use transparency::{
    MonitorResponse, MutateOutcome, SearchVerifier, TransparencyLog, VerifiedSearch,
};

// Re-exports: sequencer
pub use sequencer::{MutateReceipt, MutateRequest, SequencerHandle};

// Re-exports: wire types clients handle directly
pub use wire::{
    DeploymentMode, PublicConfig, SearchRequest, SearchResponse, TreeHead, UpdateValue,
};
