//! Search and Monitoring Algorithms
//!
//! The algorithms that walk the implicit binary search tree over log
//! entries. They are written against the `Prober` handle so the server
//! (producing a `CombinedTreeProof` from its database) and a verifier
//! (consuming one) run exactly the same code; any divergence between the
//! two runs surfaces as a proof violation.

pub mod monitor;
pub mod provider;
pub mod search;

pub use monitor::{monitor, OwnerState};
pub use provider::{
    AlgorithmError, DataProvider, Prober, ProofConsumer, ProofProducer, ResolvedVersion,
    VersionResolver,
};
pub use search::{
    fixed_version_search, greatest_version_search, rightmost_distinguished, update_view,
    ViewParams,
};
