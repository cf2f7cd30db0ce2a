//! Proof Handles and the Data Provider
//!
//! A `Prober` answers the three questions the search algorithms ask about
//! the log: an entry's timestamp, a binary ladder's verdict at an entry,
//! and a final point inclusion for the terminal entry. The producer
//! answers from storage while appending everything it used to a
//! `CombinedTreeProof`; the consumer answers by draining the same bundle
//! in the same order.
//!
//! Both sides share the `DataProvider`, which remembers every timestamp
//! and prefix root learned per log position and rejects conflicting or
//! non-monotonic facts.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::crypto::{CipherSuite, Hash};
use crate::ladder::{LadderError, LadderFlavor, LadderState, LadderWalker};
use crate::log_tree::{LogTree, LogTreeError};
use crate::prefix_tree::{self, PrefixTree, PrefixTreeError, ProofLookup};
use crate::storage::{StorageError, TransparencyStore};
use crate::wire::{CombinedTreeProof, LogEntry, PrefixSearchResult};

#[derive(Debug, Error)]
pub enum AlgorithmError {
    /// The label has no version matching the request.
    #[error("label not found")]
    LabelNotFound,

    /// The requested version fell outside the maximum lifetime.
    #[error("label expired")]
    LabelExpired,

    /// A verifier-visible inconsistency; the offending bundle should be
    /// preserved as evidence.
    #[error("proof violation: {0}")]
    ProofViolation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Server-side data that contradicts itself.
    #[error("storage is corrupt: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<LadderError> for AlgorithmError {
    fn from(e: LadderError) -> Self {
        AlgorithmError::ProofViolation(e.to_string())
    }
}

impl From<PrefixTreeError> for AlgorithmError {
    fn from(e: PrefixTreeError) -> Self {
        match e {
            PrefixTreeError::Storage(s) => AlgorithmError::Storage(s),
            PrefixTreeError::MalformedProof(m) => AlgorithmError::ProofViolation(m),
            other => AlgorithmError::Corruption(other.to_string()),
        }
    }
}

impl From<LogTreeError> for AlgorithmError {
    fn from(e: LogTreeError) -> Self {
        match e {
            LogTreeError::Storage(s) => AlgorithmError::Storage(s),
            LogTreeError::MalformedProof(m) => AlgorithmError::ProofViolation(m),
            LogTreeError::Corruption(m) => AlgorithmError::Corruption(m),
        }
    }
}

/// The VRF output (and, for verifiers, the commitment) for one version of
/// the searched label.
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub output: [u8; 32],
    pub commitment: Option<Hash>,
}

/// Maps a version number of the searched label to its VRF output. The
/// producer evaluates its VRF key; the consumer checks the VRF proofs in
/// the response's binary ladder steps, in first-use order.
pub trait VersionResolver: Send {
    fn resolve(&mut self, version: u32) -> Result<ResolvedVersion, AlgorithmError>;
}

/// Timestamps and prefix roots learned per log position.
#[derive(Debug, Default)]
pub struct DataProvider {
    timestamps: BTreeMap<u64, u64>,
    roots: BTreeMap<u64, Hash>,
}

impl DataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(&self, pos: u64) -> Option<u64> {
        self.timestamps.get(&pos).copied()
    }

    pub fn root(&self, pos: u64) -> Option<Hash> {
        self.roots.get(&pos).copied()
    }

    /// Positions inspected so far, ascending.
    pub fn inspected(&self) -> Vec<u64> {
        self.timestamps.keys().copied().collect()
    }

    /// Record a timestamp; rejects conflicts and ordering violations
    /// (`pos1 < pos2` implies `ts1 <= ts2`).
    pub fn insert_timestamp(&mut self, pos: u64, ts: u64) -> Result<(), AlgorithmError> {
        if let Some(&existing) = self.timestamps.get(&pos) {
            if existing != ts {
                return Err(AlgorithmError::ProofViolation(format!(
                    "conflicting timestamps for position {pos}"
                )));
            }
            return Ok(());
        }
        if let Some((_, &prev)) = self.timestamps.range(..pos).next_back() {
            if prev > ts {
                return Err(AlgorithmError::ProofViolation(format!(
                    "timestamp at position {pos} is older than its predecessor"
                )));
            }
        }
        if let Some((_, &next)) = self.timestamps.range(pos + 1..).next() {
            if ts > next {
                return Err(AlgorithmError::ProofViolation(format!(
                    "timestamp at position {pos} is newer than its successor"
                )));
            }
        }
        self.timestamps.insert(pos, ts);
        Ok(())
    }

    pub fn insert_root(&mut self, pos: u64, root: Hash) -> Result<(), AlgorithmError> {
        if let Some(&existing) = self.roots.get(&pos) {
            if existing != root {
                return Err(AlgorithmError::ProofViolation(format!(
                    "conflicting prefix roots for position {pos}"
                )));
            }
            return Ok(());
        }
        self.roots.insert(pos, root);
        Ok(())
    }
}

/// The question-answering surface the algorithms run against.
#[async_trait]
pub trait Prober: Send {
    async fn timestamp(&mut self, pos: u64) -> Result<u64, AlgorithmError>;

    /// Run a binary ladder at `pos` and classify the entry's greatest
    /// version against `target`.
    async fn ladder(
        &mut self,
        pos: u64,
        flavor: LadderFlavor,
        target: u32,
    ) -> Result<Ordering, AlgorithmError>;

    /// Prove that `version` is present at `pos`.
    async fn point_inclusion(&mut self, pos: u64, version: u32) -> Result<(), AlgorithmError>;
}

// ============================================================================
// Producer
// ============================================================================

/// Answers probes from the database while accumulating the proof bundle.
pub struct ProofProducer<'a> {
    cs: CipherSuite,
    store: &'a dyn TransparencyStore,
    resolver: &'a mut dyn VersionResolver,
    /// Log positions at which each version of the label was added.
    index: Vec<u64>,
    target: u32,
    provider: DataProvider,
    ladder_state: LadderState,
    bundle: CombinedTreeProof,
    /// Positions whose prefix root a verifier can derive from a proof.
    root_proven: BTreeSet<u64>,
    /// Distinct versions probed, in first-use order.
    probed: Vec<u32>,
    commitments: HashMap<u32, Hash>,
}

impl<'a> ProofProducer<'a> {
    pub fn new(
        cs: CipherSuite,
        store: &'a dyn TransparencyStore,
        resolver: &'a mut dyn VersionResolver,
        index: Vec<u64>,
        target: u32,
    ) -> Self {
        Self {
            cs,
            store,
            resolver,
            index,
            target,
            provider: DataProvider::new(),
            ladder_state: LadderState::new(),
            bundle: CombinedTreeProof::default(),
            root_proven: BTreeSet::new(),
            probed: Vec::new(),
            commitments: HashMap::new(),
        }
    }

    /// Greatest version of the label present at `pos`, if any.
    fn greatest_at(&self, pos: u64) -> Option<u32> {
        let count = self.index.partition_point(|&p| p <= pos);
        if count == 0 {
            None
        } else {
            Some((count - 1) as u32)
        }
    }

    async fn read_entry(&mut self, pos: u64) -> Result<LogEntry, AlgorithmError> {
        let raw = self.store.get_entry(pos).await?;
        let entry = LogEntry::decode(&raw)
            .map_err(|e| AlgorithmError::Corruption(format!("log entry {pos}: {e}")))?;
        Ok(entry)
    }

    fn note_probe(&mut self, version: u32) {
        if !self.probed.contains(&version) {
            self.probed.push(version);
        }
    }

    /// Close the run: attach missing prefix roots and produce the batched
    /// log inclusion proof. Returns the bundle plus, for each distinct
    /// version probed (in first-use order), the commitment to put in its
    /// binary ladder step; the target version never carries one.
    pub async fn finalize(
        mut self,
        tree_size: u64,
        last_known: Option<u64>,
    ) -> Result<(CombinedTreeProof, Vec<(u32, Option<Hash>)>), AlgorithmError> {
        let inspected = self.provider.inspected();
        for &pos in &inspected {
            if !self.root_proven.contains(&pos) {
                let root = self
                    .provider
                    .root(pos)
                    .expect("every inspected entry has a recorded root");
                self.bundle.prefix_roots.push(root);
            }
        }
        let store = self.store;
        let log = LogTree::new(self.cs, store.log_store());
        let elements = log.get_batch(&inspected, tree_size, last_known).await?;
        self.bundle.inclusion.elements = elements;

        let steps = self
            .probed
            .iter()
            .map(|version| {
                let commitment = if *version == self.target {
                    None
                } else {
                    self.commitments.get(version).copied()
                };
                (*version, commitment)
            })
            .collect();
        Ok((self.bundle, steps))
    }
}

#[async_trait]
impl Prober for ProofProducer<'_> {
    async fn timestamp(&mut self, pos: u64) -> Result<u64, AlgorithmError> {
        if let Some(ts) = self.provider.timestamp(pos) {
            return Ok(ts);
        }
        let entry = self.read_entry(pos).await?;
        self.provider.insert_timestamp(pos, entry.timestamp)?;
        self.provider.insert_root(pos, entry.prefix_root)?;
        self.bundle.timestamps.push(entry.timestamp);
        Ok(entry.timestamp)
    }

    async fn ladder(
        &mut self,
        pos: u64,
        flavor: LadderFlavor,
        target: u32,
    ) -> Result<Ordering, AlgorithmError> {
        let greatest = self.greatest_at(pos);
        let mut walker = LadderWalker::new(flavor, target, pos);
        let mut emitted: Vec<(u32, bool)> = Vec::new();
        while let Some(v) = walker.next_version(&self.ladder_state)? {
            let included = greatest.is_some_and(|g| v <= g);
            walker.record(v, included, &mut self.ladder_state)?;
            emitted.push((v, included));
        }

        if !emitted.is_empty() {
            let mut outputs = Vec::with_capacity(emitted.len());
            for &(v, _) in &emitted {
                self.note_probe(v);
                outputs.push(self.resolver.resolve(v)?.output);
            }
            let store = self.store;
            let tree = PrefixTree::new(self.cs, store.prefix_store());
            let mut searched = tree.search(&[(pos, outputs)]).await?;
            let result = searched.remove(0);
            for ((v, included), outcome) in emitted.iter().zip(&result.outcomes) {
                if *included != outcome.is_present() {
                    return Err(AlgorithmError::Corruption(format!(
                        "prefix tree disagrees with index for version {v} at position {pos}"
                    )));
                }
                if let Some(c) = outcome.commitment() {
                    self.commitments.insert(*v, c);
                }
            }
            let entry = self.read_entry(pos).await?;
            self.provider.insert_root(pos, entry.prefix_root)?;
            self.root_proven.insert(pos);
            self.bundle.prefix_proofs.push(result.proof);
        }

        walker
            .verdict()
            .ok_or_else(|| AlgorithmError::Corruption(format!("ladder at {pos} is ambiguous")))
    }

    async fn point_inclusion(&mut self, pos: u64, version: u32) -> Result<(), AlgorithmError> {
        self.note_probe(version);
        let output = self.resolver.resolve(version)?.output;
        let store = self.store;
        let tree = PrefixTree::new(self.cs, store.prefix_store());
        let mut searched = tree.search(&[(pos, vec![output])]).await?;
        let result = searched.remove(0);
        if !result.outcomes[0].is_present() {
            return Err(AlgorithmError::Corruption(format!(
                "terminal entry {pos} is missing version {version}"
            )));
        }
        let entry = self.read_entry(pos).await?;
        self.provider.insert_root(pos, entry.prefix_root)?;
        self.root_proven.insert(pos);
        self.ladder_state.note_inclusion(version, pos);
        self.bundle.prefix_proofs.push(result.proof);
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Answers probes by draining a received bundle in producer order.
pub struct ProofConsumer<'a> {
    cs: CipherSuite,
    bundle: &'a CombinedTreeProof,
    resolver: &'a mut dyn VersionResolver,
    ts_idx: usize,
    proof_idx: usize,
    provider: DataProvider,
    ladder_state: LadderState,
    root_proven: BTreeSet<u64>,
}

impl<'a> ProofConsumer<'a> {
    pub fn new(
        cs: CipherSuite,
        bundle: &'a CombinedTreeProof,
        resolver: &'a mut dyn VersionResolver,
    ) -> Self {
        Self {
            cs,
            bundle,
            resolver,
            ts_idx: 0,
            proof_idx: 0,
            provider: DataProvider::new(),
            ladder_state: LadderState::new(),
            root_proven: BTreeSet::new(),
        }
    }

    fn next_prefix_proof(&mut self) -> Result<&'a crate::wire::PrefixProof, AlgorithmError> {
        let proof = self.bundle.prefix_proofs.get(self.proof_idx).ok_or_else(|| {
            AlgorithmError::ProofViolation("proof bundle has too few prefix proofs".into())
        })?;
        self.proof_idx += 1;
        Ok(proof)
    }

    /// Close the run: consume the raw prefix roots, check the bundle was
    /// drained exactly, and return the leaf hash of every inspected entry.
    pub fn finalize(mut self) -> Result<Vec<(u64, Hash)>, AlgorithmError> {
        let inspected = self.provider.inspected();
        let mut root_idx = 0usize;
        for &pos in &inspected {
            if !self.root_proven.contains(&pos) {
                let root = self.bundle.prefix_roots.get(root_idx).ok_or_else(|| {
                    AlgorithmError::ProofViolation("proof bundle has too few prefix roots".into())
                })?;
                root_idx += 1;
                self.provider.insert_root(pos, *root)?;
            }
        }
        if self.ts_idx != self.bundle.timestamps.len()
            || self.proof_idx != self.bundle.prefix_proofs.len()
            || root_idx != self.bundle.prefix_roots.len()
        {
            return Err(AlgorithmError::ProofViolation(
                "proof bundle has unconsumed items".into(),
            ));
        }

        let mut entries = Vec::with_capacity(inspected.len());
        for pos in inspected {
            let entry = LogEntry {
                timestamp: self.provider.timestamp(pos).expect("inspected"),
                prefix_root: self.provider.root(pos).expect("root recorded"),
            };
            entries.push((pos, self.cs.hash(&entry.encode())));
        }
        Ok(entries)
    }
}

#[async_trait]
impl Prober for ProofConsumer<'_> {
    async fn timestamp(&mut self, pos: u64) -> Result<u64, AlgorithmError> {
        if let Some(ts) = self.provider.timestamp(pos) {
            return Ok(ts);
        }
        let ts = *self.bundle.timestamps.get(self.ts_idx).ok_or_else(|| {
            AlgorithmError::ProofViolation("proof bundle has too few timestamps".into())
        })?;
        self.ts_idx += 1;
        self.provider.insert_timestamp(pos, ts)?;
        Ok(ts)
    }

    async fn ladder(
        &mut self,
        pos: u64,
        flavor: LadderFlavor,
        target: u32,
    ) -> Result<Ordering, AlgorithmError> {
        let mut walker = LadderWalker::new(flavor, target, pos);

        // First pass: determine which versions this ladder will emit. The
        // walker is deterministic given the shared ladder state, so the
        // emitted sequence must line up with the proof's results.
        let mut emitted: Vec<u32> = Vec::new();
        {
            let mut preview = LadderWalker::new(flavor, target, pos);
            let mut state = self.ladder_state.clone();
            let proof = self.bundle.prefix_proofs.get(self.proof_idx);
            let mut i = 0usize;
            while let Some(v) = preview.next_version(&state)? {
                let proof = proof.ok_or_else(|| {
                    AlgorithmError::ProofViolation(
                        "proof bundle has too few prefix proofs".into(),
                    )
                })?;
                let result = proof.results.get(i).ok_or_else(|| {
                    AlgorithmError::ProofViolation(format!(
                        "ladder at {pos} has too few results"
                    ))
                })?;
                preview.record(v, result.is_inclusion(), &mut state)?;
                emitted.push(v);
                i += 1;
            }
            if let Some(proof) = proof {
                if !emitted.is_empty() && proof.results.len() != emitted.len() {
                    return Err(AlgorithmError::ProofViolation(format!(
                        "ladder at {pos} emitted {} lookups but the proof carries {}",
                        emitted.len(),
                        proof.results.len()
                    )));
                }
            }
        }

        if emitted.is_empty() {
            // Everything was answered by facts from other entries.
            while let Some(v) = walker.next_version(&self.ladder_state)? {
                return Err(AlgorithmError::ProofViolation(format!(
                    "ladder unexpectedly probed version {v}"
                )));
            }
            return walker.verdict().ok_or_else(|| {
                AlgorithmError::ProofViolation(format!("ladder at {pos} is ambiguous"))
            });
        }

        let proof = self.next_prefix_proof()?;
        let mut lookups = Vec::with_capacity(emitted.len());
        for (v, result) in emitted.iter().zip(&proof.results) {
            let next = walker.next_version(&self.ladder_state)?;
            if next != Some(*v) {
                return Err(AlgorithmError::ProofViolation(
                    "ladder replay diverged".into(),
                ));
            }
            walker.record(*v, result.is_inclusion(), &mut self.ladder_state)?;
            let resolved = self.resolver.resolve(*v)?;
            let commitment = if result.is_inclusion() {
                resolved.commitment
            } else {
                None
            };
            lookups.push(ProofLookup {
                vrf_output: resolved.output,
                commitment,
            });
        }
        let root = prefix_tree::evaluate_proof(&self.cs, &lookups, proof)
            .map_err(|e| AlgorithmError::ProofViolation(e.to_string()))?;
        self.provider.insert_root(pos, root)?;
        self.root_proven.insert(pos);

        // Absorb any trailing versions answered by inherited facts.
        if walker.next_version(&self.ladder_state)?.is_some() {
            return Err(AlgorithmError::ProofViolation(
                "ladder replay diverged".into(),
            ));
        }
        walker
            .verdict()
            .ok_or_else(|| AlgorithmError::ProofViolation(format!("ladder at {pos} is ambiguous")))
    }

    async fn point_inclusion(&mut self, pos: u64, version: u32) -> Result<(), AlgorithmError> {
        let proof = self.next_prefix_proof()?;
        if proof.results.len() != 1 {
            return Err(AlgorithmError::ProofViolation(
                "point inclusion proof must carry exactly one result".into(),
            ));
        }
        if !matches!(proof.results[0], PrefixSearchResult::Inclusion { .. }) {
            return Err(AlgorithmError::ProofViolation(
                "terminal entry does not include the requested version".into(),
            ));
        }
        let resolved = self.resolver.resolve(version)?;
        let commitment = resolved.commitment.ok_or_else(|| {
            AlgorithmError::ProofViolation("no commitment available for the target".into())
        })?;
        let lookups = [ProofLookup {
            vrf_output: resolved.output,
            commitment: Some(commitment),
        }];
        let root = prefix_tree::evaluate_proof(&self.cs, &lookups, proof)
            .map_err(|e| AlgorithmError::ProofViolation(e.to_string()))?;
        self.provider.insert_root(pos, root)?;
        self.root_proven.insert(pos);
        self.ladder_state.note_inclusion(version, pos);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_rejects_conflicts() {
        let mut p = DataProvider::new();
        p.insert_timestamp(5, 100).unwrap();
        assert!(p.insert_timestamp(5, 100).is_ok());
        assert!(p.insert_timestamp(5, 101).is_err());
        p.insert_root(5, [1u8; 32]).unwrap();
        assert!(p.insert_root(5, [2u8; 32]).is_err());
    }

    #[test]
    fn test_provider_rejects_order_violations() {
        let mut p = DataProvider::new();
        p.insert_timestamp(10, 100).unwrap();
        // An earlier position may not carry a later timestamp.
        assert!(p.insert_timestamp(3, 150).is_err());
        assert!(p.insert_timestamp(3, 90).is_ok());
        // A later position may not carry an earlier timestamp.
        assert!(p.insert_timestamp(20, 99).is_err());
        assert!(p.insert_timestamp(20, 100).is_ok());
    }
}
