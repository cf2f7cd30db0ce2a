//! Transparency Tree Core
//!
//! The composition of the log tree and the prefix tree: every mutation
//! appends one log entry pinning a timestamp and a new prefix root, then
//! signs a fresh tree head. Searches pin one snapshot of the store, run
//! the search algorithms through a producing proof handle, and return a
//! self-contained `SearchResponse`; `verify` re-runs the same algorithms
//! against the response bytes.

pub mod verify;

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use tracing::info;

use crate::algorithms::{
    fixed_version_search, greatest_version_search, update_view, AlgorithmError, ProofProducer,
    ResolvedVersion, VersionResolver, ViewParams,
};
use crate::common::{KtError, Result};
use crate::crypto::{
    commit, generate_opening, CipherSuite, Hash, SigningKeyPair, VrfPrivateKey,
};
use crate::log_tree::{fold_frontier, LogTree};
use crate::prefix_tree::{AuditorUpdate, PrefixTree};
use crate::storage::TransparencyStore;
use crate::treemath;
use crate::wire::{
    commitment_value, decode_index, encode_index, tree_head_tbs, vrf_input, AuditorTreeHead,
    BinaryLadderStep, DeploymentMode, FullTreeHead, LabelValue, LogEntry, PublicConfig,
    SearchRequest, SearchResponse, TreeHead, UpdateValue,
};

pub use verify::{SearchVerifier, VerifiedSearch};

/// Injected clock, milliseconds since the epoch.
pub type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Server's answer to an owner monitoring request.
pub struct MonitorResponse {
    pub tree_head: TreeHead,
    pub ladder: Vec<BinaryLadderStep>,
    pub proof: crate::wire::CombinedTreeProof,
    /// Distinguished entries the walk confirmed, ascending.
    pub checked: Vec<u64>,
}

/// Result of one applied mutation.
#[derive(Debug)]
pub struct MutateOutcome {
    pub tree_size: u64,
    pub root: Hash,
    /// Evidence for the external auditor (relevant in third-party-auditing
    /// deployments; harmless to drop otherwise).
    pub auditor: AuditorUpdate,
}

/// The server side of the transparency tree.
///
/// All mutating methods are only ever driven by the sequencer task; reads
/// take a snapshot of the committed store at entry and never observe a
/// half-applied mutation.
pub struct TransparencyLog {
    cs: CipherSuite,
    config: PublicConfig,
    signing_key: SigningKeyPair,
    vrf_key: VrfPrivateKey,
    store: Box<dyn TransparencyStore>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    clock: Clock,
    auditor_head: RwLock<Option<AuditorTreeHead>>,
}

impl TransparencyLog {
    pub fn new(
        config: PublicConfig,
        signing_key: SigningKeyPair,
        vrf_key: VrfPrivateKey,
        store: Box<dyn TransparencyStore>,
        rng: Box<dyn RngCore + Send>,
        clock: Clock,
    ) -> Result<Self> {
        let cs = CipherSuite::from_id(config.suite_id)
            .map_err(|e| KtError::BadRequest(e.to_string()))?;
        Ok(Self {
            cs,
            config,
            signing_key,
            vrf_key,
            store,
            rng: Mutex::new(rng),
            clock,
            auditor_head: RwLock::new(None),
        })
    }

    pub fn public_config(&self) -> &PublicConfig {
        &self.config
    }

    pub fn suite(&self) -> CipherSuite {
        self.cs
    }

    /// Record the newest head received from the external auditor. Its
    /// signature binds a root this server produced, so it is stored as
    /// received and attached to search responses.
    pub fn set_auditor_head(&self, head: AuditorTreeHead) {
        *self.auditor_head.write().expect("lock poisoned") = Some(head);
    }

    pub async fn tree_head(&self) -> Result<Option<TreeHead>> {
        let raw = self.store.get_tree_head().await?;
        raw.map(|bytes| TreeHead::decode(&bytes).map_err(KtError::from))
            .transpose()
    }

    fn view_params(&self, now: u64) -> ViewParams {
        ViewParams {
            now,
            max_ahead: self.config.max_ahead,
            max_behind: self.config.max_behind,
            reasonable_monitoring_window: self.config.reasonable_monitoring_window,
            maximum_lifetime: self.config.maximum_lifetime,
        }
    }

    // ------------------------------------------------------------------
    // Mutation (sequencer only)
    // ------------------------------------------------------------------

    /// Apply one batch of label additions and removals, append a log
    /// entry, and sign a new tree head. The whole mutation commits
    /// atomically or rolls back.
    pub async fn mutate(
        &self,
        adds: &[(Vec<u8>, UpdateValue)],
        removes: &[Vec<u8>],
    ) -> Result<MutateOutcome> {
        match self.mutate_inner(adds, removes).await {
            Ok(outcome) => {
                self.store.commit().await?;
                info!(
                    target: "ktlog::sequencer",
                    tree_size = outcome.tree_size,
                    adds = adds.len(),
                    removes = removes.len(),
                    "mutation committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.store.rollback().await?;
                Err(e)
            }
        }
    }

    async fn mutate_inner(
        &self,
        adds: &[(Vec<u8>, UpdateValue)],
        removes: &[Vec<u8>],
    ) -> Result<MutateOutcome> {
        let now = (self.clock)();
        let head = self.tree_head().await?;
        let n = head.as_ref().map(|h| h.tree_size).unwrap_or(0);
        let latest_ts = if n > 0 {
            Some(self.read_entry(n - 1).await?.timestamp)
        } else {
            None
        };
        let dle = if n > 0 {
            self.rightmost_distinguished(n).await?
        } else {
            None
        };

        #[derive(Default)]
        struct LabelOps {
            adds: Vec<UpdateValue>,
            remove: bool,
        }
        let mut ops: BTreeMap<Vec<u8>, LabelOps> = BTreeMap::new();
        for label in removes {
            check_label(label)?;
            ops.entry(label.clone()).or_default().remove = true;
        }
        for (label, value) in adds {
            check_label(label)?;
            ops.entry(label.clone()).or_default().adds.push(value.clone());
        }
        if ops.is_empty() {
            return Err(KtError::BadRequest("empty mutation".into()));
        }

        let labels: Vec<Vec<u8>> = ops.keys().cloned().collect();
        let indices = self.store.batch_get_index(&labels).await?;

        let mut prefix_adds: Vec<([u8; 32], Hash)> = Vec::new();
        let mut prefix_removes: Vec<[u8; 32]> = Vec::new();

        for (label, index_bytes) in labels.iter().zip(indices) {
            let op = &ops[label];
            let mut index = match index_bytes {
                Some(bytes) => decode_index(&bytes)?,
                None => Vec::new(),
            };

            if op.remove {
                if index.is_empty() {
                    return Err(KtError::BadRequest(format!(
                        "cannot remove unknown label {}",
                        hex::encode(label)
                    )));
                }
                let last = *index.last().expect("non-empty index");
                if let Some(d) = dle {
                    if last >= d {
                        return Err(KtError::BadRequest(
                            "label was modified at or after the rightmost distinguished entry"
                                .into(),
                        ));
                    }
                }
                for version in 0..index.len() as u32 {
                    let (output, _) = self.vrf_key.prove(&vrf_input(label, version));
                    prefix_removes.push(output);
                    self.store.delete_version(label, version).await?;
                }
                self.store.delete_index(label).await?;
                index.clear();
            }

            for value in &op.adds {
                let version = index.len() as u32;
                let (output, _) = self.vrf_key.prove(&vrf_input(label, version));
                let opening = {
                    let mut rng = self.rng.lock().expect("lock poisoned");
                    generate_opening(&self.cs, rng.as_mut())
                };
                let commitment = commit(&self.cs, &opening, &commitment_value(label, value));
                let record = LabelValue {
                    opening,
                    update: value.clone(),
                };
                self.store
                    .put_version(label, version, &record.encode())
                    .await?;
                index.push(n);
                prefix_adds.push((output, commitment));
            }
            if !op.adds.is_empty() {
                self.store.put_index(label, &encode_index(&index)?).await?;
            }
        }

        let prefix = PrefixTree::new(self.cs, self.store.prefix_store());
        let old_version = if n == 0 { None } else { Some(n - 1) };
        let mutation = prefix
            .mutate(old_version, n, &prefix_adds, &prefix_removes)
            .await?;

        let timestamp = now.max(latest_ts.unwrap_or(0));
        let entry = LogEntry {
            timestamp,
            prefix_root: mutation.root,
        };
        let encoded = entry.encode();
        self.store.put_entry(n, &encoded).await?;

        let log = LogTree::new(self.cs, self.store.log_store());
        let frontier = log.append(n, self.cs.hash(&encoded)).await?;
        let root = fold_frontier(&self.cs, n + 1, &frontier)?;

        let tbs = tree_head_tbs(&self.config, n + 1, &root);
        let head = TreeHead {
            tree_size: n + 1,
            signature: self.signing_key.sign(&tbs),
        };
        self.store.put_tree_head(&head.encode()).await?;

        Ok(MutateOutcome {
            tree_size: n + 1,
            root,
            auditor: mutation.auditor,
        })
    }

    async fn read_entry(&self, pos: u64) -> Result<LogEntry> {
        let raw = self.store.get_entry(pos).await?;
        LogEntry::decode(&raw).map_err(|e| KtError::Corruption(format!("log entry {pos}: {e}")))
    }

    /// Rightmost distinguished entry, read directly from storage; used for
    /// removal eligibility.
    async fn rightmost_distinguished(&self, n: u64) -> Result<Option<u64>> {
        let last_ts = self.read_entry(n - 1).await?.timestamp;
        let rmw = self.config.reasonable_monitoring_window;
        let mut cur = treemath::bst_root(0, n);
        let mut out = None;
        loop {
            let ts = self.read_entry(cur).await?.timestamp;
            if last_ts.saturating_sub(ts) < rmw {
                break;
            }
            match treemath::bst_right(cur, n) {
                Some(r) => {
                    out = Some(r);
                    cur = r;
                }
                None => break,
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Search (readers)
    // ------------------------------------------------------------------

    /// Answer a search request against a snapshot of the committed store.
    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        check_label(&req.label)?;
        let now = (self.clock)();
        let reader = self.store.clone_reader();

        let head_bytes = reader
            .get_tree_head()
            .await?
            .ok_or_else(|| KtError::BadRequest("log is empty".into()))?;
        let tree_head = TreeHead::decode(&head_bytes)?;
        let n = tree_head.tree_size;
        if let Some(last) = req.last {
            if last == 0 || last > n {
                return Err(KtError::BadRequest(format!(
                    "client claims size {last} but the log holds {n}"
                )));
            }
        }

        let index_bytes = reader
            .batch_get_index(std::slice::from_ref(&req.label))
            .await?
            .remove(0)
            .ok_or(KtError::LabelNotFound)?;
        let index = decode_index(&index_bytes)?;
        if index.is_empty() {
            return Err(KtError::LabelNotFound);
        }
        let greatest = (index.len() - 1) as u32;
        let target = req.version.unwrap_or(greatest);
        if target > greatest {
            return Err(KtError::LabelNotFound);
        }

        let params = self.view_params(now);
        let mut resolver = ProducerResolver {
            vrf: &self.vrf_key,
            label: req.label.clone(),
            cache: BTreeMap::new(),
        };
        let mut producer = ProofProducer::new(
            self.cs,
            reader.as_ref(),
            &mut resolver,
            index.clone(),
            target,
        );
        update_view(&mut producer, n, req.last, &params).await?;
        if req.version.is_some() {
            fixed_version_search(&mut producer, n, target, &params).await?;
        } else {
            greatest_version_search(&mut producer, n, target, &params).await?;
        }
        let (proof, step_infos) = producer.finalize(n, req.last).await?;

        let ladder = step_infos
            .into_iter()
            .map(|(version, commitment)| BinaryLadderStep {
                vrf_proof: resolver.proof_bytes(version),
                commitment,
            })
            .collect();

        let record_bytes = reader
            .get_version(&req.label, target)
            .await?
            .ok_or_else(|| {
                KtError::Corruption(format!("missing value for version {target}"))
            })?;
        let record = LabelValue::decode(&record_bytes, self.cs.commitment_opening_size())?;

        let full_tree_head = if req.last == Some(n) {
            FullTreeHead::Same
        } else {
            let auditor = match self.config.mode {
                DeploymentMode::ThirdPartyAuditing { .. } => {
                    self.auditor_head.read().expect("lock poisoned").clone()
                }
                _ => None,
            };
            FullTreeHead::Updated { tree_head, auditor }
        };

        Ok(SearchResponse {
            full_tree_head,
            version: req.version.is_none().then_some(target),
            opening: record.opening,
            value: record.update,
            ladder,
            proof,
        })
    }

    /// Produce a monitoring proof for a label owner: the combined proof a
    /// verifier needs to re-run the monitoring walk from its own state.
    pub async fn monitor(
        &self,
        label: &[u8],
        state: &crate::algorithms::OwnerState,
        last: Option<u64>,
    ) -> Result<MonitorResponse> {
        check_label(label)?;
        let now = (self.clock)();
        let reader = self.store.clone_reader();
        let head_bytes = reader
            .get_tree_head()
            .await?
            .ok_or_else(|| KtError::BadRequest("log is empty".into()))?;
        let tree_head = TreeHead::decode(&head_bytes)?;
        let n = tree_head.tree_size;

        let index_bytes = reader
            .batch_get_index(std::slice::from_ref(&label.to_vec()))
            .await?
            .remove(0)
            .ok_or(KtError::LabelNotFound)?;
        let index = decode_index(&index_bytes)?;

        let params = self.view_params(now);
        let mut resolver = ProducerResolver {
            vrf: &self.vrf_key,
            label: label.to_vec(),
            cache: BTreeMap::new(),
        };
        // No version's commitment is suppressed in monitoring responses.
        let mut producer =
            ProofProducer::new(self.cs, reader.as_ref(), &mut resolver, index, u32::MAX);
        update_view(&mut producer, n, last, &params).await?;
        let checked = crate::algorithms::monitor(&mut producer, n, state, &params).await?;
        let (proof, step_infos) = producer.finalize(n, last).await?;

        let ladder = step_infos
            .into_iter()
            .map(|(version, commitment)| BinaryLadderStep {
                vrf_proof: resolver.proof_bytes(version),
                commitment,
            })
            .collect();

        Ok(MonitorResponse {
            tree_head,
            ladder,
            proof,
            checked,
        })
    }

    /// Consistency proof between two sizes of the log.
    pub async fn consistency(&self, m: u64, n: u64) -> Result<Vec<Hash>> {
        let reader = self.store.clone_reader();
        let head_bytes = reader
            .get_tree_head()
            .await?
            .ok_or_else(|| KtError::BadRequest("log is empty".into()))?;
        let size = TreeHead::decode(&head_bytes)?.tree_size;
        if m == 0 || m >= n || n > size {
            return Err(KtError::BadRequest(format!(
                "invalid consistency query {m} -> {n} against size {size}"
            )));
        }
        let log = LogTree::new(self.cs, reader.log_store());
        Ok(log.get_consistency(m, n).await?)
    }
}

fn check_label(label: &[u8]) -> Result<()> {
    if label.is_empty() || label.len() > u8::MAX as usize {
        return Err(KtError::BadRequest(format!(
            "label length {} is out of range",
            label.len()
        )));
    }
    Ok(())
}

/// Producer-side resolver: evaluates the VRF and retains proofs for the
/// response's ladder steps.
struct ProducerResolver<'k> {
    vrf: &'k VrfPrivateKey,
    label: Vec<u8>,
    cache: BTreeMap<u32, ([u8; 32], Vec<u8>)>,
}

impl ProducerResolver<'_> {
    fn proof_bytes(&self, version: u32) -> Vec<u8> {
        self.cache
            .get(&version)
            .map(|(_, proof)| proof.clone())
            .expect("every probed version was resolved")
    }
}

impl VersionResolver for ProducerResolver<'_> {
    fn resolve(&mut self, version: u32) -> std::result::Result<ResolvedVersion, AlgorithmError> {
        if let Some((output, _)) = self.cache.get(&version) {
            return Ok(ResolvedVersion {
                output: *output,
                commitment: None,
            });
        }
        let (output, proof) = self.vrf.prove(&vrf_input(&self.label, version));
        self.cache
            .insert(version, (output, proof.to_bytes().to_vec()));
        Ok(ResolvedVersion {
            output,
            commitment: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::OwnerState;
    use crate::crypto::VrfPublicKey;
    use crate::wire::update_value_tbs;
    use crate::storage::memory::MemoryStore;
    use crate::wire::PrefixProof;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    const BASE_TS: u64 = 1_700_000_000_000;
    const RMW: u64 = 86_400_000;

    struct Harness {
        log: TransparencyLog,
        clock: Arc<AtomicU64>,
    }

    fn harness(rmw: u64, maximum_lifetime: Option<u64>) -> Harness {
        harness_with_mode(rmw, maximum_lifetime, DeploymentMode::ContactMonitoring)
    }

    fn harness_with_mode(
        rmw: u64,
        maximum_lifetime: Option<u64>,
        mode: DeploymentMode,
    ) -> Harness {
        let signing = SigningKeyPair::from_seed(&[1u8; 32]);
        let vrf = VrfPrivateKey::from_seed(&[2u8; 32]);
        let config = PublicConfig {
            suite_id: 1,
            mode,
            signature_public_key: signing.public_key_bytes().to_vec(),
            vrf_public_key: vrf.public_key().to_bytes().to_vec(),
            max_ahead: 60_000,
            max_behind: 3_600_000,
            reasonable_monitoring_window: rmw,
            maximum_lifetime,
        };
        let clock = Arc::new(AtomicU64::new(BASE_TS));
        let c = clock.clone();
        let log = TransparencyLog::new(
            config,
            signing,
            vrf,
            Box::new(MemoryStore::new()),
            Box::new(StdRng::seed_from_u64(99)),
            Box::new(move || c.load(AtomicOrdering::SeqCst)),
        )
        .unwrap();
        Harness { log, clock }
    }

    fn value(bytes: &[u8]) -> UpdateValue {
        UpdateValue {
            prefix: None,
            value: bytes.to_vec(),
        }
    }

    fn add(label: &[u8], bytes: &[u8]) -> (Vec<u8>, UpdateValue) {
        (label.to_vec(), value(bytes))
    }

    async fn verifier(h: &Harness) -> SearchVerifier {
        SearchVerifier::new(h.log.public_config().clone()).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_remove_in_one_mutation() {
        let h = harness(RMW, None);
        // One mutation adding two versions of the label.
        h.log
            .mutate(&[add(b"label", b"v0"), add(b"label", b"v1")], &[])
            .await
            .unwrap();

        // Remove the label and add a fresh first version in one mutation.
        let outcome = h
            .log
            .mutate(&[add(b"label", b"v2")], &[b"label".to_vec()])
            .await
            .unwrap();
        outcome.auditor.verify(&h.log.suite()).unwrap();

        // Two log entries; one index entry; only version 0 of the new
        // series, holding the new value.
        assert_eq!(h.log.tree_head().await.unwrap().unwrap().tree_size, 2);
        let index_bytes = h
            .log
            .store
            .batch_get_index(&[b"label".to_vec()])
            .await
            .unwrap()
            .remove(0)
            .unwrap();
        assert_eq!(decode_index(&index_bytes).unwrap(), vec![1]);
        let record = h.log.store.get_version(b"label", 0).await.unwrap().unwrap();
        let record = LabelValue::decode(&record, 16).unwrap();
        assert_eq!(record.update.value, b"v2");
        assert_eq!(h.log.store.get_version(b"label", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_removal_rejected_after_distinguished_entry() {
        let h = harness(0, None);
        for i in 0..3u8 {
            h.log
                .mutate(&[add(b"label", &[b'v', i])], &[])
                .await
                .unwrap();
        }
        // With a zero monitoring window the rightmost distinguished entry
        // is the last one, which is exactly where the label last changed.
        let err = h.log.mutate(&[], &[b"label".to_vec()]).await.unwrap_err();
        assert!(matches!(err, KtError::BadRequest(_)));

        // Nothing changed.
        assert_eq!(h.log.tree_head().await.unwrap().unwrap().tree_size, 3);
        let index_bytes = h
            .log
            .store
            .batch_get_index(&[b"label".to_vec()])
            .await
            .unwrap()
            .remove(0)
            .unwrap();
        assert_eq!(decode_index(&index_bytes).unwrap().len(), 3);
    }

    async fn build_timestamped_log(h: &Harness, stamps: &[(u64, u64)], n: u64) {
        // stamps: (first index, timestamp) ranges, ascending.
        for i in 0..n {
            let ts = stamps
                .iter()
                .rev()
                .find(|&&(start, _)| i >= start)
                .map(|&(_, ts)| ts)
                .unwrap();
            h.clock.store(ts, AtomicOrdering::SeqCst);
            h.log
                .mutate(&[add(format!("label-{i}").as_bytes(), b"v")], &[])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_rightmost_distinguished_positions() {
        // Timestamps two windows, one window, and zero windows old put the
        // rightmost distinguished entry at the last position.
        let h = harness(RMW, None);
        let now = BASE_TS + 2 * RMW;
        build_timestamped_log(
            &h,
            &[(0, now - 2 * RMW), (64, now - RMW), (96, now)],
            100,
        )
        .await;
        assert_eq!(h.log.rightmost_distinguished(100).await.unwrap(), Some(99));

        // Nudging the middle band one millisecond closer pulls it back.
        let h = harness(RMW, None);
        build_timestamped_log(
            &h,
            &[(0, now - 2 * RMW), (64, now - RMW + 1), (96, now)],
            100,
        )
        .await;
        assert_eq!(h.log.rightmost_distinguished(100).await.unwrap(), Some(95));
    }

    #[tokio::test]
    async fn test_fixed_search_not_found_requests_no_inclusion() {
        let h = harness(RMW, None);
        h.log.mutate(&[add(b"target", b"v0")], &[]).await.unwrap();
        for i in 0..99u32 {
            h.log
                .mutate(&[add(format!("filler-{i}").as_bytes(), b"v")], &[])
                .await
                .unwrap();
        }

        // Version 1 never existed: every ladder answers below the target
        // and the search ends with no terminal candidate.
        let reader = h.log.store.clone_reader();
        let index_bytes = reader
            .batch_get_index(&[b"target".to_vec()])
            .await
            .unwrap()
            .remove(0)
            .unwrap();
        let index = decode_index(&index_bytes).unwrap();
        let mut resolver = ProducerResolver {
            vrf: &h.log.vrf_key,
            label: b"target".to_vec(),
            cache: BTreeMap::new(),
        };
        let mut producer =
            ProofProducer::new(h.log.suite(), reader.as_ref(), &mut resolver, index, 1);
        let params = h.log.view_params(BASE_TS);
        update_view(&mut producer, 100, None, &params).await.unwrap();
        let err = fixed_version_search(&mut producer, 100, 1, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, AlgorithmError::LabelNotFound));

        // The transparency layer maps it to the structured error.
        let err = h
            .log
            .search(&SearchRequest {
                last: None,
                label: b"target".to_vec(),
                version: Some(1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KtError::LabelNotFound));
    }

    #[tokio::test]
    async fn test_single_version_search_response_shape() {
        let h = harness(RMW, None);
        h.log.mutate(&[add(b"alice", b"key-bytes")], &[]).await.unwrap();

        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: None,
        };
        let res = h.log.search(&req).await.unwrap();

        assert_eq!(res.version, Some(0));
        assert_eq!(res.opening.len(), 16);
        assert_eq!(res.ladder.len(), 1);
        assert!(res.ladder[0].commitment.is_none());

        // The single step's VRF proof is valid for (label, version 0).
        let vrf_pub = VrfPublicKey::from_bytes(&h.log.public_config().vrf_public_key).unwrap();
        let proof = crate::crypto::vrf::VrfProof::from_bytes(&res.ladder[0].vrf_proof).unwrap();
        vrf_pub.verify(&vrf_input(b"alice", 0), &proof).unwrap();

        // Inclusion-only combined proof: no raw roots, and for a single
        // entry the log inclusion needs no elements at all.
        assert!(res.proof.prefix_roots.is_empty());
        assert!(res.proof.inclusion.elements.is_empty());

        // Full wire round trip, then client verification.
        let decoded = SearchResponse::decode(
            &res.encode(),
            &DeploymentMode::ContactMonitoring,
            16,
            80,
        )
        .unwrap();
        let mut verifier = verifier(&h).await;
        let verified = verifier.verify(&req, &decoded, BASE_TS).await.unwrap();
        assert_eq!(verified.version, 0);
        assert_eq!(verified.value, b"key-bytes");
        assert_eq!(verifier.last_size(), Some(1));
    }

    #[tokio::test]
    async fn test_search_verify_roundtrip_and_retained_state() {
        let h = harness(RMW, None);
        for i in 0..10u8 {
            h.log
                .mutate(
                    &[add(b"alice", &[b'a', i]), add(b"bob", &[b'b', i])],
                    &[],
                )
                .await
                .unwrap();
        }

        let mut verifier = verifier(&h).await;

        // First contact: no retained state.
        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: None,
        };
        let res = h.log.search(&req).await.unwrap();
        let verified = verifier.verify(&req, &res, BASE_TS).await.unwrap();
        assert_eq!(verified.version, 9);
        assert_eq!(verified.value, vec![b'a', 9]);
        assert_eq!(verifier.last_size(), Some(20));

        // The log grows; the next search anchors on the retained state.
        for i in 10..14u8 {
            h.log.mutate(&[add(b"alice", &[b'a', i])], &[]).await.unwrap();
        }
        let req = SearchRequest {
            last: Some(20),
            label: b"alice".to_vec(),
            version: Some(3),
        };
        let res = h.log.search(&req).await.unwrap();
        let verified = verifier.verify(&req, &res, BASE_TS).await.unwrap();
        assert_eq!(verified.version, 3);
        assert_eq!(verified.value, vec![b'a', 3]);
        assert_eq!(verifier.last_size(), Some(24));

        // An unchanged head round trip.
        let req = SearchRequest {
            last: Some(24),
            label: b"bob".to_vec(),
            version: None,
        };
        let res = h.log.search(&req).await.unwrap();
        assert!(matches!(res.full_tree_head, FullTreeHead::Same));
        let verified = verifier.verify(&req, &res, BASE_TS).await.unwrap();
        assert_eq!(verified.version, 9);
    }

    #[tokio::test]
    async fn test_tampered_response_rejected() {
        let h = harness(RMW, None);
        for i in 0..8u8 {
            h.log.mutate(&[add(b"alice", &[i])], &[]).await.unwrap();
        }
        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: Some(2),
        };
        let res = h.log.search(&req).await.unwrap();

        // Baseline passes.
        let mut v = verifier(&h).await;
        v.verify(&req, &res, BASE_TS).await.unwrap();

        // Tampering with a timestamp breaks the rebuilt root.
        let mut bad = res.clone();
        bad.proof.timestamps[0] ^= 1;
        let mut v = verifier(&h).await;
        assert!(matches!(
            v.verify(&req, &bad, BASE_TS).await.unwrap_err(),
            KtError::ProofMismatch(_)
        ));

        // Tampering with a prefix proof element is caught as well.
        let mut bad = res.clone();
        for proof in bad.proof.prefix_proofs.iter_mut() {
            if let Some(e) = proof.elements.first_mut() {
                e[0] ^= 1;
                break;
            }
        }
        let mut v = verifier(&h).await;
        assert!(v.verify(&req, &bad, BASE_TS).await.is_err());

        // Swapping in a different value breaks the commitment binding.
        let mut bad = res.clone();
        bad.value.value = b"evil".to_vec();
        let mut v = verifier(&h).await;
        assert!(v.verify(&req, &bad, BASE_TS).await.is_err());
    }

    #[tokio::test]
    async fn test_third_party_management_signature_checked() {
        let operator = SigningKeyPair::from_seed(&[7u8; 32]);
        let h = harness_with_mode(
            RMW,
            None,
            DeploymentMode::ThirdPartyManagement {
                operator_public_key: operator.public_key_bytes().to_vec(),
            },
        );

        let mut update = value(b"managed");
        update.prefix = Some(operator.sign(&update_value_tbs(b"alice", &value(b"managed"))));
        h.log
            .mutate(&[(b"alice".to_vec(), update)], &[])
            .await
            .unwrap();

        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: None,
        };
        let res = h.log.search(&req).await.unwrap();
        let mut v = verifier(&h).await;
        v.verify(&req, &res, BASE_TS).await.unwrap();

        // Stripping the operator signature fails verification.
        let mut bad = res.clone();
        bad.value.prefix = None;
        let mut v = verifier(&h).await;
        assert!(v.verify(&req, &bad, BASE_TS).await.is_err());
    }

    #[tokio::test]
    async fn test_monitor_roundtrip() {
        // A zero monitoring window makes every entry distinguished, so the
        // walk visits everything right of the anchor.
        let h = harness(0, None);
        for i in 0..6u8 {
            h.log.mutate(&[add(b"owner", &[i])], &[]).await.unwrap();
        }
        let state = OwnerState {
            starting: 0,
            version_at_starting: 0,
            upcoming: (1..6).map(|i| (i as u64, i as u32)).collect(),
        };
        let res = h.log.monitor(b"owner", &state, None).await.unwrap();
        assert_eq!(res.checked, vec![1, 2, 3, 4, 5]);

        let mut v = verifier(&h).await;
        let checked = v
            .verify_monitor(b"owner", &state, &res, None, BASE_TS)
            .await
            .unwrap();
        assert_eq!(checked, res.checked);
        assert_eq!(v.last_size(), Some(6));

        // An owner expecting a version the server never recorded fails.
        let wrong = OwnerState {
            starting: 0,
            version_at_starting: 0,
            upcoming: vec![(1, 9)],
        };
        assert!(h.log.monitor(b"owner", &wrong, None).await.is_err());
    }

    #[tokio::test]
    async fn test_consistency_endpoint() {
        let h = harness(RMW, None);
        let mut roots = Vec::new();
        for i in 0..12u8 {
            let outcome = h.log.mutate(&[add(b"alice", &[i])], &[]).await.unwrap();
            roots.push(outcome.root);
        }
        let proof = h.log.consistency(4, 12).await.unwrap();
        crate::log_tree::verify_consistency(
            &h.log.suite(),
            4,
            12,
            &proof,
            &roots[3],
            &roots[11],
        )
        .unwrap();

        assert!(h.log.consistency(0, 5).await.is_err());
        assert!(h.log.consistency(5, 5).await.is_err());
        assert!(h.log.consistency(5, 99).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_mutation_rolls_back() {
        let h = harness(RMW, None);
        h.log.mutate(&[add(b"alice", b"v0")], &[]).await.unwrap();
        // Removing a label that does not exist fails and changes nothing.
        let err = h.log.mutate(&[], &[b"ghost".to_vec()]).await.unwrap_err();
        assert!(matches!(err, KtError::BadRequest(_)));
        assert_eq!(h.log.tree_head().await.unwrap().unwrap().tree_size, 1);
    }

    #[tokio::test]
    async fn test_stale_head_rejected_by_freshness_window() {
        let h = harness(RMW, None);
        h.log.mutate(&[add(b"alice", b"v0")], &[]).await.unwrap();
        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: None,
        };
        let res = h.log.search(&req).await.unwrap();

        // A verifier whose clock is far ahead sees a stale head.
        let mut v = verifier(&h).await;
        let err = v
            .verify(&req, &res, BASE_TS + 4 * 3_600_000)
            .await
            .unwrap_err();
        assert!(matches!(err, KtError::ProofMismatch(_)));
    }

    #[tokio::test]
    async fn test_prefix_proofs_in_bundle_are_wire_clean() {
        // Encode/decode the whole response and check deep equality, so the
        // bundle survives its wire representation byte for byte.
        let h = harness(RMW, None);
        for i in 0..5u8 {
            h.log.mutate(&[add(b"alice", &[i])], &[]).await.unwrap();
        }
        let req = SearchRequest {
            last: None,
            label: b"alice".to_vec(),
            version: Some(1),
        };
        let res = h.log.search(&req).await.unwrap();
        let decoded =
            SearchResponse::decode(&res.encode(), &DeploymentMode::ContactMonitoring, 16, 80)
                .unwrap();
        assert_eq!(decoded, res);
        assert!(!res.proof.prefix_proofs.is_empty());
        let nonempty: Vec<&PrefixProof> = res
            .proof
            .prefix_proofs
            .iter()
            .filter(|p| !p.results.is_empty())
            .collect();
        assert!(!nonempty.is_empty());
    }
}
