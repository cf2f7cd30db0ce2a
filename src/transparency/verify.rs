//! Client-Side Verification
//!
//! Re-runs the search algorithms against the bytes of a `SearchResponse`,
//! then checks the tree-head signature over the root rebuilt from the
//! inclusion proof. The verifier retains the accepted size and frontier,
//! so a later response must extend the earlier tree or fail.

use crate::algorithms::{
    fixed_version_search, greatest_version_search, update_view, AlgorithmError, ProofConsumer,
    ResolvedVersion, VersionResolver, ViewParams,
};
use crate::common::{KtError, Result};
use crate::crypto::{commit, CipherSuite, Hash, VerifierKey, VrfPublicKey};
use crate::crypto::vrf::VrfProof;
use crate::log_tree::{evaluate_batch, LogVerifier};
use crate::wire::{
    auditor_tree_head_tbs, commitment_value, tree_head_tbs, update_value_tbs, vrf_input,
    BinaryLadderStep, DeploymentMode, FullTreeHead, PublicConfig, SearchRequest, SearchResponse,
};

/// What a successful verification yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSearch {
    /// Log position at which the version was found.
    pub position: u64,
    /// The resolved version.
    pub version: u32,
    /// The committed value bytes.
    pub value: Vec<u8>,
    /// Tree size to use as `last` in the next request.
    pub tree_size: u64,
}

/// A verifying client. Holds the public configuration and the retained
/// log-verifier state; state only advances when a response checks out.
pub struct SearchVerifier {
    cs: CipherSuite,
    config: PublicConfig,
    signature_key: VerifierKey,
    vrf_key: VrfPublicKey,
    log: LogVerifier,
}

impl SearchVerifier {
    pub fn new(config: PublicConfig) -> Result<Self> {
        let cs = CipherSuite::from_id(config.suite_id)
            .map_err(|e| KtError::BadRequest(e.to_string()))?;
        let signature_key = VerifierKey::from_bytes(&config.signature_public_key)?;
        let vrf_key = VrfPublicKey::from_bytes(&config.vrf_public_key)?;
        Ok(Self {
            cs,
            config,
            signature_key,
            vrf_key,
            log: LogVerifier::new(),
        })
    }

    /// Size of the last accepted tree, for the next request's `last`.
    pub fn last_size(&self) -> Option<u64> {
        self.log.size()
    }

    /// Verify a search response against the request that produced it.
    /// `now` is the verifier's clock, injected for tests.
    pub async fn verify(
        &mut self,
        req: &SearchRequest,
        res: &SearchResponse,
        now: u64,
    ) -> Result<VerifiedSearch> {
        if req.last != self.log.size() {
            return Err(KtError::BadRequest(
                "request's last size does not match the retained state".into(),
            ));
        }
        let (tree_head, auditor) = match &res.full_tree_head {
            FullTreeHead::Same => {
                if req.last.is_none() {
                    return Err(KtError::ProofMismatch(
                        "server claims an unchanged head but none is retained".into(),
                    ));
                }
                (None, None)
            }
            FullTreeHead::Updated { tree_head, auditor } => {
                (Some(tree_head.clone()), auditor.clone())
            }
        };
        let n = match &tree_head {
            Some(h) => h.tree_size,
            None => self.log.size().expect("checked above"),
        };
        if n == 0 {
            return Err(KtError::ProofMismatch("tree head for an empty log".into()));
        }

        let target = match (req.version, res.version) {
            (Some(v), None) => v,
            (None, Some(v)) => v,
            _ => {
                return Err(KtError::ProofMismatch(
                    "response version contradicts the request".into(),
                ))
            }
        };
        if res.opening.len() != self.cs.commitment_opening_size() {
            return Err(KtError::ProofMismatch("opening has the wrong size".into()));
        }
        let target_commitment = commit(
            &self.cs,
            &res.opening,
            &commitment_value(&req.label, &res.value),
        );

        let params = ViewParams {
            now,
            max_ahead: self.config.max_ahead,
            max_behind: self.config.max_behind,
            reasonable_monitoring_window: self.config.reasonable_monitoring_window,
            maximum_lifetime: self.config.maximum_lifetime,
        };

        let mut resolver = ConsumerResolver {
            vrf: &self.vrf_key,
            label: req.label.clone(),
            steps: &res.ladder,
            next: 0,
            target,
            target_commitment,
            cache: std::collections::BTreeMap::new(),
        };
        let mut consumer = ProofConsumer::new(self.cs, &res.proof, &mut resolver);
        update_view(&mut consumer, n, req.last, &params).await?;
        let position = if req.version.is_some() {
            fixed_version_search(&mut consumer, n, target, &params).await?
        } else {
            greatest_version_search(&mut consumer, n, target, &params).await?
        };
        let entries = consumer.finalize()?;
        if resolver.next != res.ladder.len() {
            return Err(KtError::ProofMismatch(
                "response carries unused binary ladder steps".into(),
            ));
        }

        let eval = evaluate_batch(
            &self.cs,
            &entries,
            n,
            self.log.retained(),
            &res.proof.inclusion.elements,
        )?;

        match &tree_head {
            Some(head) => {
                let tbs = tree_head_tbs(&self.config, n, &eval.root);
                self.signature_key.verify(&tbs, &head.signature)?;
            }
            None => {
                let retained_root = self
                    .log
                    .retained_root(&self.cs)
                    .expect("retained state exists");
                if eval.root != retained_root {
                    return Err(KtError::ProofMismatch(
                        "unchanged head does not match the retained root".into(),
                    ));
                }
            }
        }

        self.verify_mode(&req.label, res, &auditor, n, &eval.root, now)?;
        self.log.accept(n, eval.frontier);

        Ok(VerifiedSearch {
            position,
            version: target,
            value: res.value.value.clone(),
            tree_size: n,
        })
    }

    fn verify_mode(
        &self,
        label: &[u8],
        res: &SearchResponse,
        auditor: &Option<crate::wire::AuditorTreeHead>,
        n: u64,
        root: &Hash,
        now: u64,
    ) -> Result<()> {
        match &self.config.mode {
            DeploymentMode::ContactMonitoring => Ok(()),
            DeploymentMode::ThirdPartyManagement { operator_public_key } => {
                let signature = res.value.prefix.as_ref().ok_or_else(|| {
                    KtError::ProofMismatch("value is missing the operator signature".into())
                })?;
                let key = VerifierKey::from_bytes(operator_public_key)?;
                key.verify(&update_value_tbs(label, &res.value), signature)?;
                Ok(())
            }
            DeploymentMode::ThirdPartyAuditing { auditor_public_key } => {
                let head = match (&res.full_tree_head, auditor) {
                    (FullTreeHead::Same, _) => return Ok(()),
                    (_, Some(head)) => head,
                    (_, None) => {
                        return Err(KtError::ProofMismatch(
                            "auditing deployment without an auditor head".into(),
                        ))
                    }
                };
                if head.tree_size > n {
                    return Err(KtError::ProofMismatch(
                        "auditor head is ahead of the log".into(),
                    ));
                }
                if head.timestamp + self.config.max_behind < now
                    || head.timestamp > now + self.config.max_ahead
                {
                    return Err(KtError::ProofMismatch("auditor head is not fresh".into()));
                }
                // The auditor's root is only recomputable when it signed the
                // same size this response proves against.
                if head.tree_size == n {
                    let key = VerifierKey::from_bytes(auditor_public_key)?;
                    let tbs =
                        auditor_tree_head_tbs(&self.config, head.timestamp, head.tree_size, root);
                    key.verify(&tbs, &head.signature)?;
                }
                Ok(())
            }
        }
    }
}

impl SearchVerifier {
    /// Re-run the monitoring walk against a `MonitorResponse` and advance
    /// the retained state. Returns the confirmed positions.
    pub async fn verify_monitor(
        &mut self,
        label: &[u8],
        state: &crate::algorithms::OwnerState,
        res: &crate::transparency::MonitorResponse,
        last: Option<u64>,
        now: u64,
    ) -> Result<Vec<u64>> {
        if last != self.log.size() {
            return Err(KtError::BadRequest(
                "request's last size does not match the retained state".into(),
            ));
        }
        let n = res.tree_head.tree_size;
        if n == 0 {
            return Err(KtError::ProofMismatch("tree head for an empty log".into()));
        }
        let params = ViewParams {
            now,
            max_ahead: self.config.max_ahead,
            max_behind: self.config.max_behind,
            reasonable_monitoring_window: self.config.reasonable_monitoring_window,
            maximum_lifetime: self.config.maximum_lifetime,
        };
        let mut resolver = ConsumerResolver {
            vrf: &self.vrf_key,
            label: label.to_vec(),
            steps: &res.ladder,
            next: 0,
            // Monitoring responses carry every commitment explicitly.
            target: u32::MAX,
            target_commitment: [0u8; 32],
            cache: std::collections::BTreeMap::new(),
        };
        let mut consumer = ProofConsumer::new(self.cs, &res.proof, &mut resolver);
        update_view(&mut consumer, n, last, &params).await?;
        let checked = crate::algorithms::monitor(&mut consumer, n, state, &params).await?;
        let entries = consumer.finalize()?;
        if resolver.next != res.ladder.len() {
            return Err(KtError::ProofMismatch(
                "response carries unused binary ladder steps".into(),
            ));
        }

        let eval = evaluate_batch(
            &self.cs,
            &entries,
            n,
            self.log.retained(),
            &res.proof.inclusion.elements,
        )?;
        let tbs = tree_head_tbs(&self.config, n, &eval.root);
        self.signature_key.verify(&tbs, &res.tree_head.signature)?;
        self.log.accept(n, eval.frontier);
        Ok(checked)
    }
}

/// Verifier-side resolver: maps each newly probed version to the next
/// binary ladder step, checking its VRF proof.
struct ConsumerResolver<'a> {
    vrf: &'a VrfPublicKey,
    label: Vec<u8>,
    steps: &'a [BinaryLadderStep],
    next: usize,
    target: u32,
    target_commitment: Hash,
    cache: std::collections::BTreeMap<u32, ResolvedVersion>,
}

impl VersionResolver for ConsumerResolver<'_> {
    fn resolve(&mut self, version: u32) -> std::result::Result<ResolvedVersion, AlgorithmError> {
        if let Some(resolved) = self.cache.get(&version) {
            return Ok(resolved.clone());
        }
        let step = self.steps.get(self.next).ok_or_else(|| {
            AlgorithmError::ProofViolation("response has too few binary ladder steps".into())
        })?;
        self.next += 1;
        let proof = VrfProof::from_bytes(&step.vrf_proof)
            .map_err(|e| AlgorithmError::ProofViolation(e.to_string()))?;
        let output = self
            .vrf
            .verify(&vrf_input(&self.label, version), &proof)
            .map_err(|e| AlgorithmError::ProofViolation(e.to_string()))?;
        let commitment = if version == self.target {
            Some(self.target_commitment)
        } else {
            step.commitment
        };
        let resolved = ResolvedVersion { output, commitment };
        self.cache.insert(version, resolved.clone());
        Ok(resolved)
    }
}
