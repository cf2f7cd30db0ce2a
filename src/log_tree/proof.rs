//! Log Tree Proof Verification
//!
//! The pure half of the log tree: everything a verifier can run without
//! touching storage. Hashing marshals a leaf operand as `0x00 || value` and
//! an interior operand as `0x01 || hash`, so the two can never collide. The
//! hash of a ragged subtree is the right-fold of its full-subtree hashes,
//! which is also how the tree root is derived from the frontier.

use std::collections::HashMap;

use crate::crypto::{CipherSuite, Hash};
use crate::treemath;

use super::LogTreeError;

/// A hash operand tagged with whether it is a leaf of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHash {
    pub hash: Hash,
    pub leaf: bool,
}

impl NodeHash {
    pub fn leaf(hash: Hash) -> Self {
        Self { hash, leaf: true }
    }

    pub fn parent(hash: Hash) -> Self {
        Self { hash, leaf: false }
    }

    pub fn at(index: u64, hash: Hash) -> Self {
        Self {
            hash,
            leaf: treemath::is_leaf(index),
        }
    }
}

/// Hash two child operands into their parent's hash.
pub fn combine(cs: &CipherSuite, left: &NodeHash, right: &NodeHash) -> Hash {
    let lt = [if left.leaf { 0x00 } else { 0x01 }];
    let rt = [if right.leaf { 0x00 } else { 0x01 }];
    cs.hash_parts(&[&lt, &left.hash, &rt, &right.hash])
}

/// Right-fold a list of sibling subtree hashes into a single operand.
pub fn fold_nodes(cs: &CipherSuite, nodes: &[NodeHash]) -> NodeHash {
    assert!(!nodes.is_empty(), "folding an empty node list");
    let mut acc = nodes[nodes.len() - 1];
    for node in nodes[..nodes.len() - 1].iter().rev() {
        acc = NodeHash::parent(combine(cs, node, &acc));
    }
    acc
}

/// Derive the root hash of a size-`n` tree from its frontier hashes.
pub fn fold_frontier(cs: &CipherSuite, n: u64, hashes: &[Hash]) -> Result<Hash, LogTreeError> {
    let frontier = treemath::frontier(n);
    if frontier.len() != hashes.len() {
        return Err(LogTreeError::MalformedProof(format!(
            "expected {} frontier hashes, got {}",
            frontier.len(),
            hashes.len()
        )));
    }
    let nodes: Vec<NodeHash> = frontier
        .iter()
        .zip(hashes)
        .map(|(&idx, &hash)| NodeHash::at(idx, hash))
        .collect();
    Ok(fold_nodes(cs, &nodes).hash)
}

/// Check a single-leaf inclusion proof: `proof` is the copath of leaf `x`,
/// nearest sibling first.
pub fn verify_inclusion(
    cs: &CipherSuite,
    x: u64,
    n: u64,
    value: &Hash,
    proof: &[Hash],
    root: &Hash,
) -> Result<(), LogTreeError> {
    if x >= n {
        return Err(LogTreeError::MalformedProof(format!(
            "leaf {x} outside tree of size {n}"
        )));
    }
    let copath = treemath::copath(2 * x, n);
    if copath.len() != proof.len() {
        return Err(LogTreeError::MalformedProof(format!(
            "expected {} copath elements, got {}",
            copath.len(),
            proof.len()
        )));
    }
    let mut cur = NodeHash::leaf(*value);
    let mut idx = 2 * x;
    for (&sibling, &hash) in copath.iter().zip(proof) {
        let other = NodeHash::at(sibling, hash);
        cur = if sibling < idx {
            NodeHash::parent(combine(cs, &other, &cur))
        } else {
            NodeHash::parent(combine(cs, &cur, &other))
        };
        idx = treemath::parent(idx, n);
    }
    if cur.hash != *root {
        return Err(LogTreeError::MalformedProof(
            "inclusion proof does not match root".into(),
        ));
    }
    Ok(())
}

/// Result of evaluating a batched inclusion proof.
pub struct BatchEvaluation {
    pub root: Hash,
    /// Hashes of the size-`n` frontier, for retention by a verifier.
    pub frontier: Vec<Hash>,
}

/// Rebuild the size-`n` root from entry leaf values, retained full-subtree
/// hashes of an earlier tree, and the proof elements of a batch copath.
pub fn evaluate_batch(
    cs: &CipherSuite,
    entries: &[(u64, Hash)],
    n: u64,
    retained: Option<(u64, &[Hash])>,
    proof: &[Hash],
) -> Result<BatchEvaluation, LogTreeError> {
    if entries.is_empty() {
        return Err(LogTreeError::MalformedProof("no entries to evaluate".into()));
    }
    if entries.iter().any(|&(e, _)| e >= n) {
        return Err(LogTreeError::MalformedProof(
            "entry outside tree bounds".into(),
        ));
    }
    let positions: Vec<u64> = entries.iter().map(|&(e, _)| e).collect();
    let last_known = retained.map(|(m, _)| m);
    let walk = treemath::BatchWalk::new(&positions, n, last_known);

    let element_nodes = treemath::batch_copath(&positions, n, last_known);
    if element_nodes.len() != proof.len() {
        return Err(LogTreeError::MalformedProof(format!(
            "expected {} proof elements, got {}",
            element_nodes.len(),
            proof.len()
        )));
    }
    let elements: HashMap<u64, Hash> = element_nodes.into_iter().zip(proof.iter().copied()).collect();

    let mut entry_values: HashMap<u64, Hash> = HashMap::new();
    for &(e, v) in entries {
        if let Some(prev) = entry_values.insert(2 * e, v) {
            if prev != v {
                return Err(LogTreeError::MalformedProof(format!(
                    "conflicting values for entry {e}"
                )));
            }
        }
    }

    let mut anchors: HashMap<u64, Hash> = HashMap::new();
    if let Some((m, hashes)) = retained {
        let frontier = treemath::frontier(m);
        if frontier.len() != hashes.len() {
            return Err(LogTreeError::MalformedProof(
                "retained frontier has wrong length".into(),
            ));
        }
        anchors.extend(frontier.into_iter().zip(hashes.iter().copied()));
    }

    let mut ctx = EvalContext {
        cs,
        n,
        walk: &walk,
        elements: &elements,
        entry_values: &entry_values,
        anchors: &anchors,
        memo: HashMap::new(),
    };
    let root = ctx.compute(treemath::root(n))?.hash;
    let frontier = treemath::frontier(n)
        .into_iter()
        .map(|f| ctx.compute(f).map(|nh| nh.hash))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BatchEvaluation { root, frontier })
}

struct EvalContext<'a> {
    cs: &'a CipherSuite,
    n: u64,
    walk: &'a treemath::BatchWalk,
    elements: &'a HashMap<u64, Hash>,
    entry_values: &'a HashMap<u64, Hash>,
    anchors: &'a HashMap<u64, Hash>,
    memo: HashMap<u64, NodeHash>,
}

impl EvalContext<'_> {
    fn compute(&mut self, x: u64) -> Result<NodeHash, LogTreeError> {
        if let Some(v) = self.memo.get(&x) {
            return Ok(*v);
        }
        let out = self.compute_inner(x)?;
        self.memo.insert(x, out);
        Ok(out)
    }

    fn compute_inner(&mut self, x: u64) -> Result<NodeHash, LogTreeError> {
        if let Some(v) = self.entry_values.get(&x) {
            return Ok(NodeHash::leaf(*v));
        }
        if self.walk.stops_at_anchor(x) {
            return Ok(NodeHash::at(x, self.anchors[&x]));
        }
        if let Some(h) = self.elements.get(&x) {
            return Ok(NodeHash::at(x, *h));
        }
        if treemath::is_leaf(x) {
            return Err(LogTreeError::MalformedProof(format!(
                "no value available for leaf node {x}"
            )));
        }
        let l = self.compute(treemath::left(x))?;
        let r = self.compute(treemath::right(x, self.n))?;
        let hash = combine(self.cs, &l, &r);
        if let Some(retained) = self.anchors.get(&x) {
            if *retained != hash {
                return Err(LogTreeError::MalformedProof(format!(
                    "derived hash for retained subtree {x} does not match"
                )));
            }
        }
        Ok(NodeHash::parent(hash))
    }
}

// --- consistency proofs -----------------------------------------------------

fn largest_pow2_lt(x: u64) -> u64 {
    debug_assert!(x >= 2);
    1u64 << treemath::log2(x - 1)
}

/// Entry ranges whose hashes form the consistency proof from size `m` to
/// size `n`, in emission order (RFC 6962 subproof shape).
pub fn consistency_ranges(m: u64, n: u64) -> Vec<(u64, u64)> {
    assert!(m >= 1 && m < n, "invalid consistency query");
    let mut out = Vec::new();
    consistency_sub(m, 0, n, true, &mut out);
    out
}

fn consistency_sub(m_rel: u64, a: u64, b: u64, flag: bool, out: &mut Vec<(u64, u64)>) {
    if m_rel == b - a {
        if !flag {
            out.push((a, b));
        }
        return;
    }
    let k = largest_pow2_lt(b - a);
    if m_rel <= k {
        consistency_sub(m_rel, a, a + k, flag, out);
        out.push((a + k, b));
    } else {
        consistency_sub(m_rel - k, a + k, b, false, out);
        out.push((a, a + k));
    }
}

/// Check a consistency proof between two advertised roots.
pub fn verify_consistency(
    cs: &CipherSuite,
    m: u64,
    n: u64,
    proof: &[Hash],
    root_m: &Hash,
    root_n: &Hash,
) -> Result<(), LogTreeError> {
    if m == 0 || m > n {
        return Err(LogTreeError::MalformedProof(format!(
            "invalid consistency sizes {m} -> {n}"
        )));
    }
    if m == n {
        if !proof.is_empty() {
            return Err(LogTreeError::MalformedProof(
                "non-empty proof for equal sizes".into(),
            ));
        }
        if root_m != root_n {
            return Err(LogTreeError::MalformedProof(
                "equal sizes with different roots".into(),
            ));
        }
        return Ok(());
    }
    let mut iter = proof.iter();
    let (old, new) = consistency_eval(cs, m, 0, n, true, root_m, &mut iter)?;
    if iter.next().is_some() {
        return Err(LogTreeError::MalformedProof(
            "trailing consistency elements".into(),
        ));
    }
    if old.hash != *root_m {
        return Err(LogTreeError::MalformedProof(
            "consistency proof does not rebuild the old root".into(),
        ));
    }
    if new.hash != *root_n {
        return Err(LogTreeError::MalformedProof(
            "consistency proof does not rebuild the new root".into(),
        ));
    }
    Ok(())
}

fn consistency_eval<'a>(
    cs: &CipherSuite,
    m_rel: u64,
    a: u64,
    b: u64,
    flag: bool,
    root_m: &Hash,
    iter: &mut impl Iterator<Item = &'a Hash>,
) -> Result<(NodeHash, NodeHash), LogTreeError> {
    if m_rel == b - a {
        let node = if flag {
            NodeHash {
                hash: *root_m,
                leaf: m_rel == 1,
            }
        } else {
            let h = iter
                .next()
                .ok_or_else(|| LogTreeError::MalformedProof("consistency proof too short".into()))?;
            NodeHash {
                hash: *h,
                leaf: b - a == 1,
            }
        };
        return Ok((node, node));
    }
    let k = largest_pow2_lt(b - a);
    if m_rel <= k {
        let (old_l, new_l) = consistency_eval(cs, m_rel, a, a + k, flag, root_m, iter)?;
        let h = iter
            .next()
            .ok_or_else(|| LogTreeError::MalformedProof("consistency proof too short".into()))?;
        let new_r = NodeHash {
            hash: *h,
            leaf: b - (a + k) == 1,
        };
        let new = NodeHash::parent(combine(cs, &new_l, &new_r));
        Ok((old_l, new))
    } else {
        let (old_r, new_r) = consistency_eval(cs, m_rel - k, a + k, b, false, root_m, iter)?;
        let h = iter
            .next()
            .ok_or_else(|| LogTreeError::MalformedProof("consistency proof too short".into()))?;
        let left = NodeHash {
            hash: *h,
            leaf: k == 1,
        };
        let old = NodeHash::parent(combine(cs, &left, &old_r));
        let new = NodeHash::parent(combine(cs, &left, &new_r));
        Ok((old, new))
    }
}

// --- retained verifier state ------------------------------------------------

/// A verifier's retained view of the log: the last size it accepted and the
/// frontier hashes of that tree. Batched proofs both reuse and advance it.
#[derive(Debug, Clone, Default)]
pub struct LogVerifier {
    state: Option<(u64, Vec<Hash>)>,
}

impl LogVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> Option<u64> {
        self.state.as_ref().map(|(n, _)| *n)
    }

    /// Retained size and frontier, for passing to `evaluate_batch`.
    pub fn retained(&self) -> Option<(u64, &[Hash])> {
        self.state.as_ref().map(|(n, h)| (*n, h.as_slice()))
    }

    /// Install an already-verified evaluation as the new state.
    pub fn accept(&mut self, n: u64, frontier: Vec<Hash>) {
        self.state = Some((n, frontier));
    }

    /// The root the retained frontier folds to, if any state is held.
    pub fn retained_root(&self, cs: &CipherSuite) -> Option<Hash> {
        let (n, hashes) = self.state.as_ref()?;
        fold_frontier(cs, *n, hashes).ok()
    }

    /// Evaluate a batch proof against the retained state and `expected_root`
    /// (taken from a signed tree head). State is replaced only after both
    /// the evaluation and the root comparison succeed.
    pub fn advance(
        &mut self,
        cs: &CipherSuite,
        entries: &[(u64, Hash)],
        n: u64,
        proof: &[Hash],
        expected_root: &Hash,
    ) -> Result<(), LogTreeError> {
        if let Some((m, _)) = &self.state {
            if n < *m {
                return Err(LogTreeError::MalformedProof(format!(
                    "tree shrank from {m} to {n}"
                )));
            }
        }
        let retained = self
            .state
            .as_ref()
            .map(|(m, hashes)| (*m, hashes.as_slice()));
        let eval = evaluate_batch(cs, entries, n, retained, proof)?;
        if eval.root != *expected_root {
            return Err(LogTreeError::MalformedProof(
                "batch proof does not match signed root".into(),
            ));
        }
        self.state = Some((n, eval.frontier));
        Ok(())
    }
}
