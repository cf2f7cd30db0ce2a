//! Prefix Tree
//!
//! A versioned Merkle binary-radix tree over VRF outputs. Every log entry
//! pins one version; versions share unchanged subtrees through external
//! references into older tiles. Lookups produce compact batched
//! (non-)inclusion proofs; mutations produce a new version plus the
//! auditor's before/after evidence.

pub mod node;
pub mod proof;
pub mod search;
pub mod tile;

use thiserror::Error;

use crate::crypto::{CipherSuite, Hash, EMPTY_HASH};
use crate::storage::{PrefixStore, StorageError};
use crate::wire::{PrefixProof, PrefixSearchResult};

use node::{bit_at, Arena, Node, NodeRef};
pub use proof::{evaluate as evaluate_proof, AuditorUpdate, ProofLookup};
pub use search::LookupOutcome;

#[derive(Debug, Error)]
pub enum PrefixTreeError {
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("malformed proof: {0}")]
    MalformedProof(String),

    #[error("prefix storage is corrupt: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result of searching one version: outcomes in lookup order and the
/// batched proof against that version's root.
pub struct VersionSearch {
    pub outcomes: Vec<LookupOutcome>,
    pub proof: PrefixProof,
}

/// Result of applying one mutation.
#[derive(Debug)]
pub struct PrefixMutation {
    /// Root hash of the new version.
    pub root: Hash,
    /// Before/after evidence for the external auditor.
    pub auditor: AuditorUpdate,
}

/// Prefix tree bound to a tile store for one request.
pub struct PrefixTree<'a> {
    cs: CipherSuite,
    store: &'a dyn PrefixStore,
}

impl<'a> PrefixTree<'a> {
    pub fn new(cs: CipherSuite, store: &'a dyn PrefixStore) -> Self {
        Self { cs, store }
    }

    /// Batched lookup: each request names a version and the VRF outputs to
    /// search there. One breadth-first pass serves every request.
    pub async fn search(
        &self,
        requests: &[(u64, Vec<[u8; 32]>)],
    ) -> Result<Vec<VersionSearch>, PrefixTreeError> {
        let (forest, outcomes) = search::load_paths(&self.cs, self.store, requests).await?;
        let mut out = Vec::with_capacity(requests.len());
        for ((version, outputs), outcomes) in requests.iter().zip(outcomes) {
            let proof = build_proof(
                &self.cs,
                &forest.arena,
                forest.roots[version],
                outputs,
                &outcomes,
            )?;
            out.push(VersionSearch { outcomes, proof });
        }
        Ok(out)
    }

    /// Apply a mutation on top of `old_version` (None for the first ever
    /// version), writing the tiles of `new_version`. Both lists are
    /// processed in ascending VRF-output order; an output present in both
    /// is a replacement of its commitment.
    pub async fn mutate(
        &self,
        old_version: Option<u64>,
        new_version: u64,
        adds: &[([u8; 32], Hash)],
        removes: &[[u8; 32]],
    ) -> Result<PrefixMutation, PrefixTreeError> {
        let mut adds: Vec<([u8; 32], Hash)> = adds.to_vec();
        adds.sort_by(|a, b| a.0.cmp(&b.0));
        let mut removes: Vec<[u8; 32]> = removes.to_vec();
        removes.sort_unstable();

        if adds.windows(2).any(|w| w[0].0 == w[1].0) || removes.windows(2).any(|w| w[0] == w[1]) {
            return Err(PrefixTreeError::InvalidMutation(
                "duplicate vrf output in one batch".into(),
            ));
        }

        // An output in both lists is a replacement: its leaf is removed and
        // re-inserted under a new commitment. Lookups are deduplicated and
        // sorted, the order the auditor proof also uses.
        let mut lookups: Vec<[u8; 32]> = removes.clone();
        lookups.extend(adds.iter().map(|(o, _)| *o));
        lookups.sort_unstable();
        lookups.dedup();

        let (mut arena, root, outcomes, old_root, pre_proof) = match old_version {
            Some(v) => {
                let (forest, mut outcomes) = search::load_paths(
                    &self.cs,
                    self.store,
                    &[(v, lookups.clone())],
                )
                .await?;
                let outcomes = outcomes.remove(0);
                let root = forest.roots[&v];
                let old_root = forest.arena.hash_of(&self.cs, root);
                let pre_proof = if lookups.is_empty() {
                    PrefixProof::default()
                } else {
                    build_proof(&self.cs, &forest.arena, root, &lookups, &outcomes)?
                };
                (forest.arena, root, outcomes, old_root, pre_proof)
            }
            None => {
                let mut arena = Arena::new();
                let root = arena.alloc(Node::Empty);
                let outcomes: Vec<LookupOutcome> = lookups
                    .iter()
                    .map(|_| LookupOutcome::AbsentEmpty { depth: 0 })
                    .collect();
                let pre_proof = PrefixProof {
                    results: outcomes.iter().map(|o| o.to_wire()).collect(),
                    elements: Vec::new(),
                };
                (arena, root, outcomes, EMPTY_HASH, pre_proof)
            }
        };

        let outcome_of = |output: &[u8; 32]| -> &LookupOutcome {
            let i = lookups
                .binary_search(output)
                .expect("every change output was looked up");
            &outcomes[i]
        };
        let mut removed_with_commitments = Vec::with_capacity(removes.len());
        for output in &removes {
            match outcome_of(output) {
                LookupOutcome::Present { commitment, .. } => {
                    removed_with_commitments.push((*output, *commitment));
                }
                _ => {
                    return Err(PrefixTreeError::InvalidMutation(format!(
                        "removed output {} is not present",
                        hex::encode(output)
                    )))
                }
            }
        }
        for (output, _) in &adds {
            let replacement = removes.binary_search(output).is_ok();
            if !replacement && outcome_of(output).is_present() {
                return Err(PrefixTreeError::InvalidMutation(format!(
                    "added output {} already present",
                    hex::encode(output)
                )));
            }
        }

        for output in &removes {
            apply_remove(&mut arena, root, output)?;
        }
        for (output, commitment) in &adds {
            apply_insert(&mut arena, root, output, commitment)?;
        }

        let new_root = arena.fill_hashes(&self.cs, root);
        let tiles = tile::split(&arena, &self.cs, root, new_version, tile::MAX_TILE_WEIGHT)?;
        self.store.batch_put(&tiles).await?;

        Ok(PrefixMutation {
            root: new_root,
            auditor: AuditorUpdate {
                old_root,
                new_root,
                proof: pre_proof,
                added: adds,
                removed: removed_with_commitments,
            },
        })
    }
}

/// Build the wire proof for one version from its materialised paths.
fn build_proof(
    cs: &CipherSuite,
    arena: &Arena,
    root: NodeRef,
    outputs: &[[u8; 32]],
    outcomes: &[LookupOutcome],
) -> Result<PrefixProof, PrefixTreeError> {
    let results: Vec<PrefixSearchResult> = outcomes.iter().map(|o| o.to_wire()).collect();
    let lookups: Vec<ProofLookup> = outputs
        .iter()
        .zip(outcomes)
        .map(|(output, outcome)| ProofLookup {
            vrf_output: *output,
            commitment: outcome.commitment(),
        })
        .collect();
    let skel = proof::build_skeleton(&lookups, &results)?;
    let mut elements = Vec::new();
    collect_elements(cs, arena, &skel, root, &mut elements)?;
    Ok(PrefixProof { results, elements })
}

fn collect_elements(
    cs: &CipherSuite,
    arena: &Arena,
    skel: &proof::Skel,
    r: NodeRef,
    out: &mut Vec<Hash>,
) -> Result<(), PrefixTreeError> {
    match skel {
        proof::Skel::Copath => {
            out.push(arena.hash_of(cs, r));
            Ok(())
        }
        proof::Skel::Leaf { .. } | proof::Skel::Empty => Ok(()),
        proof::Skel::Parent { left, right } => match arena.get(r) {
            Node::Parent {
                left: rl,
                right: rr,
                ..
            } => {
                collect_elements(cs, arena, left, *rl, out)?;
                collect_elements(cs, arena, right, *rr, out)
            }
            _ => Err(PrefixTreeError::Corruption(
                "materialised tree does not match its own search results".into(),
            )),
        },
    }
}

fn apply_remove(
    arena: &mut Arena,
    root: NodeRef,
    output: &[u8; 32],
) -> Result<(), PrefixTreeError> {
    let mut stack: Vec<NodeRef> = Vec::new();
    let mut cur = root;
    let mut depth: u8 = 0;
    loop {
        match arena.get(cur).clone() {
            Node::Parent { left, right, .. } => {
                arena.invalidate_hash(cur);
                stack.push(cur);
                cur = if bit_at(output, depth) == 0 { left } else { right };
                depth = depth.checked_add(1).ok_or_else(|| {
                    PrefixTreeError::Corruption("tree deeper than 256 levels".into())
                })?;
            }
            Node::Leaf { vrf_output, .. } if vrf_output == *output => {
                arena.replace(cur, Node::Empty);
                break;
            }
            Node::Leaf { .. } | Node::Empty => {
                return Err(PrefixTreeError::InvalidMutation(
                    "removed output not present".into(),
                ))
            }
            Node::External { .. } => {
                return Err(PrefixTreeError::Corruption(
                    "mutation path not materialised".into(),
                ))
            }
        }
    }
    // Collapse parents whose children are now both empty.
    while let Some(p) = stack.pop() {
        let (l, r) = match arena.get(p) {
            Node::Parent { left, right, .. } => (*left, *right),
            _ => unreachable!("stack holds parents"),
        };
        let both_empty =
            matches!(arena.get(l), Node::Empty) && matches!(arena.get(r), Node::Empty);
        if both_empty {
            arena.replace(p, Node::Empty);
        } else {
            break;
        }
    }
    Ok(())
}

fn apply_insert(
    arena: &mut Arena,
    root: NodeRef,
    output: &[u8; 32],
    commitment: &Hash,
) -> Result<(), PrefixTreeError> {
    let mut cur = root;
    let mut depth: u8 = 0;
    loop {
        match arena.get(cur).clone() {
            Node::Parent { left, right, .. } => {
                arena.invalidate_hash(cur);
                cur = if bit_at(output, depth) == 0 { left } else { right };
                depth = depth.checked_add(1).ok_or_else(|| {
                    PrefixTreeError::Corruption("tree deeper than 256 levels".into())
                })?;
            }
            Node::Empty => {
                arena.replace(
                    cur,
                    Node::Leaf {
                        vrf_output: *output,
                        commitment: *commitment,
                    },
                );
                return Ok(());
            }
            Node::Leaf {
                vrf_output,
                commitment: existing,
            } => {
                if vrf_output == *output {
                    return Err(PrefixTreeError::InvalidMutation(
                        "inserted output already present".into(),
                    ));
                }
                let top = split_leaves(arena, (vrf_output, existing), (*output, *commitment), depth)?;
                let node = arena.get(top).clone();
                arena.replace(cur, node);
                return Ok(());
            }
            Node::External { .. } => {
                return Err(PrefixTreeError::Corruption(
                    "mutation path not materialised".into(),
                ))
            }
        }
    }
}

/// Allocate the parent chain splitting two leaves at their first differing
/// bit; returns the chain's top node.
fn split_leaves(
    arena: &mut Arena,
    old: ([u8; 32], Hash),
    new: ([u8; 32], Hash),
    depth: u8,
) -> Result<NodeRef, PrefixTreeError> {
    let mut d = depth;
    while bit_at(&old.0, d) == bit_at(&new.0, d) {
        d = d.checked_add(1).ok_or_else(|| {
            PrefixTreeError::InvalidMutation("outputs agree on all 256 bits".into())
        })?;
    }
    let old_leaf = arena.alloc(Node::Leaf {
        vrf_output: old.0,
        commitment: old.1,
    });
    let new_leaf = arena.alloc(Node::Leaf {
        vrf_output: new.0,
        commitment: new.1,
    });
    let (l, r) = if bit_at(&new.0, d) == 0 {
        (new_leaf, old_leaf)
    } else {
        (old_leaf, new_leaf)
    };
    let mut cur = arena.alloc(Node::Parent {
        left: l,
        right: r,
        hash: None,
    });
    while d > depth {
        d -= 1;
        let empty = arena.alloc(Node::Empty);
        let (l, r) = if bit_at(&new.0, d) == 0 {
            (cur, empty)
        } else {
            (empty, cur)
        };
        cur = arena.alloc(Node::Parent {
            left: l,
            right: r,
            hash: None,
        });
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::TransparencyStore;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashMap;

    fn cs() -> CipherSuite {
        CipherSuite::KtEd25519Sha256
    }

    fn random_output(rng: &mut StdRng) -> [u8; 32] {
        let mut out = [0u8; 32];
        rng.fill_bytes(&mut out);
        out
    }

    async fn commit(store: &MemoryStore) {
        store.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_search_roundtrip() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(10);
        let mut present: HashMap<[u8; 32], Hash> = HashMap::new();

        let mut version = None;
        for v in 0..20u64 {
            let tree = PrefixTree::new(cs(), store.prefix_store());
            let adds: Vec<([u8; 32], Hash)> = (0..10)
                .map(|_| {
                    let o = random_output(&mut rng);
                    let c = random_output(&mut rng);
                    (o, c)
                })
                .collect();
            let result = tree.mutate(version, v, &adds, &[]).await.unwrap();
            result.auditor.verify(&cs()).unwrap();
            for (o, c) in adds {
                present.insert(o, c);
            }
            version = Some(v);
            commit(&store).await;

            // Search a mix of present and absent outputs.
            let mut outputs: Vec<[u8; 32]> = present.keys().take(5).copied().collect();
            outputs.push(random_output(&mut rng));
            let tree = PrefixTree::new(cs(), store.prefix_store());
            let searched = tree.search(&[(v, outputs.clone())]).await.unwrap();
            let vs = &searched[0];
            for (output, outcome) in outputs.iter().zip(&vs.outcomes) {
                assert_eq!(present.contains_key(output), outcome.is_present());
                if let LookupOutcome::Present { commitment, .. } = outcome {
                    assert_eq!(commitment, &present[output]);
                }
            }
            // The proof evaluates to the advertised root.
            let lookups: Vec<ProofLookup> = outputs
                .iter()
                .zip(&vs.outcomes)
                .map(|(o, outcome)| ProofLookup {
                    vrf_output: *o,
                    commitment: outcome.commitment(),
                })
                .collect();
            let derived = evaluate_proof(&cs(), &lookups, &vs.proof).unwrap();
            assert_eq!(derived, result.root);
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let store = MemoryStore::new();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let o = [7u8; 32];
        let err = tree
            .mutate(None, 0, &[(o, [1u8; 32]), (o, [2u8; 32])], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PrefixTreeError::InvalidMutation(_)));
    }

    #[tokio::test]
    async fn test_remove_absent_rejected() {
        let store = MemoryStore::new();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        tree.mutate(None, 0, &[([1u8; 32], [0u8; 32])], &[])
            .await
            .unwrap();
        commit(&store).await;

        let tree = PrefixTree::new(cs(), store.prefix_store());
        let err = tree
            .mutate(Some(0), 1, &[], &[[9u8; 32]])
            .await
            .unwrap_err();
        assert!(matches!(err, PrefixTreeError::InvalidMutation(_)));
    }

    #[tokio::test]
    async fn test_remove_roundtrip() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(11);
        let adds: Vec<([u8; 32], Hash)> = (0..30)
            .map(|_| (random_output(&mut rng), random_output(&mut rng)))
            .collect();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        tree.mutate(None, 0, &adds, &[]).await.unwrap();
        commit(&store).await;

        let removed: Vec<[u8; 32]> = adds.iter().take(10).map(|(o, _)| *o).collect();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let result = tree.mutate(Some(0), 1, &[], &removed).await.unwrap();
        result.auditor.verify(&cs()).unwrap();
        commit(&store).await;

        let all: Vec<[u8; 32]> = adds.iter().map(|(o, _)| *o).collect();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let searched = tree.search(&[(1, all.clone())]).await.unwrap();
        for (i, outcome) in searched[0].outcomes.iter().enumerate() {
            assert_eq!(outcome.is_present(), i >= 10, "output {i}");
        }
        let lookups: Vec<ProofLookup> = all
            .iter()
            .zip(&searched[0].outcomes)
            .map(|(o, outcome)| ProofLookup {
                vrf_output: *o,
                commitment: outcome.commitment(),
            })
            .collect();
        assert_eq!(
            evaluate_proof(&cs(), &lookups, &searched[0].proof).unwrap(),
            result.root
        );
    }

    #[tokio::test]
    async fn test_search_across_versions_shares_tiles() {
        let store = MemoryStore::new();
        let mut rng = StdRng::seed_from_u64(12);
        let adds: Vec<([u8; 32], Hash)> = (0..64)
            .map(|_| (random_output(&mut rng), random_output(&mut rng)))
            .collect();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let r0 = tree.mutate(None, 0, &adds[..32], &[]).await.unwrap();
        commit(&store).await;
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let r1 = tree.mutate(Some(0), 1, &adds[32..], &[]).await.unwrap();
        commit(&store).await;

        let probe: Vec<[u8; 32]> = adds.iter().take(4).map(|(o, _)| *o).collect();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let searched = tree
            .search(&[(0, probe.clone()), (1, probe.clone())])
            .await
            .unwrap();
        for vs in &searched {
            assert!(vs.outcomes.iter().all(|o| o.is_present()));
        }
        let lookups: Vec<ProofLookup> = probe
            .iter()
            .zip(&searched[0].outcomes)
            .map(|(o, outcome)| ProofLookup {
                vrf_output: *o,
                commitment: outcome.commitment(),
            })
            .collect();
        assert_eq!(
            evaluate_proof(&cs(), &lookups, &searched[0].proof).unwrap(),
            r0.root
        );
        let lookups: Vec<ProofLookup> = probe
            .iter()
            .zip(&searched[1].outcomes)
            .map(|(o, outcome)| ProofLookup {
                vrf_output: *o,
                commitment: outcome.commitment(),
            })
            .collect();
        assert_eq!(
            evaluate_proof(&cs(), &lookups, &searched[1].proof).unwrap(),
            r1.root
        );
    }

    #[tokio::test]
    async fn test_replacement_swaps_commitment() {
        let store = MemoryStore::new();
        let output = [0x5au8; 32];
        let tree = PrefixTree::new(cs(), store.prefix_store());
        tree.mutate(None, 0, &[(output, [1u8; 32])], &[])
            .await
            .unwrap();
        commit(&store).await;

        // Remove and re-add the same output in one batch.
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let result = tree
            .mutate(Some(0), 1, &[(output, [2u8; 32])], &[output])
            .await
            .unwrap();
        result.auditor.verify(&cs()).unwrap();
        commit(&store).await;

        let tree = PrefixTree::new(cs(), store.prefix_store());
        let searched = tree.search(&[(1, vec![output])]).await.unwrap();
        assert_eq!(searched[0].outcomes[0].commitment(), Some([2u8; 32]));
    }

    #[tokio::test]
    async fn test_empty_mutation_keeps_root() {
        let store = MemoryStore::new();
        let tree = PrefixTree::new(cs(), store.prefix_store());
        let r0 = tree
            .mutate(None, 0, &[([5u8; 32], [6u8; 32])], &[])
            .await
            .unwrap();
        commit(&store).await;

        let tree = PrefixTree::new(cs(), store.prefix_store());
        let r1 = tree.mutate(Some(0), 1, &[], &[]).await.unwrap();
        assert_eq!(r0.root, r1.root);
        r1.auditor.verify(&cs()).unwrap();
    }
}
