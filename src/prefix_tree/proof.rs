//! Prefix Proof Evaluation
//!
//! A batched prefix proof carries one search result per looked-up VRF
//! output and the copath hashes needed to rebuild the root. Verification
//! rebuilds a skeleton tree from the sorted outputs and claimed terminal
//! depths, fills every unexplored branch from the element list in in-order
//! position, and hashes upward. The producer walks the same skeleton
//! against the real tree to emit the elements, so both sides agree on the
//! order by construction.

use crate::crypto::{CipherSuite, Hash, EMPTY_HASH};
use crate::wire::{PrefixProof, PrefixSearchResult};

use super::node::{bit_at, leaf_hash, parent_hash};
use super::PrefixTreeError;

/// One lookup the verifier performed: the output searched and, for
/// inclusion results, the commitment expected at the leaf (recomputed or
/// taken from the matching binary ladder step).
#[derive(Debug, Clone)]
pub struct ProofLookup {
    pub vrf_output: [u8; 32],
    pub commitment: Option<Hash>,
}

/// Skeleton node. `Copath` slots are filled from the element list.
#[derive(Debug)]
pub enum Skel {
    Leaf {
        vrf_output: [u8; 32],
        commitment: Hash,
    },
    Empty,
    Copath,
    Parent {
        left: Box<Skel>,
        right: Box<Skel>,
    },
}

struct SkelEntry {
    vrf_output: [u8; 32],
    commitment: Option<Hash>,
    result: PrefixSearchResult,
}

/// Build the verifier's skeleton from lookups and their claimed results.
pub fn build_skeleton(
    lookups: &[ProofLookup],
    results: &[PrefixSearchResult],
) -> Result<Skel, PrefixTreeError> {
    if lookups.len() != results.len() {
        return Err(PrefixTreeError::MalformedProof(format!(
            "{} lookups but {} results",
            lookups.len(),
            results.len()
        )));
    }
    if lookups.is_empty() {
        return Err(PrefixTreeError::MalformedProof("empty proof".into()));
    }
    let mut entries: Vec<SkelEntry> = lookups
        .iter()
        .zip(results)
        .map(|(l, r)| SkelEntry {
            vrf_output: l.vrf_output,
            commitment: l.commitment,
            result: r.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.vrf_output.cmp(&b.vrf_output));
    for pair in entries.windows(2) {
        if pair[0].vrf_output == pair[1].vrf_output {
            return Err(PrefixTreeError::MalformedProof(
                "duplicate vrf output in proof".into(),
            ));
        }
    }
    build_group(&entries, 0)
}

fn build_group(entries: &[SkelEntry], depth: u8) -> Result<Skel, PrefixTreeError> {
    debug_assert!(!entries.is_empty());
    let terminal_here = entries.iter().any(|e| e.result.depth() == depth);
    if terminal_here {
        if !entries.iter().all(|e| e.result.depth() == depth) {
            return Err(PrefixTreeError::MalformedProof(
                "lookups disagree on a terminal depth".into(),
            ));
        }
        return build_terminal(entries, depth);
    }
    if entries.iter().any(|e| e.result.depth() < depth) {
        return Err(PrefixTreeError::MalformedProof(
            "terminal depth above its divergence point".into(),
        ));
    }
    let next = depth
        .checked_add(1)
        .ok_or_else(|| PrefixTreeError::MalformedProof("skeleton deeper than 256 levels".into()))?;
    let split = entries.partition_point(|e| bit_at(&e.vrf_output, depth) == 0);
    let left = if split == 0 {
        Skel::Copath
    } else {
        build_group(&entries[..split], next)?
    };
    let right = if split == entries.len() {
        Skel::Copath
    } else {
        build_group(&entries[split..], next)?
    };
    Ok(Skel::Parent {
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn build_terminal(entries: &[SkelEntry], _depth: u8) -> Result<Skel, PrefixTreeError> {
    let mut leaf: Option<([u8; 32], Hash)> = None;
    let mut saw_empty = false;
    for e in entries {
        let candidate = match &e.result {
            PrefixSearchResult::Inclusion { .. } => {
                let commitment = e.commitment.ok_or_else(|| {
                    PrefixTreeError::MalformedProof(
                        "inclusion result without a commitment".into(),
                    )
                })?;
                Some((e.vrf_output, commitment))
            }
            PrefixSearchResult::NonInclusionLeaf {
                vrf_output,
                commitment,
                ..
            } => {
                if *vrf_output == e.vrf_output {
                    return Err(PrefixTreeError::MalformedProof(
                        "non-inclusion leaf equals the searched output".into(),
                    ));
                }
                Some((*vrf_output, *commitment))
            }
            PrefixSearchResult::NonInclusionParent { .. } => {
                saw_empty = true;
                None
            }
        };
        if let Some(c) = candidate {
            match &leaf {
                None => leaf = Some(c),
                Some(prev) if *prev == c => {}
                Some(_) => {
                    return Err(PrefixTreeError::MalformedProof(
                        "lookups disagree on the terminal leaf".into(),
                    ))
                }
            }
        }
    }
    match (leaf, saw_empty) {
        (Some(_), true) => Err(PrefixTreeError::MalformedProof(
            "terminal is both a leaf and empty".into(),
        )),
        (Some((vrf_output, commitment)), false) => Ok(Skel::Leaf {
            vrf_output,
            commitment,
        }),
        (None, true) => Ok(Skel::Empty),
        (None, false) => unreachable!("terminal group with no entries"),
    }
}

/// Evaluate a batched proof: rebuild the skeleton, fill the copath, and
/// return the root hash it commits to.
pub fn evaluate(
    cs: &CipherSuite,
    lookups: &[ProofLookup],
    proof: &PrefixProof,
) -> Result<Hash, PrefixTreeError> {
    let skel = build_skeleton(lookups, &proof.results)?;
    let mut iter = proof.elements.iter();
    let root = eval_node(cs, &skel, &mut iter)?;
    if iter.next().is_some() {
        return Err(PrefixTreeError::MalformedProof(
            "unused copath elements".into(),
        ));
    }
    Ok(root)
}

fn eval_node<'a>(
    cs: &CipherSuite,
    skel: &Skel,
    elements: &mut impl Iterator<Item = &'a Hash>,
) -> Result<Hash, PrefixTreeError> {
    match skel {
        Skel::Empty => Ok(EMPTY_HASH),
        Skel::Leaf {
            vrf_output,
            commitment,
        } => Ok(leaf_hash(cs, vrf_output, commitment)),
        Skel::Copath => elements.next().copied().ok_or_else(|| {
            PrefixTreeError::MalformedProof("proof has too few copath elements".into())
        }),
        Skel::Parent { left, right } => {
            let l = eval_node(cs, left, elements)?;
            let r = eval_node(cs, right, elements)?;
            Ok(parent_hash(cs, &l, &r))
        }
    }
}

// --- auditor update ---------------------------------------------------------

/// What an external auditor needs to replay one mutation: a proof of the
/// touched outputs against the old root, and the applied change lists.
#[derive(Debug, Clone)]
pub struct AuditorUpdate {
    /// Root before the mutation; the fixed empty hash for the first version.
    pub old_root: Hash,
    /// Root after the mutation.
    pub new_root: Hash,
    /// Proof over the deduplicated, sorted union of removed and added
    /// outputs, against `old_root`. An output in both lists is a
    /// replacement and appears once, as an inclusion.
    pub proof: PrefixProof,
    pub added: Vec<([u8; 32], Hash)>,
    pub removed: Vec<([u8; 32], Hash)>,
}

impl AuditorUpdate {
    /// Replay the mutation: check the proof against the old root, apply the
    /// change lists to the exposed skeleton, and confirm the new root.
    pub fn verify(&self, cs: &CipherSuite) -> Result<(), PrefixTreeError> {
        if self.added.is_empty() && self.removed.is_empty() {
            if !self.proof.results.is_empty() || self.old_root != self.new_root {
                return Err(PrefixTreeError::MalformedProof(
                    "empty update must not change the root".into(),
                ));
            }
            return Ok(());
        }
        let mut outputs: Vec<[u8; 32]> = self.removed.iter().map(|(o, _)| *o).collect();
        outputs.extend(self.added.iter().map(|(o, _)| *o));
        outputs.sort_unstable();
        outputs.dedup();

        let removed_commitment = |output: &[u8; 32]| {
            self.removed
                .iter()
                .find(|(o, _)| o == output)
                .map(|(_, c)| *c)
        };
        let lookups: Vec<ProofLookup> = outputs
            .iter()
            .map(|output| ProofLookup {
                vrf_output: *output,
                commitment: removed_commitment(output),
            })
            .collect();
        if lookups.len() != self.proof.results.len() {
            return Err(PrefixTreeError::MalformedProof(
                "auditor proof does not cover the change lists".into(),
            ));
        }
        for (output, result) in outputs.iter().zip(&self.proof.results) {
            let expect_inclusion = removed_commitment(output).is_some();
            if expect_inclusion != result.is_inclusion() {
                return Err(PrefixTreeError::MalformedProof(
                    "auditor proof result contradicts the change lists".into(),
                ));
            }
        }
        let derived = evaluate(cs, &lookups, &self.proof)?;
        if derived != self.old_root {
            return Err(PrefixTreeError::MalformedProof(
                "auditor proof does not match the old root".into(),
            ));
        }

        let skel = build_skeleton(&lookups, &self.proof.results)?;
        let mut iter = self.proof.elements.iter();
        let mut built = fill(&skel, &mut iter)?;
        for (output, _) in &self.removed {
            built = remove(built, output, 0)?;
        }
        for (output, commitment) in &self.added {
            built = insert(built, output, commitment, 0)?;
        }
        if built_hash(cs, &built) != self.new_root {
            return Err(PrefixTreeError::MalformedProof(
                "replayed mutation does not match the new root".into(),
            ));
        }
        Ok(())
    }
}

/// A filled skeleton the auditor can mutate.
enum Built {
    Leaf {
        vrf_output: [u8; 32],
        commitment: Hash,
    },
    Empty,
    External(Hash),
    Parent {
        left: Box<Built>,
        right: Box<Built>,
    },
}

fn fill<'a>(
    skel: &Skel,
    elements: &mut impl Iterator<Item = &'a Hash>,
) -> Result<Built, PrefixTreeError> {
    Ok(match skel {
        Skel::Empty => Built::Empty,
        Skel::Leaf {
            vrf_output,
            commitment,
        } => Built::Leaf {
            vrf_output: *vrf_output,
            commitment: *commitment,
        },
        Skel::Copath => Built::External(*elements.next().ok_or_else(|| {
            PrefixTreeError::MalformedProof("proof has too few copath elements".into())
        })?),
        Skel::Parent { left, right } => Built::Parent {
            left: Box::new(fill(left, elements)?),
            right: Box::new(fill(right, elements)?),
        },
    })
}

fn built_hash(cs: &CipherSuite, node: &Built) -> Hash {
    match node {
        Built::Empty => EMPTY_HASH,
        Built::External(h) => *h,
        Built::Leaf {
            vrf_output,
            commitment,
        } => leaf_hash(cs, vrf_output, commitment),
        Built::Parent { left, right } => {
            parent_hash(cs, &built_hash(cs, left), &built_hash(cs, right))
        }
    }
}

fn is_empty_subtree(node: &Built) -> bool {
    matches!(node, Built::Empty) || matches!(node, Built::External(h) if *h == EMPTY_HASH)
}

fn insert(
    node: Built,
    output: &[u8; 32],
    commitment: &Hash,
    depth: u8,
) -> Result<Built, PrefixTreeError> {
    match node {
        Built::Empty => Ok(Built::Leaf {
            vrf_output: *output,
            commitment: *commitment,
        }),
        Built::Leaf {
            vrf_output,
            commitment: existing,
        } => {
            if vrf_output == *output {
                return Err(PrefixTreeError::InvalidMutation(
                    "inserted output already present".into(),
                ));
            }
            Ok(split_leaves(
                (vrf_output, existing),
                (*output, *commitment),
                depth,
            )?)
        }
        Built::Parent { left, right } => {
            let next = depth.checked_add(1).ok_or_else(|| {
                PrefixTreeError::MalformedProof("update deeper than 256 levels".into())
            })?;
            if bit_at(output, depth) == 0 {
                Ok(Built::Parent {
                    left: Box::new(insert(*left, output, commitment, next)?),
                    right,
                })
            } else {
                Ok(Built::Parent {
                    left,
                    right: Box::new(insert(*right, output, commitment, next)?),
                })
            }
        }
        Built::External(_) => Err(PrefixTreeError::MalformedProof(
            "update descends into an unexposed subtree".into(),
        )),
    }
}

/// Extend two diverging leaves down to their first differing bit.
fn split_leaves(
    old: ([u8; 32], Hash),
    new: ([u8; 32], Hash),
    depth: u8,
) -> Result<Built, PrefixTreeError> {
    let mut d = depth;
    while bit_at(&old.0, d) == bit_at(&new.0, d) {
        d = d.checked_add(1).ok_or_else(|| {
            PrefixTreeError::MalformedProof("outputs agree on all 256 bits".into())
        })?;
    }
    let old_leaf = Built::Leaf {
        vrf_output: old.0,
        commitment: old.1,
    };
    let new_leaf = Built::Leaf {
        vrf_output: new.0,
        commitment: new.1,
    };
    let (l, r) = if bit_at(&new.0, d) == 0 {
        (new_leaf, old_leaf)
    } else {
        (old_leaf, new_leaf)
    };
    let mut cur = Built::Parent {
        left: Box::new(l),
        right: Box::new(r),
    };
    while d > depth {
        d -= 1;
        cur = if bit_at(&new.0, d) == 0 {
            Built::Parent {
                left: Box::new(cur),
                right: Box::new(Built::Empty),
            }
        } else {
            Built::Parent {
                left: Box::new(Built::Empty),
                right: Box::new(cur),
            }
        };
    }
    Ok(cur)
}

fn remove(node: Built, output: &[u8; 32], depth: u8) -> Result<Built, PrefixTreeError> {
    match node {
        Built::Leaf { vrf_output, .. } if vrf_output == *output => Ok(Built::Empty),
        Built::Leaf { .. } | Built::Empty => Err(PrefixTreeError::InvalidMutation(
            "removed output not present".into(),
        )),
        Built::Parent { left, right } => {
            let next = depth.checked_add(1).ok_or_else(|| {
                PrefixTreeError::MalformedProof("update deeper than 256 levels".into())
            })?;
            let (left, right) = if bit_at(output, depth) == 0 {
                (Box::new(remove(*left, output, next)?), right)
            } else {
                (left, Box::new(remove(*right, output, next)?))
            };
            if is_empty_subtree(&left) && is_empty_subtree(&right) {
                Ok(Built::Empty)
            } else {
                Ok(Built::Parent { left, right })
            }
        }
        Built::External(_) => Err(PrefixTreeError::MalformedProof(
            "update descends into an unexposed subtree".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs() -> CipherSuite {
        CipherSuite::KtEd25519Sha256
    }

    fn out(first: u8) -> [u8; 32] {
        let mut o = [0u8; 32];
        o[0] = first;
        o
    }

    #[test]
    fn test_single_empty_tree_lookup() {
        let lookups = [ProofLookup {
            vrf_output: out(0x40),
            commitment: None,
        }];
        let proof = PrefixProof {
            results: vec![PrefixSearchResult::NonInclusionParent { depth: 0 }],
            elements: vec![],
        };
        assert_eq!(evaluate(&cs(), &lookups, &proof).unwrap(), EMPTY_HASH);
    }

    #[test]
    fn test_inclusion_requires_commitment() {
        let lookups = [ProofLookup {
            vrf_output: out(0x40),
            commitment: None,
        }];
        let proof = PrefixProof {
            results: vec![PrefixSearchResult::Inclusion { depth: 0 }],
            elements: vec![],
        };
        assert!(evaluate(&cs(), &lookups, &proof).is_err());
    }

    #[test]
    fn test_two_lookups_share_one_terminal_leaf() {
        // A single-leaf tree answers every lookup at depth 0 with the same
        // leaf; the skeleton must merge the two terminals.
        let leaf_out = out(0x80);
        let commitment = [7u8; 32];
        let lookups = [
            ProofLookup {
                vrf_output: out(0x01),
                commitment: None,
            },
            ProofLookup {
                vrf_output: out(0x02),
                commitment: None,
            },
        ];
        let proof = PrefixProof {
            results: vec![
                PrefixSearchResult::NonInclusionLeaf {
                    vrf_output: leaf_out,
                    commitment,
                    depth: 0,
                },
                PrefixSearchResult::NonInclusionLeaf {
                    vrf_output: leaf_out,
                    commitment,
                    depth: 0,
                },
            ],
            elements: vec![],
        };
        let root = evaluate(&cs(), &lookups, &proof).unwrap();
        assert_eq!(root, leaf_hash(&cs(), &leaf_out, &commitment));
    }

    #[test]
    fn test_mismatched_terminals_rejected() {
        let lookups = [
            ProofLookup {
                vrf_output: out(0x01),
                commitment: None,
            },
            ProofLookup {
                vrf_output: out(0x02),
                commitment: None,
            },
        ];
        let proof = PrefixProof {
            results: vec![
                PrefixSearchResult::NonInclusionParent { depth: 0 },
                PrefixSearchResult::NonInclusionLeaf {
                    vrf_output: out(0x80),
                    commitment: [7u8; 32],
                    depth: 0,
                },
            ],
            elements: vec![],
        };
        assert!(evaluate(&cs(), &lookups, &proof).is_err());
    }

    #[test]
    fn test_auditor_update_first_version() {
        let added = vec![(out(0x80), [9u8; 32])];
        let update = AuditorUpdate {
            old_root: EMPTY_HASH,
            new_root: leaf_hash(&cs(), &out(0x80), &[9u8; 32]),
            proof: PrefixProof {
                results: vec![PrefixSearchResult::NonInclusionParent { depth: 0 }],
                elements: vec![],
            },
            added,
            removed: vec![],
        };
        update.verify(&cs()).unwrap();
    }

    #[test]
    fn test_auditor_update_split_and_remove() {
        // Old tree: single leaf A. Mutation removes nothing, adds B; the
        // two leaves diverge at bit 0.
        let a = (out(0x80), [1u8; 32]);
        let b = (out(0x01), [2u8; 32]);
        let old_root = leaf_hash(&cs(), &a.0, &a.1);
        let new_root = parent_hash(
            &cs(),
            &leaf_hash(&cs(), &b.0, &b.1),
            &leaf_hash(&cs(), &a.0, &a.1),
        );
        let update = AuditorUpdate {
            old_root,
            new_root,
            proof: PrefixProof {
                results: vec![PrefixSearchResult::NonInclusionLeaf {
                    vrf_output: a.0,
                    commitment: a.1,
                    depth: 0,
                }],
                elements: vec![],
            },
            added: vec![b],
            removed: vec![],
        };
        update.verify(&cs()).unwrap();

        // Now remove A from the two-leaf tree. The sibling is a live leaf,
        // so nothing collapses: the root keeps an empty right child.
        let update = AuditorUpdate {
            old_root: new_root,
            new_root: parent_hash(&cs(), &leaf_hash(&cs(), &b.0, &b.1), &EMPTY_HASH),
            proof: PrefixProof {
                results: vec![PrefixSearchResult::Inclusion { depth: 1 }],
                elements: vec![leaf_hash(&cs(), &b.0, &b.1)],
            },
            added: vec![],
            removed: vec![a],
        };
        update.verify(&cs()).unwrap();
    }
}
