//! Batched Tile Search
//!
//! Drives a set of lookups across one or more prefix-tree versions with a
//! single breadth-first pass. Cursors descend through materialised parents
//! until they terminate or hit an external stub; stubs are then resolved a
//! round at a time. If any tile needed this round is already cached, only
//! the cache hits are served (fetching the rest might prove unnecessary
//! once those cursors advance); otherwise one batched get fetches them all.

use std::collections::{HashMap, HashSet};

use crate::crypto::{CipherSuite, Hash};
use crate::storage::{PrefixStore, TileId};
use crate::wire::PrefixSearchResult;

use super::node::{bit_at, Arena, Node, NodeRef};
use super::tile;
use super::PrefixTreeError;

/// Outcome of one lookup, carrying what the proof producer needs.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Present {
        commitment: Hash,
        depth: u8,
    },
    AbsentLeaf {
        other_output: [u8; 32],
        other_commitment: Hash,
        depth: u8,
    },
    AbsentEmpty {
        depth: u8,
    },
}

impl LookupOutcome {
    pub fn is_present(&self) -> bool {
        matches!(self, LookupOutcome::Present { .. })
    }

    pub fn commitment(&self) -> Option<Hash> {
        match self {
            LookupOutcome::Present { commitment, .. } => Some(*commitment),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> PrefixSearchResult {
        match self {
            LookupOutcome::Present { depth, .. } => PrefixSearchResult::Inclusion { depth: *depth },
            LookupOutcome::AbsentLeaf {
                other_output,
                other_commitment,
                depth,
            } => PrefixSearchResult::NonInclusionLeaf {
                vrf_output: *other_output,
                commitment: *other_commitment,
                depth: *depth,
            },
            LookupOutcome::AbsentEmpty { depth } => {
                PrefixSearchResult::NonInclusionParent { depth: *depth }
            }
        }
    }
}

/// The materialised portions of every searched version, sharing one arena.
pub struct Forest {
    pub arena: Arena,
    pub roots: HashMap<u64, NodeRef>,
}

struct Cursor {
    req: usize,
    idx: usize,
    node: NodeRef,
    depth: u8,
}

/// Load the descent paths for every requested lookup and return their
/// outcomes, in request order.
pub(super) async fn load_paths(
    cs: &CipherSuite,
    store: &dyn PrefixStore,
    requests: &[(u64, Vec<[u8; 32]>)],
) -> Result<(Forest, Vec<Vec<LookupOutcome>>), PrefixTreeError> {
    let mut arena = Arena::new();
    let mut cache: HashMap<TileId, (Node, u8)> = HashMap::new();

    let mut versions: Vec<u64> = requests.iter().map(|r| r.0).collect();
    versions.sort_unstable();
    versions.dedup();
    let root_ids: Vec<TileId> = versions.iter().map(|&v| TileId::new(v, 0)).collect();
    let fetched = store.batch_get(&root_ids).await?;
    let mut roots = HashMap::new();
    for id in root_ids {
        let data = fetched
            .get(&id)
            .ok_or_else(|| PrefixTreeError::Corruption(format!("missing root tile {id}")))?;
        let (node, depth) = tile::parse(&mut arena, id, data)?;
        if depth != 0 {
            return Err(PrefixTreeError::Corruption(format!(
                "root tile {id} claims depth {depth}"
            )));
        }
        cache.insert(id, (node.clone(), 0));
        roots.insert(id.version, arena.alloc(node));
    }

    let mut cursors = Vec::new();
    let mut outcomes: Vec<Vec<Option<LookupOutcome>>> = Vec::with_capacity(requests.len());
    for (req, (version, outputs)) in requests.iter().enumerate() {
        outcomes.push(vec![None; outputs.len()]);
        for idx in 0..outputs.len() {
            cursors.push(Cursor {
                req,
                idx,
                node: roots[version],
                depth: 0,
            });
        }
    }

    loop {
        // Advance every cursor as far as the materialised tree allows.
        let mut pending: Vec<(usize, TileId)> = Vec::new();
        for (ci, cur) in cursors.iter_mut().enumerate() {
            if outcomes[cur.req][cur.idx].is_some() {
                continue;
            }
            let output = requests[cur.req].1[cur.idx];
            loop {
                match arena.get(cur.node) {
                    Node::Parent { left, right, .. } => {
                        let child = if bit_at(&output, cur.depth) == 0 {
                            *left
                        } else {
                            *right
                        };
                        cur.node = child;
                        cur.depth = cur.depth.checked_add(1).ok_or_else(|| {
                            PrefixTreeError::Corruption("tree deeper than 256 levels".into())
                        })?;
                    }
                    Node::Leaf {
                        vrf_output,
                        commitment,
                    } => {
                        let outcome = if *vrf_output == output {
                            LookupOutcome::Present {
                                commitment: *commitment,
                                depth: cur.depth,
                            }
                        } else {
                            LookupOutcome::AbsentLeaf {
                                other_output: *vrf_output,
                                other_commitment: *commitment,
                                depth: cur.depth,
                            }
                        };
                        outcomes[cur.req][cur.idx] = Some(outcome);
                        break;
                    }
                    Node::Empty => {
                        outcomes[cur.req][cur.idx] =
                            Some(LookupOutcome::AbsentEmpty { depth: cur.depth });
                        break;
                    }
                    Node::External { tile, .. } => {
                        pending.push((ci, *tile));
                        break;
                    }
                }
            }
        }
        if pending.is_empty() {
            break;
        }

        // Resolve tiles: cache hits alone if there are any, otherwise one
        // batched fetch for everything needed this round.
        let needed: HashSet<TileId> = pending.iter().map(|&(_, id)| id).collect();
        let hits: HashSet<TileId> = needed
            .iter()
            .copied()
            .filter(|id| cache.contains_key(id))
            .collect();
        let serve: HashSet<TileId> = if hits.is_empty() {
            let missing: Vec<TileId> = needed.iter().copied().collect();
            let fetched = store.batch_get(&missing).await?;
            for id in &missing {
                let data = fetched
                    .get(id)
                    .ok_or_else(|| PrefixTreeError::Corruption(format!("missing tile {id}")))?;
                let (node, depth) = tile::parse(&mut arena, *id, data)?;
                cache.insert(*id, (node, depth));
            }
            needed
        } else {
            hits
        };

        for &(ci, id) in &pending {
            if !serve.contains(&id) {
                continue;
            }
            let cur = &cursors[ci];
            let (node, depth) = cache[&id].clone();
            if matches!(node, Node::External { .. }) {
                return Err(PrefixTreeError::Corruption(format!(
                    "tile {id} roots at an external stub"
                )));
            }
            if depth != cur.depth {
                return Err(PrefixTreeError::Corruption(format!(
                    "tile {id} is at depth {depth}, referenced from depth {}",
                    cur.depth
                )));
            }
            if let Node::External { hash, .. } = arena.get(cur.node) {
                let actual = hash_of_node(&arena, cs, &node);
                if actual != *hash {
                    return Err(PrefixTreeError::Corruption(format!(
                        "tile {id} does not match its stub hash"
                    )));
                }
                arena.replace(cur.node, node);
            }
            // A sibling cursor may already have resolved this slot.
        }
    }

    let outcomes = outcomes
        .into_iter()
        .map(|per_req| per_req.into_iter().map(|o| o.expect("cursor finished")).collect())
        .collect();
    Ok((Forest { arena, roots }, outcomes))
}

/// Hash of a node value whose children (if any) live in the arena.
fn hash_of_node(arena: &Arena, cs: &CipherSuite, node: &Node) -> Hash {
    match node {
        Node::Empty => crate::crypto::EMPTY_HASH,
        Node::Leaf {
            vrf_output,
            commitment,
        } => super::node::leaf_hash(cs, vrf_output, commitment),
        Node::External { hash, .. } => *hash,
        Node::Parent { left, right, hash } => match hash {
            Some(h) => *h,
            None => super::node::parent_hash(
                cs,
                &arena.hash_of(cs, *left),
                &arena.hash_of(cs, *right),
            ),
        },
    }
}
