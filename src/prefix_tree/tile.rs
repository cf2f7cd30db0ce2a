//! Tile Serialisation and Splitting
//!
//! A persisted prefix-tree version is a set of tiles, each a size-bounded
//! slice of the tree. A tile's body is the recursive marshalling of its
//! nodes; parent hashes are embedded every `INTERMEDIATE_SUPPRESSION`
//! levels so traversal does not re-hash whole tiles. Subtrees that would
//! blow the weight budget are ejected into their own tiles and replaced by
//! external stubs carrying the subtree hash.

use std::collections::{HashMap, VecDeque};

use crate::crypto::CipherSuite;
use crate::storage::TileId;
use crate::wire::{Decoder, Encoder};

use super::node::{
    Arena, Node, NodeRef, EMPTY_NODE_TYPE, EXTERNAL_NODE_TYPE, LEAF_NODE_TYPE, PARENT_NODE_TYPE,
};
use super::PrefixTreeError;

/// Maximum serialised weight of one tile.
pub const MAX_TILE_WEIGHT: usize = 1024;

/// Parent hashes are embedded at depths where `depth % 4 == 3`.
pub const INTERMEDIATE_SUPPRESSION: u8 = 4;

fn embeds_hash(depth: u8) -> bool {
    depth % INTERMEDIATE_SUPPRESSION == INTERMEDIATE_SUPPRESSION - 1
}

/// Parse a tile into the arena. Returns the root node value (not yet
/// allocated, so a caller can write it over an external stub's slot) and
/// the tile's root depth.
pub fn parse(arena: &mut Arena, id: TileId, data: &[u8]) -> Result<(Node, u8), PrefixTreeError> {
    let mut dec = Decoder::new(data);
    let corrupt = |msg: &str| PrefixTreeError::Corruption(format!("tile {id}: {msg}"));
    let depth = dec.u8().map_err(|_| corrupt("missing depth header"))?;
    let root = parse_node(arena, &mut dec, depth, id)?;
    dec.finish().map_err(|_| corrupt("trailing bytes"))?;
    Ok((root, depth))
}

fn parse_node(
    arena: &mut Arena,
    dec: &mut Decoder,
    depth: u8,
    id: TileId,
) -> Result<Node, PrefixTreeError> {
    let corrupt = |msg: String| PrefixTreeError::Corruption(format!("tile {id}: {msg}"));
    let tag = dec.u8().map_err(|e| corrupt(e.to_string()))?;
    match tag {
        EMPTY_NODE_TYPE => Ok(Node::Empty),
        LEAF_NODE_TYPE => Ok(Node::Leaf {
            vrf_output: dec.hash().map_err(|e| corrupt(e.to_string()))?,
            commitment: dec.hash().map_err(|e| corrupt(e.to_string()))?,
        }),
        PARENT_NODE_TYPE => {
            let hash = if embeds_hash(depth) {
                Some(dec.hash().map_err(|e| corrupt(e.to_string()))?)
            } else {
                None
            };
            let child_depth = depth
                .checked_add(1)
                .ok_or_else(|| corrupt("tree deeper than 256 levels".into()))?;
            let left_node = parse_node(arena, dec, child_depth, id)?;
            let left = arena.alloc(left_node);
            let right_node = parse_node(arena, dec, child_depth, id)?;
            let right = arena.alloc(right_node);
            Ok(Node::Parent { left, right, hash })
        }
        EXTERNAL_NODE_TYPE => {
            let hash = dec.hash().map_err(|e| corrupt(e.to_string()))?;
            let version = dec.uvarint().map_err(|e| corrupt(e.to_string()))?;
            let counter = dec.uvarint().map_err(|e| corrupt(e.to_string()))?;
            Ok(Node::External {
                hash,
                tile: TileId::new(version, counter),
            })
        }
        other => Err(corrupt(format!("unknown node tag {other:#04x}"))),
    }
}

/// Split the materialised subtree at `root` into tiles for `version`. The
/// first tile is `(version, 0)`; ejected subtrees take counters in
/// breadth-first discovery order. Hashes must have been filled beforehand
/// (`Arena::fill_hashes`).
pub fn split(
    arena: &Arena,
    cs: &CipherSuite,
    root: NodeRef,
    version: u64,
    max_weight: usize,
) -> Result<Vec<(TileId, Vec<u8>)>, PrefixTreeError> {
    struct Task {
        node: NodeRef,
        depth: u8,
        counter: u64,
    }

    let mut next_counter: u64 = 1;
    let mut tasks = VecDeque::new();
    tasks.push_back(Task {
        node: root,
        depth: 0,
        counter: 0,
    });
    let mut out = Vec::new();

    while let Some(task) = tasks.pop_front() {
        // Decide which parents stay in this tile, breadth first.
        let mut cuts: HashMap<NodeRef, TileId> = HashMap::new();
        let mut weight = arena.get(task.node).weight();
        let mut queue: VecDeque<(NodeRef, u8)> = VecDeque::new();
        if let Node::Parent { left, right, .. } = arena.get(task.node) {
            weight += arena.get(*left).weight() + arena.get(*right).weight();
            let child_depth = checked_depth(task.depth)?;
            queue.push_back((*left, child_depth));
            queue.push_back((*right, child_depth));
        }
        while let Some((c, d)) = queue.pop_front() {
            if let Node::Parent { left, right, .. } = arena.get(c) {
                let extra = arena.get(*left).weight() + arena.get(*right).weight();
                if weight + extra <= max_weight {
                    weight += extra;
                    let child_depth = checked_depth(d)?;
                    queue.push_back((*left, child_depth));
                    queue.push_back((*right, child_depth));
                } else {
                    let id = TileId::new(version, next_counter);
                    next_counter += 1;
                    cuts.insert(c, id);
                    tasks.push_back(Task {
                        node: c,
                        depth: d,
                        counter: id.counter,
                    });
                }
            }
        }

        let mut enc = Encoder::new();
        enc.u8(task.depth);
        serialize_node(arena, cs, task.node, task.depth, &cuts, true, &mut enc)?;
        out.push((TileId::new(version, task.counter), enc.finish()));
    }
    Ok(out)
}

fn checked_depth(d: u8) -> Result<u8, PrefixTreeError> {
    d.checked_add(1)
        .ok_or_else(|| PrefixTreeError::Corruption("tree deeper than 256 levels".into()))
}

fn serialize_node(
    arena: &Arena,
    cs: &CipherSuite,
    r: NodeRef,
    depth: u8,
    cuts: &HashMap<NodeRef, TileId>,
    is_root: bool,
    enc: &mut Encoder,
) -> Result<(), PrefixTreeError> {
    if !is_root {
        if let Some(id) = cuts.get(&r) {
            enc.u8(EXTERNAL_NODE_TYPE);
            enc.bytes(&arena.hash_of(cs, r));
            enc.uvarint(id.version);
            enc.uvarint(id.counter);
            return Ok(());
        }
    }
    match arena.get(r) {
        Node::Empty => enc.u8(EMPTY_NODE_TYPE),
        Node::Leaf {
            vrf_output,
            commitment,
        } => {
            enc.u8(LEAF_NODE_TYPE);
            enc.bytes(vrf_output);
            enc.bytes(commitment);
        }
        Node::External { hash, tile } => {
            enc.u8(EXTERNAL_NODE_TYPE);
            enc.bytes(hash);
            enc.uvarint(tile.version);
            enc.uvarint(tile.counter);
        }
        Node::Parent { left, right, hash } => {
            enc.u8(PARENT_NODE_TYPE);
            if embeds_hash(depth) {
                let h = hash.ok_or_else(|| {
                    PrefixTreeError::Corruption("parent hash missing during serialisation".into())
                })?;
                enc.bytes(&h);
            }
            let child_depth = checked_depth(depth)?;
            serialize_node(arena, cs, *left, child_depth, cuts, false, enc)?;
            serialize_node(arena, cs, *right, child_depth, cuts, false, enc)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix_tree::node::bit_at;

    fn cs() -> CipherSuite {
        CipherSuite::KtEd25519Sha256
    }

    /// Build a small dense tree: leaves inserted by first byte prefix.
    fn build_tree(arena: &mut Arena, outputs: &[[u8; 32]]) -> NodeRef {
        let mut root = arena.alloc(Node::Empty);
        for out in outputs {
            insert(arena, &mut root, out, 0);
        }
        root
    }

    fn insert(arena: &mut Arena, slot: &mut NodeRef, out: &[u8; 32], depth: u8) {
        match arena.get(*slot).clone() {
            Node::Empty => arena.replace(
                *slot,
                Node::Leaf {
                    vrf_output: *out,
                    commitment: [depth; 32],
                },
            ),
            Node::Leaf { vrf_output, .. } => {
                let mut d = depth;
                while bit_at(&vrf_output, d) == bit_at(out, d) {
                    d += 1;
                }
                // Rebuild the path from the divergence point upward.
                let old = arena.get(*slot).clone();
                let old_ref = arena.alloc(old);
                let new_ref = arena.alloc(Node::Leaf {
                    vrf_output: *out,
                    commitment: [d; 32],
                });
                let (mut l, mut r) = if bit_at(out, d) == 0 {
                    (new_ref, old_ref)
                } else {
                    (old_ref, new_ref)
                };
                let mut cur = arena.alloc(Node::Parent {
                    left: l,
                    right: r,
                    hash: None,
                });
                let mut level = d;
                while level > depth {
                    level -= 1;
                    let empty = arena.alloc(Node::Empty);
                    if bit_at(out, level) == 0 {
                        l = cur;
                        r = empty;
                    } else {
                        l = empty;
                        r = cur;
                    }
                    cur = arena.alloc(Node::Parent {
                        left: l,
                        right: r,
                        hash: None,
                    });
                }
                let node = arena.get(cur).clone();
                arena.replace(*slot, node);
            }
            Node::Parent { left, right, .. } => {
                let mut child = if bit_at(out, depth) == 0 { left } else { right };
                insert(arena, &mut child, out, depth + 1);
                arena.invalidate_hash(*slot);
            }
            Node::External { .. } => panic!("unexpected external in test tree"),
        }
    }

    #[test]
    fn test_parse_serialize_roundtrip() {
        let mut arena = Arena::new();
        let outputs: Vec<[u8; 32]> = (0u8..6).map(|i| [i << 5; 32]).collect();
        let root = build_tree(&mut arena, &outputs);
        arena.fill_hashes(&cs(), root);
        let root_hash = arena.hash_of(&cs(), root);

        let tiles = split(&arena, &cs(), root, 9, MAX_TILE_WEIGHT).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].0, TileId::new(9, 0));

        let mut arena2 = Arena::new();
        let (node, depth) = parse(&mut arena2, tiles[0].0, &tiles[0].1).unwrap();
        assert_eq!(depth, 0);
        let r2 = arena2.alloc(node);
        assert_eq!(arena2.hash_of(&cs(), r2), root_hash);
    }

    #[test]
    fn test_split_respects_weight_and_stub_hashes() {
        let mut arena = Arena::new();
        let outputs: Vec<[u8; 32]> = (0u8..32).map(|i| [i << 3; 32]).collect();
        let root = build_tree(&mut arena, &outputs);
        arena.fill_hashes(&cs(), root);
        let root_hash = arena.hash_of(&cs(), root);

        let tiles = split(&arena, &cs(), root, 4, 256).unwrap();
        assert!(tiles.len() > 1, "expected the tree to split");
        assert_eq!(tiles[0].0, TileId::new(4, 0));

        // Every external stub's hash equals the root hash of the tile it
        // references.
        let tile_map: HashMap<TileId, &Vec<u8>> =
            tiles.iter().map(|(id, data)| (*id, data)).collect();
        let mut stack = vec![tiles[0].0];
        let mut seen_root = None;
        while let Some(id) = stack.pop() {
            let mut arena2 = Arena::new();
            let (node, _) = parse(&mut arena2, id, tile_map[&id]).unwrap();
            let r = arena2.alloc(node);
            let h = arena2.hash_of(&cs(), r);
            if id.counter == 0 {
                seen_root = Some(h);
            }
            for i in 0..arena2.len() {
                if let Node::External { hash, tile } = arena2.get(i) {
                    let mut sub = Arena::new();
                    let (sub_node, _) = parse(&mut sub, *tile, tile_map[tile]).unwrap();
                    let sr = sub.alloc(sub_node);
                    assert_eq!(sub.hash_of(&cs(), sr), *hash);
                    stack.push(*tile);
                }
            }
        }
        assert_eq!(seen_root, Some(root_hash));
    }
}
