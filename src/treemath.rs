//! Log Tree Index Arithmetic
//!
//! Node addressing for the left-balanced Merkle log: leaves sit at even
//! indices `2*i`, parents at odd indices. Also provides the chunk-id math
//! used by the chunked log store and the implicit binary search tree over
//! log entries used by the search and monitoring algorithms.
//!
//! All functions here are pure. Passing an out-of-range node for the stated
//! tree size indicates caller corruption and panics.

/// Floor of log2. Panics on zero.
pub fn log2(x: u64) -> u32 {
    assert!(x > 0, "log2 of zero");
    63 - x.leading_zeros()
}

/// Level of a node: number of trailing one bits. Leaves are level 0.
pub fn level(x: u64) -> u32 {
    x.trailing_ones()
}

/// Number of nodes in a tree with `n` leaves.
pub fn node_width(n: u64) -> u64 {
    assert!(n > 0, "empty tree has no nodes");
    2 * (n - 1) + 1
}

/// Root node of a tree with `n` leaves.
pub fn root(n: u64) -> u64 {
    (1u64 << log2(node_width(n))) - 1
}

pub fn is_leaf(x: u64) -> bool {
    x & 1 == 0
}

/// Left child of an interior node.
pub fn left(x: u64) -> u64 {
    let k = level(x);
    assert!(k > 0, "leaf {x} has no children");
    x ^ (1u64 << (k - 1))
}

fn right_step(x: u64) -> u64 {
    let k = level(x);
    assert!(k > 0, "leaf {x} has no children");
    x ^ (3u64 << (k - 1))
}

/// Right child of an interior node in a tree with `n` leaves, accounting
/// for the ragged right edge.
pub fn right(x: u64, n: u64) -> u64 {
    let w = node_width(n);
    let mut r = right_step(x);
    while r >= w {
        r = left(r);
    }
    r
}

fn parent_step(x: u64) -> u64 {
    let k = level(x);
    let b = (x >> (k + 1)) & 1;
    (x | (1u64 << k)) ^ (b << (k + 1))
}

/// Parent of a node in a tree with `n` leaves. Panics on the root.
pub fn parent(x: u64, n: u64) -> u64 {
    assert!(x != root(n), "root {x} has no parent");
    let w = node_width(n);
    let mut p = parent_step(x);
    while p >= w {
        p = parent_step(p);
    }
    p
}

/// The other child of this node's parent.
pub fn sibling(x: u64, n: u64) -> u64 {
    let p = parent(x, n);
    if x < p {
        right(p, n)
    } else {
        left(p)
    }
}

/// Ancestors of `x` from its parent up to and including the root.
pub fn direct_path(x: u64, n: u64) -> Vec<u64> {
    let r = root(n);
    let mut path = Vec::new();
    let mut cur = x;
    while cur != r {
        cur = parent(cur, n);
        path.push(cur);
    }
    path
}

/// Siblings along the direct path of `x`, nearest first, root excluded.
pub fn copath(x: u64, n: u64) -> Vec<u64> {
    if x == root(n) {
        return Vec::new();
    }
    let mut nodes = vec![x];
    let mut path = direct_path(x, n);
    path.pop();
    nodes.extend(path);
    nodes.into_iter().map(|y| sibling(y, n)).collect()
}

/// Leaf-node span `[lo, hi]` covered by the subtree rooted at `x`, in the
/// infinite tree.
fn span(x: u64) -> (u64, u64) {
    let k = level(x);
    let off = (1u64 << k) - 1;
    (x - off, x + off)
}

/// Whether the subtree rooted at `x` is complete in a tree with `n` leaves.
pub fn is_complete(x: u64, n: u64) -> bool {
    span(x).1 < node_width(n)
}

/// Maximal complete subtrees covering the (possibly ragged) subtree rooted
/// at `x`, left to right. A complete node is its own decomposition.
pub fn full_subtrees(x: u64, n: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut cur = x;
    loop {
        if is_complete(cur, n) {
            out.push(cur);
            return out;
        }
        out.push(left(cur));
        cur = right(cur, n);
    }
}

/// Frontier of the tree: full subtrees of the root, left to right. Folding
/// their hashes yields the tree root hash.
pub fn frontier(n: u64) -> Vec<u64> {
    full_subtrees(root(n), n)
}

/// Minimal set of subtree roots whose hashes, together with the leaves of
/// `entries` (and the retained full subtrees of a size-`last_known` tree),
/// derive the size-`n` root. Sorted by node index.
///
/// The walk keeps two extra guarantees beyond bare root derivation: every
/// full subtree of the size-`n` tree stays individually derivable (so a
/// verifier can advance its retained frontier), and subtrees the verifier
/// retained from the size-`last_known` tree are reused instead of re-sent.
pub fn batch_copath(entries: &[u64], n: u64, last_known: Option<u64>) -> Vec<u64> {
    let walk = BatchWalk::new(entries, n, last_known);
    let mut out = Vec::new();
    walk.descend(root(n), &mut out);
    out
}

/// Shared classification of nodes during a batch-copath walk. The proof
/// producer and `evaluate_batch` must agree on it exactly.
pub struct BatchWalk {
    n: u64,
    leaves: Vec<u64>,
    frontier: Vec<u64>,
    anchors: Vec<u64>,
}

impl BatchWalk {
    pub fn new(entries: &[u64], n: u64, last_known: Option<u64>) -> Self {
        let mut leaves: Vec<u64> = entries.iter().map(|e| 2 * e).collect();
        leaves.sort_unstable();
        leaves.dedup();
        let mut anchors = last_known.map(frontier).unwrap_or_default();
        anchors.sort_unstable();
        Self {
            n,
            leaves,
            frontier: frontier(n),
            anchors,
        }
    }

    pub fn is_entry_leaf(&self, x: u64) -> bool {
        self.leaves.binary_search(&x).is_ok()
    }

    pub fn is_anchor(&self, x: u64) -> bool {
        self.anchors.binary_search(&x).is_ok()
    }

    fn any_in_span(list: &[u64], lo: u64, hi: u64) -> bool {
        let start = list.partition_point(|&y| y < lo);
        start < list.len() && list[start] <= hi
    }

    pub fn has_entry_within(&self, x: u64) -> bool {
        let (lo, hi) = span(x);
        Self::any_in_span(&self.leaves, lo, hi)
    }

    fn has_frontier_strictly_within(&self, x: u64) -> bool {
        let (lo, hi) = span(x);
        self.frontier
            .iter()
            .any(|&f| f != x && (lo..=hi).contains(&f))
    }

    fn has_anchor_strictly_within(&self, x: u64) -> bool {
        let (lo, hi) = span(x);
        self.anchors
            .iter()
            .any(|&a| a != x && (lo..=hi).contains(&a))
    }

    /// Whether the walk stops at `x` reusing a retained subtree.
    pub fn stops_at_anchor(&self, x: u64) -> bool {
        !self.has_entry_within(x) && !self.has_frontier_strictly_within(x) && self.is_anchor(x)
    }

    /// Whether the walk emits a proof element for `x`.
    pub fn emits_element(&self, x: u64) -> bool {
        !self.has_entry_within(x)
            && !self.has_frontier_strictly_within(x)
            && !self.is_anchor(x)
            && !self.has_anchor_strictly_within(x)
    }

    fn descend(&self, x: u64, out: &mut Vec<u64>) {
        if self.is_entry_leaf(x) || self.stops_at_anchor(x) {
            return;
        }
        if self.emits_element(x) {
            out.push(x);
            return;
        }
        self.descend(left(x), out);
        self.descend(right(x, self.n), out);
    }
}

// --- chunk addressing -------------------------------------------------------

/// Chunk root of a node: the nearest ancestor (or the node itself) whose
/// level is congruent to 3 mod 4. Chunk roots double as storage keys.
pub fn chunk(x: u64) -> u64 {
    let mut c = x;
    while level(c) % 4 != 3 {
        c = parent_step(c);
    }
    c
}

/// Band of a chunk root: chunks at band `k` store node values of level `4k`.
pub fn chunk_band(c: u64) -> u32 {
    let l = level(c);
    assert!(l % 4 == 3, "node {c} is not a chunk root");
    (l - 3) / 4
}

/// Leftmost stored node of a chunk (mini-index 0).
pub fn chunk_base(c: u64) -> u64 {
    c - 7 * (1u64 << (4 * chunk_band(c)))
}

/// Position of `x` within its chunk's 15-slot in-order array.
pub fn chunk_index(c: u64, x: u64) -> usize {
    let stride = 1u64 << (4 * chunk_band(c));
    let base = chunk_base(c);
    assert!(
        x >= base && (x - base) % stride == 0 && (x - base) / stride < 15,
        "node {x} is not contained in chunk {c}"
    );
    ((x - base) / stride) as usize
}

/// Node at mini-index `i` of chunk `c`.
pub fn chunk_node(c: u64, i: usize) -> u64 {
    assert!(i < 15, "chunk slot {i} out of range");
    chunk_base(c) + (i as u64) * (1u64 << (4 * chunk_band(c)))
}

// --- implicit search tree over log entries ----------------------------------
//
// The search and monitoring algorithms binary-search the log through an
// implicit BST whose nodes are the entry indices themselves: the root of
// [lo, hi) is lo + 2^floor(log2(hi-lo)) - 1.

/// Root entry of the implicit search tree over `[lo, hi)`.
pub fn bst_root(lo: u64, hi: u64) -> u64 {
    assert!(hi > lo, "empty search interval");
    lo + (1u64 << log2(hi - lo)) - 1
}

/// Left child of entry `x` whose subtree is `[lo, x)`, if non-empty.
pub fn bst_left(x: u64, lo: u64) -> Option<u64> {
    if x > lo {
        Some(bst_root(lo, x))
    } else {
        None
    }
}

/// Right child of entry `x` whose subtree is `(x, hi)`, if non-empty.
pub fn bst_right(x: u64, hi: u64) -> Option<u64> {
    if x + 1 < hi {
        Some(bst_root(x + 1, hi))
    } else {
        None
    }
}

/// Descent path from the root of the search tree over `[0, n)` down to
/// `entry`, inclusive on both ends.
pub fn bst_direct_path(entry: u64, n: u64) -> Vec<u64> {
    assert!(entry < n, "entry {entry} outside log of size {n}");
    let mut path = Vec::new();
    let (mut lo, mut hi) = (0u64, n);
    loop {
        let cur = bst_root(lo, hi);
        path.push(cur);
        if cur == entry {
            return path;
        }
        if entry < cur {
            hi = cur;
        } else {
            lo = cur + 1;
        }
    }
}

/// The right spine of the search tree: the descent path to entry `n - 1`.
pub fn bst_frontier(n: u64) -> Vec<u64> {
    bst_direct_path(n - 1, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log2_and_level() {
        assert_eq!(log2(10000), 13);
        assert_eq!(level(1), 1);
        assert_eq!(level(2), 0);
        assert_eq!(level(3), 2);
    }

    #[test]
    fn test_relations() {
        assert_eq!(root(5), 7);
        assert_eq!(left(7), 3);
        assert_eq!(right(7, 8), 11);
        assert_eq!(parent(5, 4), 3);
        assert_eq!(sibling(13, 8), 9);
    }

    #[test]
    fn test_paths() {
        assert_eq!(direct_path(4, 8), vec![5, 3, 7]);
        assert_eq!(copath(4, 8), vec![6, 1, 11]);
        assert_eq!(full_subtrees(7, 6), vec![3, 9]);
    }

    #[test]
    fn test_batch_copath() {
        assert_eq!(batch_copath(&[0, 2, 3, 4], 8, None), vec![2, 10, 13]);
        assert_eq!(batch_copath(&[0, 2, 3], 8, None), vec![2, 11]);
    }

    #[test]
    fn test_batch_copath_exposes_frontier() {
        // Ragged trees keep every full subtree derivable so a verifier can
        // advance its retained state: 9 and 12 are sent whole instead of
        // being folded into one hash for node 11.
        assert_eq!(batch_copath(&[0], 7, None), vec![2, 5, 9, 12]);
    }

    #[test]
    fn test_batch_copath_with_retained() {
        // With the frontier of a size-4 tree retained, only the right half
        // of a size-8 tree is needed to prove a new leaf.
        let out = batch_copath(&[5], 8, Some(4));
        assert_eq!(out, vec![8, 13]);
    }

    #[test]
    fn test_ragged_right_child() {
        // In a 6-leaf tree the right child of the root is the 2-leaf
        // subtree rooted at 9.
        assert_eq!(right(7, 6), 9);
        assert_eq!(parent(9, 6), 7);
        assert_eq!(parent(8, 6), 9);
    }

    #[test]
    fn test_frontier_matches_size_decomposition() {
        assert_eq!(frontier(4), vec![3]);
        assert_eq!(frontier(5), vec![3, 8]);
        assert_eq!(frontier(7), vec![3, 9, 12]);
    }

    #[test]
    fn test_chunk_ids() {
        // Band 0: every node below level 4 maps to a level-3 chunk root.
        assert_eq!(chunk(0), 7);
        assert_eq!(chunk(5), 7);
        assert_eq!(chunk(7), 7);
        assert_eq!(chunk(16), 23);
        // Band 1: level-4 nodes live in the chunk rooted at level 7.
        assert_eq!(chunk(15), 127);
        assert_eq!(chunk(31), 127);
        assert_eq!(chunk_base(127), 15);
        assert_eq!(chunk_index(127, 15), 0);
        assert_eq!(chunk_index(127, 47), 2);
        assert_eq!(chunk_node(127, 2), 47);
    }

    #[test]
    fn test_chunk_roundtrip() {
        for x in 0u64..2000 {
            let c = chunk(x);
            assert_eq!(level(c) % 4, 3);
            let i = chunk_index(c, x);
            assert_eq!(chunk_node(c, i), x);
        }
    }

    #[test]
    fn test_bst_roots() {
        assert_eq!(bst_root(0, 100), 63);
        assert_eq!(bst_root(64, 100), 95);
        assert_eq!(bst_root(96, 100), 99);
        assert_eq!(bst_frontier(100), vec![63, 95, 99]);
    }

    #[test]
    fn test_bst_children() {
        assert_eq!(bst_right(63, 100), Some(95));
        assert_eq!(bst_right(95, 100), Some(99));
        assert_eq!(bst_right(99, 100), None);
        assert_eq!(bst_left(63, 0), Some(31));
        assert_eq!(bst_left(0, 0), None);
    }

    #[test]
    fn test_bst_direct_path() {
        assert_eq!(bst_direct_path(99, 100), vec![63, 95, 99]);
        assert_eq!(bst_direct_path(64, 100), vec![63, 95, 79, 71, 67, 65, 64]);
        assert_eq!(bst_direct_path(0, 1), vec![0]);
    }
}
