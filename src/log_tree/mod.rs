//! Log Tree
//!
//! A right-appending Merkle tree over log entries, stored as fixed-shape
//! chunks in a key-value store. Supports single and batched inclusion
//! proofs and RFC 6962-style consistency proofs; the verification half
//! lives in `proof` and never touches storage.

pub mod chunk;
pub mod proof;

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::crypto::{CipherSuite, Hash};
use crate::storage::{LogStore, StorageError};
use crate::treemath;

use chunk::Chunk;
pub use proof::{
    combine, evaluate_batch, fold_frontier, verify_consistency, verify_inclusion,
    BatchEvaluation, LogVerifier, NodeHash,
};

#[derive(Debug, Error)]
pub enum LogTreeError {
    #[error("malformed proof: {0}")]
    MalformedProof(String),

    #[error("log storage is corrupt: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Log tree bound to a chunk store for one request.
pub struct LogTree<'a> {
    cs: CipherSuite,
    store: &'a dyn LogStore,
}

impl<'a> LogTree<'a> {
    pub fn new(cs: CipherSuite, store: &'a dyn LogStore) -> Self {
        Self { cs, store }
    }

    /// Append the hash of entry `n` (growing the tree to size `n + 1`) and
    /// return the frontier hashes of the new tree, left to right. Folding
    /// them yields the new root.
    pub async fn append(&self, n: u64, leaf: Hash) -> Result<Vec<Hash>, LogTreeError> {
        let size = n + 1;
        let leaf_node = 2 * n;
        let path = treemath::direct_path(leaf_node, size);

        let mut ids = BTreeSet::new();
        ids.insert(treemath::chunk(leaf_node));
        for &p in &path {
            ids.insert(treemath::chunk(p));
        }
        for c in treemath::copath(leaf_node, size) {
            chunks_for_value(c, size, &mut ids);
        }
        for &f in &treemath::frontier(size) {
            chunks_for_value(f, size, &mut ids);
        }

        let mut set = ChunkSet::load(&self.cs, self.store, &ids).await?;
        set.ensure(treemath::chunk(leaf_node));
        set.set_stored(leaf_node, leaf);

        for &p in &path {
            let l = treemath::left(p);
            let r = treemath::right(p, size);
            let lv = set.hash_any(l, size)?;
            let rv = set.hash_any(r, size)?;
            let value = combine(&self.cs, &lv, &rv);
            set.memoize(p, NodeHash::parent(value));
            if treemath::level(p) % 4 == 0 {
                set.ensure(treemath::chunk(p));
                set.set_stored(p, value);
            }
        }

        let mut frontier = Vec::new();
        for f in treemath::frontier(size) {
            frontier.push(set.hash_any(f, size)?.hash);
        }

        self.store.batch_put(&set.flush()).await?;
        Ok(frontier)
    }

    /// The root hash of the tree at size `n`.
    pub async fn root(&self, n: u64) -> Result<Hash, LogTreeError> {
        let frontier = treemath::frontier(n);
        let mut ids = BTreeSet::new();
        for &f in &frontier {
            chunks_for_value(f, n, &mut ids);
        }
        let mut set = ChunkSet::load(&self.cs, self.store, &ids).await?;
        let mut nodes = Vec::new();
        for f in frontier {
            nodes.push(set.hash_any(f, n)?);
        }
        Ok(proof::fold_nodes(&self.cs, &nodes).hash)
    }

    /// Fetch the value of entry `x` and its copath, nearest sibling first.
    pub async fn get(&self, x: u64, n: u64) -> Result<(Hash, Vec<Hash>), LogTreeError> {
        assert!(x < n, "entry {x} outside log of size {n}");
        let leaf_node = 2 * x;
        let copath = treemath::copath(leaf_node, n);

        let mut ids = BTreeSet::new();
        ids.insert(treemath::chunk(leaf_node));
        for &c in &copath {
            chunks_for_value(c, n, &mut ids);
        }

        let mut set = ChunkSet::load(&self.cs, self.store, &ids).await?;
        let value = set.stored(leaf_node)?;
        let mut elements = Vec::new();
        for c in copath {
            elements.push(set.hash_any(c, n)?.hash);
        }
        Ok((value, elements))
    }

    /// Produce the batch-copath proof for a set of entries, optionally
    /// anchored on the retained full subtrees of an earlier size.
    pub async fn get_batch(
        &self,
        entries: &[u64],
        n: u64,
        last_known: Option<u64>,
    ) -> Result<Vec<Hash>, LogTreeError> {
        assert!(!entries.is_empty(), "empty batch");
        let nodes = treemath::batch_copath(entries, n, last_known);
        let mut ids = BTreeSet::new();
        for &x in &nodes {
            chunks_for_value(x, n, &mut ids);
        }
        let mut set = ChunkSet::load(&self.cs, self.store, &ids).await?;
        let mut out = Vec::new();
        for x in nodes {
            out.push(set.hash_any(x, n)?.hash);
        }
        Ok(out)
    }

    /// Produce the consistency proof between sizes `m` and `n`.
    pub async fn get_consistency(&self, m: u64, n: u64) -> Result<Vec<Hash>, LogTreeError> {
        assert!(m >= 1 && m < n, "invalid consistency query {m} -> {n}");
        let ranges = proof::consistency_ranges(m, n);
        let mut ids = BTreeSet::new();
        for &(a, b) in &ranges {
            for node in range_nodes(a, b) {
                ids.insert(treemath::chunk(node));
            }
        }
        let mut set = ChunkSet::load(&self.cs, self.store, &ids).await?;
        let mut out = Vec::new();
        for (a, b) in ranges {
            let nodes = range_nodes(a, b)
                .into_iter()
                .map(|x| Ok(NodeHash::at(x, set.value(x)?)))
                .collect::<Result<Vec<_>, LogTreeError>>()?;
            out.push(proof::fold_nodes(&self.cs, &nodes).hash);
        }
        Ok(out)
    }
}

/// Chunk ids needed to compute the hash of node `x` at size `n`.
fn chunks_for_value(x: u64, n: u64, ids: &mut BTreeSet<u64>) {
    if treemath::is_complete(x, n) {
        ids.insert(treemath::chunk(x));
    } else {
        for s in treemath::full_subtrees(x, n) {
            ids.insert(treemath::chunk(s));
        }
    }
}

/// Roots of the maximal complete subtrees covering entries `[a, b)`.
fn range_nodes(a: u64, b: u64) -> Vec<u64> {
    debug_assert!(a < b);
    let mut out = Vec::new();
    let mut a = a;
    while a < b {
        let align = if a == 0 {
            u64::MAX
        } else {
            1u64 << a.trailing_zeros()
        };
        let mut s = 1u64 << treemath::log2(b - a);
        s = s.min(align);
        out.push(2 * a + s - 1);
        a += s;
    }
    out
}

/// Request-local cache of chunks, with interior-hash computation.
struct ChunkSet<'a> {
    cs: &'a CipherSuite,
    chunks: HashMap<u64, Chunk>,
    dirty: BTreeSet<u64>,
    ragged: HashMap<u64, NodeHash>,
}

impl<'a> ChunkSet<'a> {
    async fn load(
        cs: &'a CipherSuite,
        store: &dyn LogStore,
        ids: &BTreeSet<u64>,
    ) -> Result<ChunkSet<'a>, LogTreeError> {
        let id_list: Vec<u64> = ids.iter().copied().collect();
        let raw = store.batch_get(&id_list).await?;
        let mut chunks = HashMap::new();
        for (id, data) in raw {
            chunks.insert(id, Chunk::parse(id, &data)?);
        }
        Ok(ChunkSet {
            cs,
            chunks,
            dirty: BTreeSet::new(),
            ragged: HashMap::new(),
        })
    }

    fn ensure(&mut self, id: u64) {
        self.chunks.entry(id).or_insert_with(Chunk::empty);
    }

    fn set_stored(&mut self, x: u64, value: Hash) {
        debug_assert!(treemath::level(x) % 4 == 0);
        let c = treemath::chunk(x);
        let slot = treemath::chunk_index(c, x);
        let chunk = self
            .chunks
            .get_mut(&c)
            .expect("writing to a chunk that was not loaded");
        chunk.set(slot, value);
        self.dirty.insert(c);
    }

    fn memoize(&mut self, x: u64, value: NodeHash) {
        self.ragged.insert(x, value);
    }

    fn stored(&self, x: u64) -> Result<Hash, LogTreeError> {
        let c = treemath::chunk(x);
        let slot = treemath::chunk_index(c, x);
        self.chunks
            .get(&c)
            .and_then(|chunk| chunk.get(slot))
            .ok_or_else(|| LogTreeError::Corruption(format!("missing stored node {x}")))
    }

    /// Value of a node whose subtree is complete. Interior values are
    /// recomputed from the chunk's stored row and cached.
    fn value(&mut self, x: u64) -> Result<Hash, LogTreeError> {
        if let Some(v) = self.ragged.get(&x) {
            return Ok(v.hash);
        }
        let c = treemath::chunk(x);
        let slot = treemath::chunk_index(c, x);
        if slot % 2 == 0 {
            return self.stored(x);
        }
        if let Some(v) = self.chunks.get(&c).and_then(|chunk| chunk.get(slot)) {
            return Ok(v);
        }
        let k = treemath::level(x);
        let l = treemath::left(x);
        let r = x ^ (3u64 << (k - 1));
        let lv = NodeHash {
            hash: self.value(l)?,
            leaf: treemath::is_leaf(l),
        };
        let rv = NodeHash {
            hash: self.value(r)?,
            leaf: treemath::is_leaf(r),
        };
        let value = combine(self.cs, &lv, &rv);
        if let Some(chunk) = self.chunks.get_mut(&c) {
            chunk.set(slot, value);
        }
        Ok(value)
    }

    /// Hash operand for any node, complete or ragged.
    fn hash_any(&mut self, x: u64, n: u64) -> Result<NodeHash, LogTreeError> {
        if let Some(v) = self.ragged.get(&x) {
            return Ok(*v);
        }
        if treemath::is_complete(x, n) {
            return Ok(NodeHash {
                hash: self.value(x)?,
                leaf: treemath::is_leaf(x),
            });
        }
        let l = self.hash_any(treemath::left(x), n)?;
        let r = self.hash_any(treemath::right(x, n), n)?;
        let value = NodeHash::parent(combine(self.cs, &l, &r));
        self.ragged.insert(x, value);
        Ok(value)
    }

    fn flush(&self) -> Vec<(u64, Vec<u8>)> {
        self.dirty
            .iter()
            .map(|id| (*id, self.chunks[id].serialize()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::TransparencyStore;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};

    fn cs() -> CipherSuite {
        CipherSuite::KtEd25519Sha256
    }

    fn random_leaf(rng: &mut StdRng) -> Hash {
        let mut out = [0u8; 32];
        rng.fill_bytes(&mut out);
        out
    }

    /// Reference implementation: recursive Merkle root over a leaf slice.
    fn naive(cs: &CipherSuite, leaves: &[Hash]) -> NodeHash {
        if leaves.len() == 1 {
            return NodeHash::leaf(leaves[0]);
        }
        let k = {
            let mut k = 1usize;
            while k * 2 < leaves.len() {
                k *= 2;
            }
            k
        };
        let l = naive(cs, &leaves[..k]);
        let r = naive(cs, &leaves[k..]);
        NodeHash::parent(combine(cs, &l, &r))
    }

    #[tokio::test]
    async fn test_append_matches_reference_root() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(1);
        let mut leaves = Vec::new();
        for n in 0..200u64 {
            let leaf = random_leaf(&mut rng);
            leaves.push(leaf);
            let frontier = tree.append(n, leaf).await.unwrap();
            let root = fold_frontier(&cs(), n + 1, &frontier).unwrap();
            assert_eq!(root, naive(&cs(), &leaves).hash, "size {}", n + 1);
            assert_eq!(tree.root(n + 1).await.unwrap(), root);
        }
    }

    #[tokio::test]
    async fn test_inclusion_roundtrip() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(2);
        let n = 2000u64;
        let mut leaves = Vec::new();
        for i in 0..n {
            let leaf = random_leaf(&mut rng);
            leaves.push(leaf);
            tree.append(i, leaf).await.unwrap();
        }
        let root = tree.root(n).await.unwrap();
        for x in 0..n {
            let (value, proof) = tree.get(x, n).await.unwrap();
            assert_eq!(value, leaves[x as usize]);
            verify_inclusion(&cs(), x, n, &value, &proof, &root).unwrap();
        }
    }

    #[tokio::test]
    async fn test_inclusion_rejects_tampering() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(3);
        for i in 0..10u64 {
            tree.append(i, random_leaf(&mut rng)).await.unwrap();
        }
        let root = tree.root(10).await.unwrap();
        let (value, mut proof) = tree.get(4, 10).await.unwrap();
        proof[0][0] ^= 1;
        assert!(verify_inclusion(&cs(), 4, 10, &value, &proof, &root).is_err());
    }

    #[tokio::test]
    async fn test_batch_evaluation() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(4);
        let n = 2000u64;
        let mut leaves = Vec::new();
        for i in 0..n {
            let leaf = random_leaf(&mut rng);
            leaves.push(leaf);
            tree.append(i, leaf).await.unwrap();
        }
        let root = tree.root(n).await.unwrap();

        for _ in 0..50 {
            let count = rng.gen_range(1..=10);
            let mut entries: Vec<u64> = (0..count).map(|_| rng.gen_range(0..n)).collect();
            entries.sort_unstable();
            entries.dedup();
            let proof = tree.get_batch(&entries, n, None).await.unwrap();
            let with_values: Vec<(u64, Hash)> = entries
                .iter()
                .map(|&e| (e, leaves[e as usize]))
                .collect();
            let eval = evaluate_batch(&cs(), &with_values, n, None, &proof).unwrap();
            assert_eq!(eval.root, root);
        }
    }

    #[tokio::test]
    async fn test_verifier_retains_and_advances() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(5);
        let mut leaves = Vec::new();
        for i in 0..100u64 {
            let leaf = random_leaf(&mut rng);
            leaves.push(leaf);
            tree.append(i, leaf).await.unwrap();
        }

        let mut verifier = LogVerifier::new();
        let root_100 = tree.root(100).await.unwrap();
        let proof = tree.get_batch(&[5, 17], 100, None).await.unwrap();
        verifier
            .advance(
                &cs(),
                &[(5, leaves[5]), (17, leaves[17])],
                100,
                &proof,
                &root_100,
            )
            .unwrap();
        assert_eq!(verifier.size(), Some(100));
        assert_eq!(verifier.retained_root(&cs()).unwrap(), root_100);

        // Grow the log and advance using the retained subtrees.
        for i in 100..150u64 {
            let leaf = random_leaf(&mut rng);
            leaves.push(leaf);
            tree.append(i, leaf).await.unwrap();
        }
        let root_150 = tree.root(150).await.unwrap();
        let proof = tree.get_batch(&[120], 150, Some(100)).await.unwrap();
        verifier
            .advance(&cs(), &[(120, leaves[120])], 150, &proof, &root_150)
            .unwrap();
        assert_eq!(verifier.size(), Some(150));
        assert_eq!(verifier.retained_root(&cs()).unwrap(), root_150);

        // A proof against the wrong root must not advance the state.
        let bad = tree.get_batch(&[120], 150, Some(150)).await.unwrap();
        assert!(verifier
            .advance(&cs(), &[(120, leaves[120])], 150, &bad, &root_100)
            .is_err());
        assert_eq!(verifier.size(), Some(150));
    }

    #[tokio::test]
    async fn test_consistency_all_small_pairs() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(6);
        let max = 64u64;
        let mut roots = Vec::new();
        for i in 0..max {
            let frontier = tree.append(i, random_leaf(&mut rng)).await.unwrap();
            roots.push(fold_frontier(&cs(), i + 1, &frontier).unwrap());
        }
        for m in 1..max {
            for n in (m + 1)..=max {
                let proof = tree.get_consistency(m, n).await.unwrap();
                verify_consistency(
                    &cs(),
                    m,
                    n,
                    &proof,
                    &roots[(m - 1) as usize],
                    &roots[(n - 1) as usize],
                )
                .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_consistency_large_random_pairs() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(7);
        let max = 2000u64;
        let mut roots = Vec::new();
        for i in 0..max {
            let frontier = tree.append(i, random_leaf(&mut rng)).await.unwrap();
            roots.push(fold_frontier(&cs(), i + 1, &frontier).unwrap());
        }
        for _ in 0..200 {
            let m = rng.gen_range(1..max);
            let n = rng.gen_range(m + 1..=max);
            let proof = tree.get_consistency(m, n).await.unwrap();
            verify_consistency(
                &cs(),
                m,
                n,
                &proof,
                &roots[(m - 1) as usize],
                &roots[(n - 1) as usize],
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_consistency_rejects_wrong_roots() {
        let store = MemoryStore::new();
        let tree = LogTree::new(cs(), store.log_store());
        let mut rng = StdRng::seed_from_u64(8);
        let mut roots = Vec::new();
        for i in 0..20u64 {
            let frontier = tree.append(i, random_leaf(&mut rng)).await.unwrap();
            roots.push(fold_frontier(&cs(), i + 1, &frontier).unwrap());
        }
        let proof = tree.get_consistency(7, 20).await.unwrap();
        assert!(verify_consistency(&cs(), 7, 20, &proof, &roots[7], &roots[19]).is_err());
        assert!(verify_consistency(&cs(), 7, 20, &proof, &roots[6], &roots[18]).is_err());
    }

    #[tokio::test]
    async fn test_missing_chunk_is_corruption() {
        use crate::storage::traits::MockLogStore;

        let mut mock = MockLogStore::new();
        mock.expect_batch_get()
            .returning(|_| Ok(std::collections::HashMap::new()));
        let tree = LogTree::new(cs(), &mock);
        let err = tree.get(3, 10).await.unwrap_err();
        assert!(matches!(err, LogTreeError::Corruption(_)));
    }
}
