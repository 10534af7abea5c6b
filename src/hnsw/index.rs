//! HNSW index over engine-assigned labels.
//!
//! A hierarchical navigable small-world graph under squared L2 distance:
//! random layer assignment from an exponential draw, greedy descent from
//! the top layer, beam search with `ef` candidates on layer 0, and a
//! diversity-preserving neighbor selection heuristic.
//!
//! Unlike a graph that resolves vectors through an external store, this
//! index owns its vectors: `add_point` hands over the embedding keyed by
//! label, which keeps the whole structure serializable into one file.
//!
//! Deletes are soft. A tombstoned label stays in the graph and keeps
//! routing searches, but is never emitted as a result and its label is
//! never reused. Overwriting a tombstoned label revives it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use crate::error::{DbError, Result};
use crate::simd::l2_squared;

/// Default beam width for searches; raised to `k` when callers ask for more.
const DEFAULT_EF_SEARCH: usize = 50;

/// Candidate for exploration (min-heap by distance).
#[derive(Clone, Copy)]
struct Candidate {
    label: u64,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller distance pops first.
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Retained result (max-heap, worst on top for eviction).
#[derive(Clone, Copy)]
struct Retained {
    label: u64,
    distance: f32,
}

impl PartialEq for Retained {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Retained {}

impl Ord for Retained {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Retained {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// HNSW graph keyed by `u64` labels, metric squared L2.
#[derive(Debug)]
pub struct HnswIndex {
    pub(super) dim: usize,
    pub(super) m: usize,
    pub(super) m0: usize,
    pub(super) ml: f64,
    pub(super) ef_construction: usize,
    pub(super) entry_point: Option<u64>,
    pub(super) max_layer: usize,
    pub(super) nodes: Vec<Node>,
    pub(super) label_to_slot: HashMap<u64, usize>,
    pub(super) vectors: HashMap<u64, Vec<f32>>,
    pub(super) deleted: HashSet<u64>,
    rng: StdRng,
}

impl HnswIndex {
    /// Create an empty index for vectors of length `dim`.
    ///
    /// `capacity_hint` pre-sizes the node and vector tables; it is not a
    /// limit.
    pub fn new(dim: usize, capacity_hint: usize) -> Self {
        Self::with_seed(dim, capacity_hint, rand::random())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(dim: usize, capacity_hint: usize, seed: u64) -> Self {
        let m = 16usize;
        Self {
            dim,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: 100,
            entry_point: None,
            max_layer: 0,
            nodes: Vec::with_capacity(capacity_hint),
            label_to_slot: HashMap::with_capacity(capacity_hint),
            vectors: HashMap::with_capacity(capacity_hint),
            deleted: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild from deserialized parts; adjacency must already be
    /// label-consistent (the loader validates).
    pub(super) fn from_parts(
        dim: usize,
        m: usize,
        ef_construction: usize,
        entry_point: Option<u64>,
        max_layer: usize,
        nodes: Vec<Node>,
        vectors: HashMap<u64, Vec<f32>>,
        deleted: HashSet<u64>,
    ) -> Self {
        let label_to_slot = nodes
            .iter()
            .enumerate()
            .map(|(slot, node)| (node.label, slot))
            .collect();
        Self {
            dim,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction,
            entry_point,
            max_layer,
            nodes,
            label_to_slot,
            vectors,
            deleted,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of points that searches may return.
    pub fn live_len(&self) -> usize {
        self.label_to_slot.len() - self.deleted.len()
    }

    pub fn contains(&self, label: u64) -> bool {
        self.label_to_slot.contains_key(&label)
    }

    #[inline]
    fn distance(&self, query: &[f32], label: u64) -> f32 {
        match self.vectors.get(&label) {
            Some(v) => l2_squared(query, v),
            None => f32::INFINITY,
        }
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        (-r.ln() * self.ml).floor() as usize
    }

    /// Insert a point, or overwrite the point already stored at `label`.
    ///
    /// Overwrite replaces the stored vector, clears any tombstone, and
    /// re-wires the node's out-edges from a fresh descent. Reverse edges
    /// keep pointing at the label and simply see the new vector.
    pub fn add_point(&mut self, vector: &[f32], label: u64) -> Result<()> {
        if vector.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: vector.len(),
            });
        }

        self.vectors.insert(label, vector.to_vec());
        self.deleted.remove(&label);

        if let Some(&slot) = self.label_to_slot.get(&label) {
            let node_layer = self.nodes[slot].top_layer();
            self.nodes[slot].clear_edges();
            self.wire(label, node_layer);
            return Ok(());
        }

        let node_layer = self.random_layer();
        let node = Node::new(label, node_layer);

        if self.entry_point.is_none() {
            self.entry_point = Some(label);
            self.max_layer = node_layer;
            self.label_to_slot.insert(label, self.nodes.len());
            self.nodes.push(node);
            return Ok(());
        }

        self.label_to_slot.insert(label, self.nodes.len());
        self.nodes.push(node);
        self.wire(label, node_layer);

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(label);
        }
        Ok(())
    }

    /// Connect the node at `label` into the graph on layers
    /// `0..=node_layer`. The node's own edge lists must be empty; edges
    /// toward it from other nodes may already exist.
    fn wire(&mut self, label: u64, node_layer: usize) {
        let entry = match self.entry_point {
            Some(ep) if ep != label => ep,
            // Sole node, or re-wiring the entry point itself: nothing to
            // connect to unless other nodes exist below.
            _ => match self.nodes.iter().map(|n| n.label).find(|&l| l != label) {
                Some(other) => other,
                None => return,
            },
        };
        let query = match self.vectors.get(&label) {
            Some(v) => v.clone(),
            None => return,
        };

        let mut current = entry;
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self
                .search_layer(&query, &[current], 1, layer, Some(label))
                .first()
            {
                current = nearest;
            }
        }

        let start_layer = node_layer.min(self.max_layer);

        // Reverse edges to apply afterwards, and pruned adjacency for
        // neighbors that would exceed their fan-out.
        let mut reverse_edges: Vec<(usize, usize, u64)> = Vec::new();
        let mut prune_ops: Vec<(usize, usize, Vec<u64>)> = Vec::new();

        for layer in (0..=start_layer).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };
            let candidates =
                self.search_layer(&query, &[current], self.ef_construction, layer, Some(label));
            let chosen = self.select_neighbors(&candidates, m_layer);

            for &(neighbor, _) in &chosen {
                let slot = self.label_to_slot[&label];
                self.nodes[slot].add_neighbor(layer, neighbor);

                if let Some(&neighbor_slot) = self.label_to_slot.get(&neighbor) {
                    reverse_edges.push((neighbor_slot, layer, label));

                    let current_neighbors = self.nodes[neighbor_slot].neighbors(layer);
                    if current_neighbors.len() >= m_layer {
                        let neighbor_vec = match self.vectors.get(&neighbor) {
                            Some(v) => v.clone(),
                            None => continue,
                        };
                        let mut all: Vec<u64> = current_neighbors.to_vec();
                        all.push(label);
                        let scored: Vec<(u64, f32)> = all
                            .iter()
                            .map(|&l| (l, self.distance(&neighbor_vec, l)))
                            .collect();
                        let pruned = self.select_neighbors(&scored, m_layer);
                        prune_ops.push((
                            neighbor_slot,
                            layer,
                            pruned.iter().map(|&(l, _)| l).collect(),
                        ));
                    }
                }
            }

            if let Some(&(first, _)) = candidates.first() {
                current = first;
            }
        }

        let prune_targets: HashSet<(usize, usize)> = prune_ops
            .iter()
            .map(|&(slot, layer, _)| (slot, layer))
            .collect();
        for (slot, layer, neighbor) in reverse_edges {
            if !prune_targets.contains(&(slot, layer)) {
                self.nodes[slot].add_neighbor(layer, neighbor);
            }
        }
        for (slot, layer, new_neighbors) in prune_ops {
            if let Some(neighbors) = self.nodes[slot].neighbors_mut(layer) {
                neighbors.clear();
                neighbors.extend(new_neighbors);
            }
        }
    }

    /// Soft-delete. The label stays allocated and the node keeps routing
    /// traffic; searches will not return it. Returns false for labels
    /// this index has never seen.
    pub fn mark_deleted(&mut self, label: u64) -> bool {
        if !self.label_to_slot.contains_key(&label) {
            return false;
        }
        self.deleted.insert(label);
        true
    }

    /// k-NN by squared L2, ascending. Tombstoned labels are filtered;
    /// fewer than `k` pairs come back when the index is smaller.
    pub fn search_knn(&self, query: &[f32], k: usize) -> Vec<(f32, u64)> {
        if k == 0 || self.entry_point.is_none() || self.live_len() == 0 {
            return Vec::new();
        }

        let mut current = self.entry_point.unwrap_or_default();
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer, None).first()
            {
                current = nearest;
            }
        }

        // Tombstones occupy beam slots, so widen the beam when any exist.
        let ef = DEFAULT_EF_SEARCH.max(k);
        let beam = if self.deleted.is_empty() {
            ef
        } else {
            (ef * 2).max(k * 4)
        };

        self.search_layer(query, &[current], beam, 0, None)
            .into_iter()
            .filter(|(label, _)| !self.deleted.contains(label))
            .take(k)
            .map(|(label, dist)| (dist, label))
            .collect()
    }

    /// Beam search on one layer. Returns `(label, distance)` ascending.
    /// `exclude` drops one label from the results (the node currently
    /// being wired must not select itself).
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u64],
        ef: usize,
        layer: usize,
        exclude: Option<u64>,
    ) -> Vec<(u64, f32)> {
        let mut visited: HashSet<u64> = HashSet::with_capacity(ef * 4);
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Retained> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let dist = self.distance(query, ep);
                candidates.push(Candidate {
                    label: ep,
                    distance: dist,
                });
                if Some(ep) != exclude {
                    results.push(Retained {
                        label: ep,
                        distance: dist,
                    });
                }
            }
        }

        while let Some(current) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if current.distance > worst.distance && results.len() >= ef {
                    break;
                }
            }

            let node = match self.label_to_slot.get(&current.label) {
                Some(&slot) => &self.nodes[slot],
                None => continue,
            };
            for &neighbor in node.neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.distance(query, neighbor);
                let dominated = results.len() >= ef
                    && results.peek().map(|w| dist > w.distance).unwrap_or(false);
                if dominated {
                    continue;
                }
                candidates.push(Candidate {
                    label: neighbor,
                    distance: dist,
                });
                if Some(neighbor) != exclude {
                    results.push(Retained {
                        label: neighbor,
                        distance: dist,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u64, f32)> = results
            .into_iter()
            .map(|r| (r.label, r.distance))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-preserving neighbor selection: a candidate is kept only
    /// if it is closer to the query point than to any already-kept
    /// neighbor, then the remainder is filled by plain distance order.
    fn select_neighbors(&self, candidates: &[(u64, f32)], m: usize) -> Vec<(u64, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut sorted: Vec<(u64, f32)> = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut kept: Vec<(u64, f32)> = Vec::with_capacity(m);
        for &(candidate, dist) in &sorted {
            if kept.len() >= m {
                break;
            }
            let candidate_vec = match self.vectors.get(&candidate) {
                Some(v) => v,
                None => continue,
            };
            let diverse = kept.iter().all(|&(existing, _)| {
                self.vectors
                    .get(&existing)
                    .map(|ev| l2_squared(candidate_vec, ev) >= dist)
                    .unwrap_or(true)
            });
            if diverse {
                kept.push((candidate, dist));
            }
        }

        if kept.len() < m {
            for &(candidate, dist) in &sorted {
                if kept.len() >= m {
                    break;
                }
                if !kept.iter().any(|&(l, _)| l == candidate) {
                    kept.push((candidate, dist));
                }
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(dim: usize) -> HnswIndex {
        HnswIndex::with_seed(dim, 64, 0xC0FFEE)
    }

    fn basis(dim: usize, axis: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[axis % dim] = scale;
        v
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = seeded(4);
        assert!(index.search_knn(&[0.0; 4], 5).is_empty());
        assert_eq!(index.live_len(), 0);
    }

    #[test]
    fn single_point_roundtrip() {
        let mut index = seeded(3);
        index.add_point(&[0.1, 0.5, 0.2], 0).unwrap();

        let hits = index.search_knn(&[0.1, 0.5, 0.2], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 0);
        assert_eq!(hits[0].0, 0.0);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = seeded(3);
        let err = index.add_point(&[1.0, 2.0], 0).unwrap_err();
        assert!(matches!(
            err,
            DbError::DimensionMismatch {
                expected: 3,
                got: 2
            }
        ));
    }

    #[test]
    fn every_point_finds_itself() {
        let dim = 8;
        let mut index = seeded(dim);
        for i in 0..40u64 {
            let v = basis(dim, i as usize, 1.0 + i as f32 * 0.05);
            index.add_point(&v, i).unwrap();
        }
        for i in 0..40u64 {
            let v = basis(dim, i as usize, 1.0 + i as f32 * 0.05);
            let hits = index.search_knn(&v, 1);
            assert_eq!(hits[0].1, i, "point {i} should be its own nearest neighbor");
        }
    }

    #[test]
    fn results_ascend_by_distance() {
        let mut index = seeded(2);
        for i in 0..20u64 {
            index.add_point(&[i as f32, 0.0], i).unwrap();
        }
        let hits = index.search_knn(&[0.0, 0.0], 20);
        assert_eq!(hits.len(), 20);
        for pair in hits.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        assert_eq!(hits[0].1, 0);
    }

    #[test]
    fn k_larger_than_index() {
        let mut index = seeded(2);
        for i in 0..5u64 {
            index.add_point(&[i as f32, 1.0], i).unwrap();
        }
        assert_eq!(index.search_knn(&[0.0, 0.0], 100).len(), 5);
    }

    #[test]
    fn deleted_labels_never_returned() {
        let mut index = seeded(2);
        for i in 0..10u64 {
            index.add_point(&[i as f32, 0.0], i).unwrap();
        }
        assert!(index.mark_deleted(3));
        assert_eq!(index.live_len(), 9);

        // Querying the tombstoned vector directly still skips it.
        let hits = index.search_knn(&[3.0, 0.0], 10);
        assert!(hits.iter().all(|&(_, label)| label != 3));
        assert_eq!(hits.len(), 9);
    }

    #[test]
    fn delete_unknown_label_is_noop() {
        let mut index = seeded(2);
        assert!(!index.mark_deleted(42));
    }

    #[test]
    fn delete_all_points_returns_empty() {
        let mut index = seeded(2);
        for i in 0..4u64 {
            index.add_point(&[i as f32, 0.0], i).unwrap();
        }
        for i in 0..4u64 {
            index.mark_deleted(i);
        }
        assert!(index.search_knn(&[0.0, 0.0], 4).is_empty());
    }

    #[test]
    fn overwrite_moves_the_point() {
        let mut index = seeded(3);
        index.add_point(&[1.0, 0.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 0.0, 9.0], 1).unwrap();

        // Move label 0 to a new position; same label, new vector.
        index.add_point(&[0.0, 1.0, 0.0], 0).unwrap();

        let hits = index.search_knn(&[0.0, 1.0, 0.0], 1);
        assert_eq!(hits[0].1, 0);
        assert_eq!(hits[0].0, 0.0);

        // The old position no longer matches exactly.
        let old = index.search_knn(&[1.0, 0.0, 0.0], 1);
        assert!(old[0].0 > 0.0);
        assert_eq!(index.live_len(), 2);
    }

    #[test]
    fn overwrite_revives_tombstone() {
        let mut index = seeded(2);
        index.add_point(&[1.0, 1.0], 0).unwrap();
        index.mark_deleted(0);
        assert!(index.search_knn(&[1.0, 1.0], 1).is_empty());

        index.add_point(&[2.0, 2.0], 0).unwrap();
        let hits = index.search_knn(&[2.0, 2.0], 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, 0);
    }

    #[test]
    fn recall_on_clustered_data() {
        let dim = 16;
        let mut rng = StdRng::seed_from_u64(7);
        let mut index = seeded(dim);
        let mut points: Vec<Vec<f32>> = Vec::new();
        for i in 0..300u64 {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
            index.add_point(&v, i).unwrap();
            points.push(v);
        }

        let mut hits_at_1 = 0;
        for (i, v) in points.iter().enumerate() {
            let found = index.search_knn(v, 1);
            if found.first().map(|&(_, l)| l) == Some(i as u64) {
                hits_at_1 += 1;
            }
        }
        // Exact-match self-recall should be essentially perfect at this size.
        assert!(hits_at_1 >= 295, "self-recall too low: {hits_at_1}/300");
    }
}
