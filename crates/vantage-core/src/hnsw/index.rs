//! HNSW graph: insertion and search
//!
//! **Insert**: sample a top layer from the exponential distribution, descend
//! greedily from the entry point to that layer, then on each layer below run
//! a beam search of width `ef_construction`, pick diverse neighbors with the
//! pruning heuristic, and wire edges in both directions.
//!
//! **Search**: greedy descent from the entry point to layer 1, then a beam
//! search of width `max(ef, k)` on layer 0 with two heaps: a min-heap
//! frontier and a max-heap of the best candidates so far. Terminates when
//! the nearest frontier entry is farther than the worst kept candidate.
//!
//! Layer assignment draws from a seeded [`StdRng`], so a fixed seed, insert
//! order, and parameter set reproduce the graph exactly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use super::visited::VisitedGuard;
use super::VectorSource;
use crate::format::Metric;
use crate::simd::kernel;

/// Frontier entry. Ordered so that `BinaryHeap` pops the *closest* first.
#[derive(Clone, Copy)]
struct Candidate {
    id: u32,
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

/// Kept-result entry. Max-heap: the peek is the current worst.
#[derive(Clone, Copy)]
struct Hit {
    id: u32,
    distance: f32,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Hit {}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Multi-layer proximity graph over dense vector ids.
#[derive(Clone)]
pub struct Hnsw {
    /// Adjacency records, indexed by vector id.
    pub(crate) nodes: Vec<Node>,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_layer: usize,
    /// Max neighbors per node above layer 0.
    pub(crate) m: usize,
    /// Max neighbors at layer 0 (2·M).
    pub(crate) m0: usize,
    /// Level multiplier `1 / ln(M)` for layer sampling.
    pub(crate) ml: f64,
    pub(crate) ef_construction: usize,
    pub(crate) metric: Metric,
    rng: StdRng,
}

impl Hnsw {
    pub fn new(m: usize, ef_construction: usize, metric: Metric, seed: u64) -> Self {
        assert!(m >= 2, "hnsw m must be at least 2");
        Self {
            nodes: Vec::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction,
            metric,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild from deserialized parts. `rng_seed` should already encode the
    /// node count so identical histories keep sampling identical layers.
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        entry_point: Option<u32>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ml: f64,
        ef_construction: usize,
        metric: Metric,
        rng_seed: u64,
    ) -> Self {
        Self {
            nodes,
            entry_point,
            max_layer,
            m,
            m0,
            ml,
            ef_construction,
            metric,
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    #[inline]
    pub fn max_layer(&self) -> usize {
        self.max_layer
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Neighbor list capacity at `layer`.
    #[inline]
    fn layer_capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Draw a top layer: `⌊-ln(U(0,1)) · mₗ⌋`.
    fn sample_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        (-r.ln() * self.ml).floor() as usize
    }

    #[inline]
    fn distance<S: VectorSource + ?Sized>(&self, vectors: &S, query: &[f32], id: u32) -> f32 {
        kernel().distance(self.metric, query, vectors.vector(id))
    }

    /// Link vector `id` into the graph. Ids must arrive dense and in order;
    /// the arena guarantees this by assigning them.
    pub fn insert<S: VectorSource + ?Sized>(&mut self, vectors: &S, id: u32) {
        debug_assert_eq!(id as usize, self.nodes.len(), "ids must be dense");
        let top = self.sample_layer();

        let Some(entry) = self.entry_point else {
            self.nodes.push(Node::new(top));
            self.entry_point = Some(id);
            self.max_layer = top;
            return;
        };
        self.nodes.push(Node::new(top));

        let query = vectors.vector(id);
        let mut ep = entry;

        // Zoom in through the layers above the new node's top layer.
        for layer in (top + 1..=self.max_layer).rev() {
            ep = self.greedy_descend(vectors, query, ep, layer);
        }

        // Wire the node into every layer it lives on.
        for layer in (0..=top.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(vectors, query, ep, self.ef_construction, layer, None);
            let cap = self.layer_capacity(layer);
            let selected = self.select_diverse(vectors, query, &candidates, cap);

            *self.nodes[id as usize].neighbors_mut(layer) =
                selected.iter().map(|&(n, _)| n).collect();

            for &(neighbor, _) in &selected {
                self.nodes[neighbor as usize].add_neighbor(layer, id);
                if self.nodes[neighbor as usize].neighbors(layer).len() > cap {
                    self.prune_neighbors(vectors, neighbor, layer, cap);
                }
            }

            if let Some(&(closest, _)) = selected.first() {
                ep = closest;
            }
        }

        if top > self.max_layer {
            self.max_layer = top;
            self.entry_point = Some(id);
        }
    }

    /// Record `id` as an isolated node: present in the id space, absent from
    /// the topology. Used when rebuilding a graph around tombstoned ids; the
    /// layer draw still happens so the RNG stream matches a full build.
    pub fn insert_unlinked(&mut self, id: u32) {
        debug_assert_eq!(id as usize, self.nodes.len(), "ids must be dense");
        let _ = self.sample_layer();
        self.nodes.push(Node::new(0));
    }

    /// Top-k nearest to `query`. `emit` gates which ids may appear in the
    /// result; gated-out nodes (tombstones, filtered ids) are still
    /// traversed, since their edges remain valid topology.
    pub fn search<S: VectorSource + ?Sized, F: Fn(u32) -> bool>(
        &self,
        vectors: &S,
        query: &[f32],
        k: usize,
        ef: usize,
        emit: F,
    ) -> Vec<(u32, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut ep = entry;
        for layer in (1..=self.max_layer).rev() {
            ep = self.greedy_descend(vectors, query, ep, layer);
        }

        let emit: &dyn Fn(u32) -> bool = &emit;
        let mut hits = self.search_layer(vectors, query, ep, ef.max(k), 0, Some(emit));
        hits.truncate(k);
        hits
    }

    /// Move greedily toward `query` along `layer` edges until no neighbor
    /// improves on the current position.
    fn greedy_descend<S: VectorSource + ?Sized>(
        &self,
        vectors: &S,
        query: &[f32],
        start: u32,
        layer: usize,
    ) -> u32 {
        let mut current = start;
        let mut best = self.distance(vectors, query, current);
        loop {
            let mut improved = false;
            for &neighbor in self.nodes[current as usize].neighbors(layer) {
                let d = self.distance(vectors, query, neighbor);
                if d < best {
                    best = d;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer, returning up to `ef` candidates sorted
    /// ascending by distance. With an `emit` gate, gated-out nodes are
    /// explored but never kept.
    fn search_layer<S: VectorSource + ?Sized>(
        &self,
        vectors: &S,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
        emit: Option<&dyn Fn(u32) -> bool>,
    ) -> Vec<(u32, f32)> {
        let mut visited = VisitedGuard::acquire(self.nodes.len());
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef + 1);
        let mut best: BinaryHeap<Hit> = BinaryHeap::with_capacity(ef + 1);

        let entry_dist = self.distance(vectors, query, entry);
        visited.mark(entry);
        frontier.push(Candidate {
            id: entry,
            distance: entry_dist,
        });
        if emit.map_or(true, |f| f(entry)) {
            best.push(Hit {
                id: entry,
                distance: entry_dist,
            });
        }

        while let Some(current) = frontier.pop() {
            if best.len() >= ef {
                if let Some(worst) = best.peek() {
                    if current.distance > worst.distance {
                        break;
                    }
                }
            }

            for &neighbor in self.nodes[current.id as usize].neighbors(layer) {
                if visited.seen(neighbor) {
                    continue;
                }
                visited.mark(neighbor);

                let d = self.distance(vectors, query, neighbor);
                let admit = best.len() < ef || best.peek().map_or(true, |w| d < w.distance);
                if admit {
                    frontier.push(Candidate {
                        id: neighbor,
                        distance: d,
                    });
                    if emit.map_or(true, |f| f(neighbor)) {
                        best.push(Hit {
                            id: neighbor,
                            distance: d,
                        });
                        if best.len() > ef {
                            best.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = best.into_iter().map(|h| (h.id, h.distance)).collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        out
    }

    /// Diversity-preserving neighbor selection over candidates sorted
    /// ascending by distance to `query`: keep a candidate only if it is
    /// closer to the query than to everything already kept. This spreads
    /// neighbors across directions instead of clustering them, which is what
    /// sustains recall at high dimension.
    fn select_diverse<S: VectorSource + ?Sized>(
        &self,
        vectors: &S,
        query: &[f32],
        candidates: &[(u32, f32)],
        target: usize,
    ) -> Vec<(u32, f32)> {
        let mut selected: Vec<(u32, f32)> = Vec::with_capacity(target);
        for &(candidate, dist_to_query) in candidates {
            if selected.len() == target {
                break;
            }
            let candidate_vec = vectors.vector(candidate);
            let diverse = selected
                .iter()
                .all(|&(kept, _)| self.distance(vectors, candidate_vec, kept) > dist_to_query);
            if diverse {
                selected.push((candidate, dist_to_query));
            }
        }
        selected
    }

    /// Re-select a node's neighbor list after a backlink pushed it over
    /// capacity.
    fn prune_neighbors<S: VectorSource + ?Sized>(
        &mut self,
        vectors: &S,
        node: u32,
        layer: usize,
        cap: usize,
    ) {
        let base = vectors.vector(node);
        let mut scored: Vec<(u32, f32)> = self.nodes[node as usize]
            .neighbors(layer)
            .iter()
            .map(|&n| (n, self.distance(vectors, base, n)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let kept = self.select_diverse(vectors, base, &scored, cap);
        let list = self.nodes[node as usize].neighbors_mut(layer);
        list.clear();
        list.extend(kept.into_iter().map(|(n, _)| n));
    }

    /// Structural statistics, surfaced through `Database::stats`.
    pub fn stats(&self) -> GraphStats {
        let mut layer_counts = vec![0usize; self.max_layer + 1];
        let mut edges = 0usize;

        for node in &self.nodes {
            for (layer, neighbors) in node.layers.iter().enumerate() {
                if layer < layer_counts.len() {
                    layer_counts[layer] += 1;
                }
                edges += neighbors.len();
            }
        }

        GraphStats {
            nodes: self.nodes.len(),
            max_layer: self.max_layer,
            layer_counts,
            edges,
        }
    }

    /// Neighbors of `id` at `layer` (empty above the node's top layer).
    pub fn neighbors(&self, id: u32, layer: usize) -> &[u32] {
        self.nodes[id as usize].neighbors(layer)
    }

    /// Top layer of `id`.
    pub fn top_layer(&self, id: u32) -> usize {
        self.nodes[id as usize].top_layer()
    }
}

/// Structural statistics about a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes: usize,
    pub max_layer: usize,
    /// How many nodes live on each layer.
    pub layer_counts: Vec<usize>,
    /// Total directed edges across all layers.
    pub edges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::l2_normalized;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
                l2_normalized(&v)
            })
            .collect()
    }

    fn build(vectors: &Vec<Vec<f32>>, metric: Metric, seed: u64) -> Hnsw {
        let mut hnsw = Hnsw::new(16, 100, metric, seed);
        for id in 0..vectors.len() {
            hnsw.insert(vectors, id as u32);
        }
        hnsw
    }

    #[test]
    fn empty_graph_returns_nothing() {
        let vectors: Vec<Vec<f32>> = Vec::new();
        let hnsw = Hnsw::new(16, 100, Metric::L2, 0);
        assert!(hnsw
            .search(&vectors, &[0.0; 8], 5, 50, |_| true)
            .is_empty());
    }

    #[test]
    fn single_node_becomes_entry_point() {
        let vectors = random_vectors(1, 32, 1);
        let hnsw = build(&vectors, Metric::Cosine, 7);
        assert_eq!(hnsw.entry_point(), Some(0));

        let results = hnsw.search(&vectors, &vectors[0], 1, 10, |_| true);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1.abs() < 1e-5);
    }

    #[test]
    fn exact_vector_is_top_hit() {
        let vectors = random_vectors(200, 64, 2);
        let hnsw = build(&vectors, Metric::Cosine, 7);

        for probe in [0u32, 57, 121, 199] {
            let results = hnsw.search(&vectors, &vectors[probe as usize], 1, 64, |_| true);
            assert_eq!(results[0].0, probe, "query for {probe}");
            assert!(results[0].1 < 1e-5);
        }
    }

    #[test]
    fn results_sorted_ascending_and_truncated_to_k() {
        let vectors = random_vectors(300, 32, 3);
        let hnsw = build(&vectors, Metric::L2, 11);

        let results = hnsw.search(&vectors, &vectors[42], 10, 50, |_| true);
        assert_eq!(results.len(), 10);
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn k_larger_than_graph_returns_everything() {
        let vectors = random_vectors(5, 16, 4);
        let hnsw = build(&vectors, Metric::L2, 0);
        let results = hnsw.search(&vectors, &vectors[0], 100, 50, |_| true);
        assert_eq!(results.len(), 5);
    }

    #[test]
    fn adjacency_respects_layer_capacity() {
        let vectors = random_vectors(500, 24, 5);
        let hnsw = build(&vectors, Metric::Cosine, 3);

        for id in 0..500u32 {
            for layer in 0..=hnsw.top_layer(id) {
                let cap = if layer == 0 { hnsw.m0 } else { hnsw.m };
                assert!(
                    hnsw.neighbors(id, layer).len() <= cap,
                    "node {id} layer {layer} over capacity"
                );
            }
        }
    }

    #[test]
    fn entry_point_is_on_the_highest_layer() {
        let vectors = random_vectors(400, 16, 6);
        let hnsw = build(&vectors, Metric::L2, 9);
        let entry = hnsw.entry_point().unwrap();
        for id in 0..400u32 {
            assert!(hnsw.top_layer(id) <= hnsw.top_layer(entry));
        }
        assert_eq!(hnsw.top_layer(entry), hnsw.max_layer());
    }

    #[test]
    fn every_node_reachable_on_layer_zero() {
        let vectors = random_vectors(300, 16, 7);
        let hnsw = build(&vectors, Metric::Cosine, 13);

        let mut seen = vec![false; 300];
        let mut stack = vec![hnsw.entry_point().unwrap()];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id as usize], true) {
                continue;
            }
            stack.extend(hnsw.neighbors(id, 0).iter().copied());
        }
        let reached = seen.iter().filter(|&&s| s).count();
        assert_eq!(reached, 300, "layer-0 graph is disconnected");
    }

    #[test]
    fn emit_gate_suppresses_results_but_not_traversal() {
        let vectors = random_vectors(100, 32, 8);
        let hnsw = build(&vectors, Metric::Cosine, 5);

        let results = hnsw.search(&vectors, &vectors[42], 5, 100, |id| id % 2 == 0);
        assert!(!results.is_empty());
        for (id, _) in &results {
            assert_eq!(id % 2, 0);
        }
        assert_eq!(results[0].0, 42);
    }

    #[test]
    fn emit_gate_rejecting_everything_yields_empty() {
        let vectors = random_vectors(50, 16, 9);
        let hnsw = build(&vectors, Metric::L2, 5);
        let results = hnsw.search(&vectors, &vectors[0], 5, 50, |_| false);
        assert!(results.is_empty());
    }

    #[test]
    fn same_seed_builds_identical_graphs() {
        let vectors = random_vectors(200, 16, 10);
        let a = build(&vectors, Metric::Cosine, 77);
        let b = build(&vectors, Metric::Cosine, 77);

        assert_eq!(a.entry_point(), b.entry_point());
        assert_eq!(a.max_layer(), b.max_layer());
        assert_eq!(a.nodes, b.nodes);
    }

    #[test]
    fn different_seeds_usually_differ() {
        let vectors = random_vectors(200, 16, 10);
        let a = build(&vectors, Metric::Cosine, 1);
        let b = build(&vectors, Metric::Cosine, 2);
        assert_ne!(a.nodes, b.nodes);
    }

    #[test]
    fn unlinked_nodes_are_never_returned() {
        let vectors = random_vectors(60, 16, 11);
        let mut hnsw = Hnsw::new(16, 100, Metric::Cosine, 5);
        for id in 0..60u32 {
            if id == 30 {
                hnsw.insert_unlinked(id);
            } else {
                hnsw.insert(&vectors, id);
            }
        }

        let results = hnsw.search(&vectors, &vectors[30], 60, 100, |_| true);
        assert!(results.iter().all(|&(id, _)| id != 30));
        assert_eq!(results.len(), 59);
    }

    #[test]
    fn recall_floor_on_random_data() {
        let vectors = random_vectors(1000, 64, 12);
        let hnsw = build(&vectors, Metric::Cosine, 21);
        let k = 10;

        let queries = random_vectors(20, 64, 99);
        let mut total_recall = 0.0;
        for query in &queries {
            let mut truth: Vec<(u32, f32)> = (0..1000u32)
                .map(|id| {
                    (
                        id,
                        kernel().distance(Metric::Cosine, query, &vectors[id as usize]),
                    )
                })
                .collect();
            truth.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            let truth_ids: std::collections::HashSet<u32> =
                truth.iter().take(k).map(|&(id, _)| id).collect();

            let got = hnsw.search(&vectors, query, k, 100, |_| true);
            let got_ids: std::collections::HashSet<u32> =
                got.iter().map(|&(id, _)| id).collect();

            total_recall += truth_ids.intersection(&got_ids).count() as f64 / k as f64;
        }

        let recall = total_recall / queries.len() as f64;
        assert!(recall > 0.85, "recall@{k} too low: {recall:.3}");
    }

    #[test]
    fn stats_reflect_structure() {
        let vectors = random_vectors(150, 16, 13);
        let hnsw = build(&vectors, Metric::L2, 1);
        let stats = hnsw.stats();
        assert_eq!(stats.nodes, 150);
        assert_eq!(stats.layer_counts[0], 150);
        assert!(stats.edges > 0);
        assert_eq!(stats.max_layer, hnsw.max_layer());
    }
}
