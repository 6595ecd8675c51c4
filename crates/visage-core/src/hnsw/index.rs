//! The HNSW graph.
//!
//! Storage is slot-indexed and layer-major: inserting a label appends a
//! *slot* (a dense `u32` index), and each layer of the hierarchy keeps one
//! adjacency list per slot. Labels only exist at the API boundary — all
//! traversal runs on slots, which keeps the hot loops on small integers and
//! lets the serializer write the topology column by column.
//!
//! ```text
//! labels:  [17, 4, 99, ...]          slot → caller label
//! peak:    [ 0, 2,  0, ...]          slot → highest layer occupied
//! graph:   layer 0: [[1,2], [0], [0], ...]   (dense, every slot)
//!          layer 1: [[],    [..], [], ...]   (lists empty off-peak)
//! ```
//!
//! **Insert**: assign a random peak layer, hill-climb down to peak+1, then
//! per layer run a beam search, keep a coverage-pruned neighbor set, and
//! wire both directions immediately — a back edge that overflows a slot's
//! degree cap triggers an in-place re-selection of that slot's
//! neighborhood.
//!
//! **Search**: hill-climb the sparse layers with beam width 1, then beam
//! the base layer with `ef` candidates.
//!
//! Distances are squared L2 end to end; callers convert at their boundary.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use super::visited::VisitedGuard;
use crate::simd::l2_distance_squared;

/// Peaks are serialized as u8; the exponential layer assignment makes
/// anything above single digits astronomically rare, the clamp just bounds
/// the table.
const PEAK_LIMIT: usize = 31;

/// A slot with its squared distance to the current query.
#[derive(Clone, Copy, Debug)]
struct Scored {
    slot: u32,
    d2: f32,
}

/// Type-erased vector accessor: label → descriptor.
type VectorAccessor = Box<dyn Fn(usize) -> Vec<f32> + Send + Sync>;

/// HNSW index over squared-L2 distance.
pub struct Hnsw {
    /// slot → caller label, insertion order.
    labels: Vec<usize>,
    /// label → slot.
    slot_of: HashMap<usize, u32>,
    /// slot → highest layer the slot occupies.
    peak: Vec<u8>,
    /// `graph[layer][slot]` → neighbor slots. Every layer is dense over
    /// slots; a slot above its peak just has an empty list.
    graph: Vec<Vec<Vec<u32>>>,
    /// Slot on the highest occupied layer.
    entry_slot: Option<u32>,

    /// Degree cap per upper layer (layer 0 gets 2·M).
    m: usize,
    /// Beam width during construction.
    ef_construction: usize,
    /// Layer assignment multiplier, 1/ln(M).
    ml: f64,

    vectors: VectorAccessor,
    rng: StdRng,
}

impl Hnsw {
    /// Create an empty index.
    ///
    /// - `m`: degree cap per upper layer (typically 12–48; layer 0 doubles it)
    /// - `ef_construction`: beam width while building (typically 100–200)
    /// - `vector_fn`: resolves a label to its descriptor
    pub fn new<F>(m: usize, ef_construction: usize, vector_fn: F) -> Self
    where
        F: Fn(usize) -> Vec<f32> + Send + Sync + 'static,
    {
        Self::with_seed(m, ef_construction, vector_fn, rand::random())
    }

    /// Create an empty index with a deterministic layer-assignment seed.
    pub fn with_seed<F>(m: usize, ef_construction: usize, vector_fn: F, seed: u64) -> Self
    where
        F: Fn(usize) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            labels: Vec::new(),
            slot_of: HashMap::new(),
            peak: Vec::new(),
            graph: Vec::new(),
            entry_slot: None,
            m: m.max(2),
            ef_construction: ef_construction.max(1),
            ml: 1.0 / (m.max(2) as f64).ln(),
            vectors: Box::new(vector_fn),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reassemble an index from deserialized columns. `slot_of` is derived;
    /// the caller guarantees the graph refers only to valid slots.
    pub(super) fn from_columns<F>(
        labels: Vec<usize>,
        peak: Vec<u8>,
        graph: Vec<Vec<Vec<u32>>>,
        entry_slot: Option<u32>,
        m: usize,
        ef_construction: usize,
        vector_fn: F,
    ) -> Self
    where
        F: Fn(usize) -> Vec<f32> + Send + Sync + 'static,
    {
        let slot_of = labels
            .iter()
            .enumerate()
            .map(|(slot, &label)| (label, slot as u32))
            .collect();

        Self {
            labels,
            slot_of,
            peak,
            graph,
            entry_slot,
            m,
            ef_construction,
            ml: 1.0 / (m.max(2) as f64).ln(),
            vectors: Box::new(vector_fn),
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    pub(super) fn columns(&self) -> (&[usize], &[u8], &[Vec<Vec<u32>>], Option<u32>) {
        (&self.labels, &self.peak, &self.graph, self.entry_slot)
    }

    pub(super) fn params(&self) -> (usize, usize) {
        (self.m, self.ef_construction)
    }

    /// Number of points physically in the graph (the graph itself has no
    /// notion of deletion; owners mask labels).
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    fn vector_of(&self, slot: u32) -> Vec<f32> {
        (self.vectors)(self.labels[slot as usize])
    }

    #[inline]
    fn distance_to_slot(&self, query: &[f32], slot: u32) -> f32 {
        l2_distance_squared(query, &self.vector_of(slot))
    }

    #[inline]
    fn degree_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }

    fn random_peak(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        ((-r.ln() * self.ml).floor() as usize).min(PEAK_LIMIT)
    }

    /// Append a slot for `label`, growing every layer's dense column.
    fn alloc_slot(&mut self, label: usize, peak: usize) -> u32 {
        let slot = self.labels.len() as u32;
        self.labels.push(label);
        self.peak.push(peak as u8);
        self.slot_of.insert(label, slot);

        while self.graph.len() <= peak {
            self.graph.push(Vec::new());
        }
        let width = self.labels.len();
        for layer in &mut self.graph {
            layer.resize_with(width, Vec::new);
        }
        slot
    }

    /// Insert a labeled point. The accessor must already resolve `label`.
    /// Re-inserting a known label is a no-op; owners replace points by
    /// allocating a fresh label and masking the old one.
    pub fn insert(&mut self, label: usize) {
        if self.slot_of.contains_key(&label) {
            return;
        }
        let peak = self.random_peak();

        let Some(mut cursor) = self.entry_slot else {
            let slot = self.alloc_slot(label, peak);
            self.entry_slot = Some(slot);
            return;
        };

        let old_top = self.graph.len() - 1;
        let slot = self.alloc_slot(label, peak);
        let query = self.vector_of(slot);

        // Zoom: hill-climb the layers above this point's peak.
        for layer in ((peak + 1)..=old_top).rev() {
            cursor = self.closest_on_layer(&query, cursor, layer);
        }

        // Wire: beam each occupied layer top-down, connecting immediately.
        // The beam on a lower layer already sees the edges wired above it.
        for layer in (0..=peak.min(old_top)).rev() {
            let found = self.beam(&query, cursor, self.ef_construction, layer);
            if let Some(best) = found.first() {
                cursor = best.slot;
            }

            let cap = self.degree_cap(layer);
            let chosen = self.prune_by_coverage(found, cap);
            let forward: Vec<u32> = chosen.iter().map(|c| c.slot).collect();
            for &neighbor in &forward {
                self.attach_back_edge(layer, neighbor, slot);
            }
            self.graph[layer][slot as usize] = forward;
        }

        if peak > old_top {
            self.entry_slot = Some(slot);
        }
    }

    /// Add `slot` to `from`'s adjacency; on overflow re-select `from`'s
    /// neighborhood around its own vector.
    fn attach_back_edge(&mut self, layer: usize, from: u32, slot: u32) {
        let cap = self.degree_cap(layer);
        {
            let links = &mut self.graph[layer][from as usize];
            if links.contains(&slot) {
                return;
            }
            links.push(slot);
            if links.len() <= cap {
                return;
            }
        }

        let anchor = self.vector_of(from);
        let scored: Vec<Scored> = self.graph[layer][from as usize]
            .iter()
            .map(|&s| Scored {
                slot: s,
                d2: l2_distance_squared(&anchor, &self.vector_of(s)),
            })
            .collect();
        let kept = self.prune_by_coverage(scored, cap);
        self.graph[layer][from as usize] = kept.into_iter().map(|s| s.slot).collect();
    }

    /// Greedy hill-climb on one layer: jump to the best neighbor until no
    /// neighbor improves. Used for the zoom phase, where beam width 1 is
    /// all that's needed.
    fn closest_on_layer(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut cursor = start;
        let mut best = self.distance_to_slot(query, cursor);

        loop {
            let mut next = cursor;
            let mut next_d2 = best;
            for &neighbor in &self.graph[layer][cursor as usize] {
                let d2 = self.distance_to_slot(query, neighbor);
                if d2 < next_d2 {
                    next_d2 = d2;
                    next = neighbor;
                }
            }
            if next == cursor {
                return cursor;
            }
            cursor = next;
            best = next_d2;
        }
    }

    /// Beam search on one layer: up to `width` slots, ascending d².
    ///
    /// The frontier heap orders on the raw f32 bit pattern — for the
    /// non-negative distances produced here, IEEE-754 bits sort identically
    /// to the values, so no float-ordering wrapper is needed. The result
    /// pool is a sorted vec; its tail is the eviction candidate.
    fn beam(&self, query: &[f32], entry: u32, width: usize, layer: usize) -> Vec<Scored> {
        let width = width.max(1);
        let mut visited = VisitedGuard::acquire(self.labels.len());
        let mut frontier: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::new();
        let mut found: Vec<Scored> = Vec::with_capacity(width + 1);

        let entry_d2 = self.distance_to_slot(query, entry);
        visited.visit(entry as usize);
        frontier.push(Reverse((entry_d2.to_bits(), entry)));
        found.push(Scored {
            slot: entry,
            d2: entry_d2,
        });

        while let Some(Reverse((bits, slot))) = frontier.pop() {
            let d2 = f32::from_bits(bits);
            if found.len() >= width && d2 > found[found.len() - 1].d2 {
                break;
            }

            for &neighbor in &self.graph[layer][slot as usize] {
                if visited.is_visited(neighbor as usize) {
                    continue;
                }
                visited.visit(neighbor as usize);

                let nd2 = self.distance_to_slot(query, neighbor);
                if found.len() >= width && nd2 >= found[found.len() - 1].d2 {
                    continue;
                }

                frontier.push(Reverse((nd2.to_bits(), neighbor)));
                let at = found.partition_point(|s| s.d2 <= nd2);
                found.insert(at, Scored { slot: neighbor, d2: nd2 });
                found.truncate(width);
            }
        }

        found
    }

    /// Keep up to `cap` candidates, preferring directional coverage: a
    /// candidate closer to an already-kept neighbor than to the anchor is
    /// redundant in that direction. Nearest rejects fill any shortfall.
    fn prune_by_coverage(&self, mut candidates: Vec<Scored>, cap: usize) -> Vec<Scored> {
        if candidates.len() <= cap {
            return candidates;
        }
        candidates.sort_by(|a, b| a.d2.total_cmp(&b.d2));

        let mut kept: Vec<Scored> = Vec::with_capacity(cap);
        let mut spill: Vec<Scored> = Vec::new();

        for candidate in candidates {
            if kept.len() == cap {
                break;
            }
            let candidate_vec = self.vector_of(candidate.slot);
            let covered = kept.iter().any(|k| {
                l2_distance_squared(&candidate_vec, &self.vector_of(k.slot)) < candidate.d2
            });
            if covered {
                spill.push(candidate);
            } else {
                kept.push(candidate);
            }
        }

        for candidate in spill {
            if kept.len() == cap {
                break;
            }
            kept.push(candidate);
        }
        kept
    }

    /// k-nearest-neighbor search.
    ///
    /// Returns up to `k` (label, d²) pairs sorted by ascending squared
    /// distance. `ef` is the base-layer beam width; it is clamped up to `k`.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(usize, f32)> {
        let Some(entry) = self.entry_slot else {
            return Vec::new();
        };

        let mut cursor = entry;
        for layer in (1..self.graph.len()).rev() {
            cursor = self.closest_on_layer(query, cursor, layer);
        }

        self.beam(query, cursor, ef.max(k), 0)
            .into_iter()
            .take(k)
            .map(|s| (self.labels[s.slot as usize], s.d2))
            .collect()
    }

    /// k-NN search with a label predicate.
    ///
    /// Traverses the graph normally but only emits labels accepted by the
    /// predicate. The base-layer beam over-fetches (ef × 2, at least k × 4)
    /// to compensate for rejected candidates — the caller masks logically
    /// deleted labels this way without mutating the graph.
    pub fn search_filtered<P>(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        predicate: P,
    ) -> Vec<(usize, f32)>
    where
        P: Fn(usize) -> bool,
    {
        let Some(entry) = self.entry_slot else {
            return Vec::new();
        };

        // The descent stays unfiltered: masked hub slots still route.
        let mut cursor = entry;
        for layer in (1..self.graph.len()).rev() {
            cursor = self.closest_on_layer(query, cursor, layer);
        }

        let over_fetch = (ef * 2).max(k * 4);
        self.beam(query, cursor, over_fetch, 0)
            .into_iter()
            .map(|s| (self.labels[s.slot as usize], s.d2))
            .filter(|(label, _)| predicate(*label))
            .take(k)
            .collect()
    }

    pub fn stats(&self) -> HnswStats {
        let layer_counts = (0..self.graph.len())
            .map(|layer| {
                self.peak
                    .iter()
                    .filter(|&&p| p as usize >= layer)
                    .count()
            })
            .collect();
        let total_edges = self
            .graph
            .iter()
            .flat_map(|layer| layer.iter())
            .map(|links| links.len())
            .sum();

        HnswStats {
            num_nodes: self.labels.len(),
            max_layer: self.graph.len().saturating_sub(1),
            layer_counts,
            total_edges,
            m: self.m,
            ef_construction: self.ef_construction,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HnswStats {
    pub num_nodes: usize,
    pub max_layer: usize,
    pub layer_counts: Vec<usize>,
    pub total_edges: usize,
    pub m: usize,
    pub ef_construction: usize,
}
