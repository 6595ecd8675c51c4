//! The face index: HNSW over 128-D descriptors with user bookkeeping,
//! logical deletion, and crash-safe persistence.
//!
//! Labels are index-local, allocated monotonically, and never reused. A
//! deleted or replaced label stays physically in the graph but loses its
//! `label → meta` row, which masks it from every search until a rebuild
//! discards the garbage.
//!
//! Concurrency is the caller's concern: the service wraps `FaceIndex` in a
//! `parking_lot::RwLock` — searches share the read lock, mutations take the
//! write lock, so a search can never observe a half-inserted point.
//!
//! Distances: the graph computes squared L2; everything leaving [`search`]
//! is Euclidean. `similarity = round((1 − distance) × 100)`.
//!
//! [`search`]: FaceIndex::search

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use visage_core::{read_container, write_container, Hnsw};

use crate::config::IndexParams;
use crate::error::RecognitionError;
use crate::store::UserRecord;

/// Identity attached to a live label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexUserMeta {
    #[serde(rename = "userId")]
    pub user_id: u64,
    #[serde(rename = "externalId")]
    pub external_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "clientRef")]
    pub client_ref: String,
}

impl From<&UserRecord> for IndexUserMeta {
    fn from(user: &UserRecord) -> Self {
        Self {
            user_id: user.user_id,
            external_id: user.external_id.clone(),
            display_name: user.display_name.clone(),
            client_ref: user.client_ref.clone(),
        }
    }
}

/// One search result, Euclidean distance, ascending order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "userId")]
    pub user_id: u64,
    #[serde(rename = "externalId")]
    pub external_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "clientRef")]
    pub client_ref: String,
    pub distance: f32,
    pub similarity: i32,
}

/// Sidecar metadata file layout.
#[derive(Serialize, Deserialize)]
struct IndexMeta {
    #[serde(rename = "nextLabel")]
    next_label: u64,
    #[serde(rename = "lastRebuildAt")]
    last_rebuild_at: Option<DateTime<Utc>>,
    #[serde(rename = "idMap")]
    id_map: Vec<(u64, IndexUserMeta)>,
    #[serde(rename = "reverseIdMap")]
    reverse_id_map: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub live_vectors: u64,
    pub physical_vectors: u64,
    pub masked_vectors: u64,
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_elements: u64,
    pub last_rebuild_at: Option<DateTime<Utc>>,
}

/// Shared descriptor table: label → descriptor. The graph's accessor holds
/// a clone of the Arc, so the table must never be swapped out from under a
/// live graph — mutate in place only.
type VectorTable = Arc<RwLock<Vec<Vec<f32>>>>;

pub struct FaceIndex {
    params: IndexParams,
    persist_every: u32,
    index_path: PathBuf,
    meta_path: PathBuf,

    graph: Option<Hnsw>,
    vectors: VectorTable,
    label_to_meta: HashMap<u64, IndexUserMeta>,
    user_to_label: HashMap<u64, u64>,
    next_label: u64,
    total_vectors: u64,
    last_rebuild_at: Option<DateTime<Utc>>,
    adds_since_persist: u32,
}

impl FaceIndex {
    pub fn new(
        params: IndexParams,
        persist_every: u32,
        index_path: PathBuf,
        meta_path: PathBuf,
    ) -> Self {
        Self {
            params,
            persist_every,
            index_path,
            meta_path,
            graph: None,
            vectors: Arc::new(RwLock::new(Vec::new())),
            label_to_meta: HashMap::new(),
            user_to_label: HashMap::new(),
            next_label: 0,
            total_vectors: 0,
            last_rebuild_at: None,
            adds_since_persist: 0,
        }
    }

    fn make_accessor(
        table: VectorTable,
        dim: usize,
    ) -> impl Fn(usize) -> Vec<f32> + Send + Sync + 'static {
        move |label: usize| {
            let guard = table.read();
            if let Some(vector) = guard.get(label) {
                vector.clone()
            } else {
                error!("descriptor table has no row for label {}", label);
                vec![0.0; dim]
            }
        }
    }

    fn empty_graph(&self) -> Hnsw {
        Hnsw::new(
            self.params.m,
            self.params.ef_construction,
            Self::make_accessor(self.vectors.clone(), self.params.dim),
        )
    }

    /// Load persisted state, or start empty.
    ///
    /// A corrupt or unreadable index must never take the service down: any
    /// load error is logged and the index starts empty (the descriptor
    /// store remains authoritative; a rebuild restores coverage).
    /// Idempotent — a second call is a no-op.
    pub fn init(&mut self) -> Result<(), RecognitionError> {
        if self.graph.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent).map_err(RecognitionError::internal)?;
        }

        if self.index_path.exists() && self.meta_path.exists() {
            match self.try_load() {
                Ok(()) => {
                    info!(
                        "face index loaded: {} live vectors ({} physical) from {:?}",
                        self.total_vectors, self.next_label, self.index_path
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "face index load failed ({}); starting empty, rebuild to restore",
                        e
                    );
                    self.vectors.write().clear();
                    self.label_to_meta.clear();
                    self.user_to_label.clear();
                    self.next_label = 0;
                    self.total_vectors = 0;
                }
            }
        }

        self.graph = Some(self.empty_graph());
        Ok(())
    }

    fn try_load(&mut self) -> anyhow::Result<()> {
        let meta_bytes = std::fs::read(&self.meta_path)?;
        let meta: IndexMeta = serde_json::from_slice(&meta_bytes)?;

        let (header, vectors, mut reader) = read_container(&self.index_path)?;
        if header.dim as usize != self.params.dim {
            anyhow::bail!(
                "container dim {} does not match configured {}",
                header.dim,
                self.params.dim
            );
        }
        if header.count as u64 != meta.next_label {
            anyhow::bail!(
                "container holds {} vectors but metadata expects {}",
                header.count,
                meta.next_label
            );
        }

        *self.vectors.write() = vectors;
        let graph = Hnsw::deserialize(
            &mut reader,
            Self::make_accessor(self.vectors.clone(), self.params.dim),
        )?;

        self.label_to_meta = meta.id_map.into_iter().collect();
        self.user_to_label = meta.reverse_id_map.into_iter().collect();
        self.next_label = meta.next_label;
        self.total_vectors = self.label_to_meta.len() as u64;
        self.last_rebuild_at = meta.last_rebuild_at;
        self.graph = Some(graph);
        Ok(())
    }

    fn graph_mut(&mut self) -> Result<&mut Hnsw, RecognitionError> {
        self.graph.as_mut().ok_or(RecognitionError::NotInitialized)
    }

    fn allocate_label(&mut self, descriptor: Vec<f32>) -> Result<u64, RecognitionError> {
        if self.next_label >= self.params.max_elements {
            return Err(RecognitionError::CapacityExceeded {
                max: self.params.max_elements,
            });
        }
        let label = self.next_label;
        self.next_label += 1;

        debug_assert_eq!(label as usize, self.vectors.read().len());
        self.vectors.write().push(descriptor);
        self.graph_mut()?.insert(label as usize);
        Ok(label)
    }

    fn check_descriptor(&self, descriptor: &[f32]) -> Result<(), RecognitionError> {
        if descriptor.len() != self.params.dim {
            return Err(RecognitionError::internal(format!(
                "descriptor has {} dims, index expects {}",
                descriptor.len(),
                self.params.dim
            )));
        }
        Ok(())
    }

    /// Register a user's descriptor. Delegates to [`update_user`] when the
    /// user already has a live label.
    ///
    /// Returns true when the caller should trigger an asynchronous persist
    /// (every `persist_every` successful mutations).
    ///
    /// [`update_user`]: FaceIndex::update_user
    pub fn add_user(
        &mut self,
        user_id: u64,
        descriptor: Vec<f32>,
        meta: IndexUserMeta,
    ) -> Result<bool, RecognitionError> {
        if self.graph.is_none() {
            return Err(RecognitionError::NotInitialized);
        }
        self.check_descriptor(&descriptor)?;

        if self.user_to_label.contains_key(&user_id) {
            return self.update_user(user_id, descriptor, meta);
        }

        let label = self.allocate_label(descriptor)?;
        self.label_to_meta.insert(label, meta);
        self.user_to_label.insert(user_id, label);
        self.total_vectors += 1;

        Ok(self.note_mutation())
    }

    /// Replace a user's descriptor. The old label is masked, never
    /// resurrected; `total_vectors` is unchanged because the old point is
    /// still physically present.
    pub fn update_user(
        &mut self,
        user_id: u64,
        descriptor: Vec<f32>,
        meta: IndexUserMeta,
    ) -> Result<bool, RecognitionError> {
        if self.graph.is_none() {
            return Err(RecognitionError::NotInitialized);
        }
        self.check_descriptor(&descriptor)?;

        let Some(&old_label) = self.user_to_label.get(&user_id) else {
            return self.add_user(user_id, descriptor, meta);
        };

        let new_label = self.allocate_label(descriptor)?;
        self.label_to_meta.remove(&old_label);
        self.label_to_meta.insert(new_label, meta);
        self.user_to_label.insert(user_id, new_label);

        Ok(self.note_mutation())
    }

    /// Mask a user's label. Unknown users are a no-op.
    pub fn remove_user(&mut self, user_id: u64) -> bool {
        let Some(label) = self.user_to_label.remove(&user_id) else {
            return false;
        };
        self.label_to_meta.remove(&label);
        self.total_vectors = self.total_vectors.saturating_sub(1);
        true
    }

    fn note_mutation(&mut self) -> bool {
        self.adds_since_persist += 1;
        if self.adds_since_persist >= self.persist_every {
            self.adds_since_persist = 0;
            true
        } else {
            false
        }
    }

    /// k-NN over live labels.
    ///
    /// `threshold` is Euclidean; the graph's squared distances are compared
    /// against `threshold²` and converted on the way out. Masked labels are
    /// skipped. Results ascend by distance, ties by label.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, RecognitionError> {
        let graph = self.graph.as_ref().ok_or(RecognitionError::NotInitialized)?;
        self.check_descriptor(query)?;

        if self.total_vectors == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let fetch = k.min(self.total_vectors as usize);
        let candidates = graph.search_filtered(query, fetch, self.params.ef_search, |label| {
            self.label_to_meta.contains_key(&(label as u64))
        });

        let threshold_sq = threshold * threshold;
        let mut survivors: Vec<(u64, f32)> = candidates
            .into_iter()
            .filter(|(_, d2)| *d2 <= threshold_sq)
            .map(|(label, d2)| (label as u64, d2))
            .collect();

        survivors.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let hits = survivors
            .into_iter()
            .filter_map(|(label, d2)| {
                // A label can lose its meta row between graph traversal and
                // here only via &mut self, which the lock excludes; the
                // filter_map is the contract regardless.
                let meta = self.label_to_meta.get(&label)?;
                let distance = d2.sqrt();
                Some(SearchHit {
                    user_id: meta.user_id,
                    external_id: meta.external_id.clone(),
                    display_name: meta.display_name.clone(),
                    client_ref: meta.client_ref.clone(),
                    distance,
                    similarity: ((1.0 - distance) * 100.0).round() as i32,
                })
            })
            .collect();

        Ok(hits)
    }

    /// Rebuild from the authoritative store, discarding masked labels.
    ///
    /// Unlike add/update, persistence errors surface to the caller.
    pub fn rebuild(&mut self, users: &[UserRecord]) -> Result<(), RecognitionError> {
        self.vectors.write().clear();
        self.label_to_meta.clear();
        self.user_to_label.clear();
        self.next_label = 0;
        self.total_vectors = 0;
        self.graph = Some(self.empty_graph());

        for user in users {
            if user.descriptor.len() != self.params.dim {
                error!(
                    "skipping user {} during rebuild: descriptor has {} dims",
                    user.user_id,
                    user.descriptor.len()
                );
                continue;
            }
            let label = self.allocate_label(user.descriptor.clone())?;
            self.label_to_meta.insert(label, IndexUserMeta::from(user));
            self.user_to_label.insert(user.user_id, label);
            self.total_vectors += 1;
        }

        self.last_rebuild_at = Some(Utc::now());
        self.adds_since_persist = 0;
        self.save()?;
        info!("face index rebuilt: {} users", self.total_vectors);
        Ok(())
    }

    /// Persist container and metadata, each write-then-rename, container
    /// first. A crash between the two leaves the previous consistent pair
    /// loadable or fails the count check in `init`, which falls back to
    /// empty + rebuild.
    pub fn save(&self) -> Result<(), RecognitionError> {
        let graph = self.graph.as_ref().ok_or(RecognitionError::NotInitialized)?;

        let dir = self
            .index_path
            .parent()
            .ok_or_else(|| RecognitionError::internal("index path has no parent directory"))?;
        std::fs::create_dir_all(dir).map_err(RecognitionError::internal)?;

        let container_tmp = tmp_sibling(&self.index_path);
        {
            let vectors = self.vectors.read();
            write_container(&container_tmp, self.params.dim, &vectors, graph)
                .map_err(RecognitionError::internal)?;
        }
        std::fs::rename(&container_tmp, &self.index_path).map_err(RecognitionError::internal)?;

        let meta = IndexMeta {
            next_label: self.next_label,
            last_rebuild_at: self.last_rebuild_at,
            id_map: self
                .label_to_meta
                .iter()
                .map(|(label, meta)| (*label, meta.clone()))
                .collect(),
            reverse_id_map: self
                .user_to_label
                .iter()
                .map(|(user, label)| (*user, *label))
                .collect(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(RecognitionError::internal)?;

        let meta_tmp = tmp_sibling(&self.meta_path);
        std::fs::write(&meta_tmp, &meta_bytes).map_err(RecognitionError::internal)?;
        sync_file(&meta_tmp).map_err(RecognitionError::internal)?;
        std::fs::rename(&meta_tmp, &self.meta_path).map_err(RecognitionError::internal)?;

        sync_dir(dir).map_err(RecognitionError::internal)?;
        Ok(())
    }

    /// Live vector count (masked labels excluded).
    pub fn size(&self) -> u64 {
        debug_assert_eq!(self.total_vectors as usize, self.user_to_label.len());
        self.total_vectors
    }

    pub fn is_initialized(&self) -> bool {
        self.graph.is_some()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            live_vectors: self.total_vectors,
            physical_vectors: self.next_label,
            masked_vectors: self.next_label - self.total_vectors,
            dim: self.params.dim,
            m: self.params.m,
            ef_construction: self.params.ef_construction,
            ef_search: self.params.ef_search,
            max_elements: self.params.max_elements,
            last_rebuild_at: self.last_rebuild_at,
        }
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_file(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

fn sync_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DIM: usize = 128;

    fn test_params() -> IndexParams {
        IndexParams {
            dim: DIM,
            m: 16,
            ef_construction: 100,
            ef_search: 100,
            max_elements: 10_000,
        }
    }

    fn open_index(dir: &Path) -> FaceIndex {
        let mut index = FaceIndex::new(
            test_params(),
            100,
            dir.join("faces.idx"),
            dir.join("faces.meta.json"),
        );
        index.init().unwrap();
        index
    }

    fn descriptor(seed: u64) -> Vec<f32> {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        let raw: Vec<f32> = (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect();
        visage_core::l2_normalized(&raw)
    }

    fn meta(user_id: u64) -> IndexUserMeta {
        IndexUserMeta {
            user_id,
            external_id: format!("ext-{}", user_id),
            display_name: format!("User {}", user_id),
            client_ref: "c1".to_string(),
        }
    }

    #[test]
    fn uninitialized_index_refuses_operations() {
        let dir = tempdir().unwrap();
        let index = FaceIndex::new(
            test_params(),
            100,
            dir.path().join("faces.idx"),
            dir.path().join("faces.meta.json"),
        );
        assert!(matches!(
            index.search(&descriptor(1), 1, f32::INFINITY),
            Err(RecognitionError::NotInitialized)
        ));
    }

    #[test]
    fn every_live_user_finds_itself_at_distance_zero() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        for user_id in 1..=30u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }

        for user_id in 1..=30u64 {
            let hits = index.search(&descriptor(user_id), 1, f32::INFINITY).unwrap();
            assert_eq!(hits[0].user_id, user_id);
            assert!(hits[0].distance < 1e-3);
            assert_eq!(hits[0].similarity, 100);
        }
    }

    #[test]
    fn removed_user_never_returned() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        for user_id in 1..=10u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }
        assert!(index.remove_user(5));
        assert_eq!(index.size(), 9);

        let hits = index.search(&descriptor(5), 10, f32::INFINITY).unwrap();
        assert!(hits.iter().all(|h| h.user_id != 5));
    }

    #[test]
    fn remove_unknown_user_is_noop() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());
        assert!(!index.remove_user(99));
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn update_swaps_identity_point() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        for user_id in 1..=10u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }

        let old = descriptor(3);
        let new = descriptor(333);
        index.update_user(3, new.clone(), meta(3)).unwrap();

        // New descriptor resolves to the user
        let hits = index.search(&new, 1, f32::INFINITY).unwrap();
        assert_eq!(hits[0].user_id, 3);
        assert!(hits[0].distance < 1e-3);

        // Old descriptor no longer matches under a tight threshold
        let moved = visage_core::l2_distance(&old, &new);
        let hits = index.search(&old, 10, moved * 0.5).unwrap();
        assert!(hits.iter().all(|h| h.user_id != 3));

        // Live count unchanged, one masked label accumulated
        assert_eq!(index.size(), 10);
        assert_eq!(index.stats().masked_vectors, 1);
    }

    #[test]
    fn add_existing_user_delegates_to_update() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.add_user(1, descriptor(1), meta(1)).unwrap();
        index.add_user(1, descriptor(100), meta(1)).unwrap();

        assert_eq!(index.size(), 1);
        let hits = index.search(&descriptor(100), 1, f32::INFINITY).unwrap();
        assert_eq!(hits[0].user_id, 1);
        assert!(hits[0].distance < 1e-3);
    }

    #[test]
    fn search_respects_threshold() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        index.add_user(1, descriptor(1), meta(1)).unwrap();

        // Random unit vectors sit around distance √2 from each other
        let hits = index.search(&descriptor(999), 5, 0.42).unwrap();
        assert!(hits.is_empty());

        let hits = index.search(&descriptor(1), 5, 0.42).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn search_results_sorted_by_distance() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        for user_id in 1..=50u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }

        let hits = index.search(&descriptor(25), 10, f32::INFINITY).unwrap();
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn capacity_exceeded() {
        let dir = tempdir().unwrap();
        let mut index = FaceIndex::new(
            IndexParams {
                max_elements: 3,
                ..test_params()
            },
            100,
            dir.path().join("faces.idx"),
            dir.path().join("faces.meta.json"),
        );
        index.init().unwrap();

        for user_id in 1..=3u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }
        let err = index.add_user(4, descriptor(4), meta(4)).unwrap_err();
        assert!(matches!(err, RecognitionError::CapacityExceeded { .. }));
    }

    #[test]
    fn persist_hint_fires_every_n_mutations() {
        let dir = tempdir().unwrap();
        let mut index = FaceIndex::new(
            test_params(),
            3,
            dir.path().join("faces.idx"),
            dir.path().join("faces.meta.json"),
        );
        index.init().unwrap();

        assert!(!index.add_user(1, descriptor(1), meta(1)).unwrap());
        assert!(!index.add_user(2, descriptor(2), meta(2)).unwrap());
        assert!(index.add_user(3, descriptor(3), meta(3)).unwrap());
        assert!(!index.add_user(4, descriptor(4), meta(4)).unwrap());
    }

    #[test]
    fn save_then_init_reproduces_state() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        for user_id in 1..=40u64 {
            index
                .add_user(user_id, descriptor(user_id), meta(user_id))
                .unwrap();
        }
        index.remove_user(7);
        index
            .update_user(8, descriptor(800), meta(8))
            .unwrap();
        index.save().unwrap();

        let expected_hits = index.search(&descriptor(20), 5, f32::INFINITY).unwrap();

        let mut reloaded = open_index(dir.path());
        reloaded.init().unwrap();

        assert_eq!(reloaded.size(), 39);
        assert_eq!(reloaded.stats().physical_vectors, 41);

        let hits = reloaded.search(&descriptor(20), 5, f32::INFINITY).unwrap();
        assert_eq!(
            hits.iter().map(|h| h.user_id).collect::<Vec<_>>(),
            expected_hits.iter().map(|h| h.user_id).collect::<Vec<_>>()
        );

        // Masked label stays masked across restart
        let hits = reloaded.search(&descriptor(7), 10, f32::INFINITY).unwrap();
        assert!(hits.iter().all(|h| h.user_id != 7));
    }

    #[test]
    fn corrupt_files_fall_back_to_empty() {
        let dir = tempdir().unwrap();
        {
            let mut index = open_index(dir.path());
            index.add_user(1, descriptor(1), meta(1)).unwrap();
            index.save().unwrap();
        }

        std::fs::write(dir.path().join("faces.idx"), b"corrupted").unwrap();

        let mut index = open_index(dir.path());
        index.init().unwrap();
        assert_eq!(index.size(), 0);
        assert!(index.is_initialized());
    }

    #[test]
    fn rebuild_discards_masked_labels() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        let users: Vec<UserRecord> = (1..=20u64)
            .map(|user_id| UserRecord {
                user_id,
                external_id: format!("ext-{}", user_id),
                display_name: format!("User {}", user_id),
                client_ref: "c1".to_string(),
                descriptor: descriptor(user_id),
                confidence: 0.9,
                active: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                last_recognition_at: None,
                recognition_count: 0,
            })
            .collect();

        for user in &users {
            index
                .add_user(user.user_id, user.descriptor.clone(), IndexUserMeta::from(user))
                .unwrap();
        }
        index.remove_user(1);
        index.update_user(2, descriptor(200), meta(2)).unwrap();
        assert!(index.stats().masked_vectors > 0);

        index.rebuild(&users).unwrap();

        assert_eq!(index.size(), 20);
        assert_eq!(index.stats().masked_vectors, 0);
        assert!(index.stats().last_rebuild_at.is_some());

        // Behavior equivalent to pre-mask state for untouched users
        let hits = index.search(&descriptor(10), 1, f32::INFINITY).unwrap();
        assert_eq!(hits[0].user_id, 10);
    }

    #[test]
    fn rebuild_skips_malformed_descriptors() {
        let dir = tempdir().unwrap();
        let mut index = open_index(dir.path());

        let mut users: Vec<UserRecord> = vec![UserRecord {
            user_id: 1,
            external_id: "ext-1".to_string(),
            display_name: "User 1".to_string(),
            client_ref: "c1".to_string(),
            descriptor: descriptor(1),
            confidence: 0.9,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_recognition_at: None,
            recognition_count: 0,
        }];
        users.push(UserRecord {
            user_id: 2,
            descriptor: vec![0.1; 17],
            ..users[0].clone()
        });

        index.rebuild(&users).unwrap();
        assert_eq!(index.size(), 1);
    }
}
