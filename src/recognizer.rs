//! Recognition coordinator: orchestrates cache → detect/embed → search →
//! threshold → persist → metrics.
//!
//! Blocking work (embedder inference, descriptor-store subprocesses, index
//! traversal) runs on the blocking pool; no index lock is ever held across
//! an embedder call. Failure policy follows the store-is-authoritative
//! rule: store errors fail the operation, index sync errors are swallowed
//! and counted, cache and log errors never surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{cache_key, ResultCache};
use crate::config::{Profile, RecognitionConfig};
use crate::embedder::{DetectionMode, FaceBox, FaceEmbedder, FaceObservation};
use crate::error::RecognitionError;
use crate::index::{FaceIndex, IndexUserMeta, SearchHit};
use crate::metrics::Metrics;
use crate::store::{DescriptorStore, LogEvent, NewUser, UserRecord};

/// Identity fields accompanying an enrollment image.
#[derive(Debug, Clone)]
pub struct Registration {
    pub external_id: String,
    pub display_name: String,
    pub client_ref: String,
}

/// Result of enroll / update.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub user_id: u64,
    pub external_id: String,
    pub descriptor: Vec<f32>,
    pub confidence: f32,
    pub bounding_box: FaceBox,
    pub processing_ms: f64,
}

/// Result of identify. Serializable for the cache round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyOutcome {
    #[serde(rename = "match")]
    pub matched: Option<SearchHit>,
    /// Euclidean distance of the match, when one exists.
    pub confidence: Option<f32>,
    pub backend: String,
    #[serde(rename = "processingMs")]
    pub processing_ms: f64,
    #[serde(default)]
    pub cached: bool,
}

/// Per-call identify knobs.
#[derive(Clone, Default)]
pub struct IdentifyOptions {
    pub skip_cache: bool,
    /// Active-user snapshot for the linear O(n) safety net, used when the
    /// ANN index is empty or uninitialized.
    pub fallback_users: Option<Arc<Vec<UserRecord>>>,
    /// Metric label: "single" or "batch".
    pub batch: bool,
}

impl IdentifyOptions {
    fn mode_label(&self) -> &'static str {
        if self.batch {
            "batch"
        } else {
            "single"
        }
    }
}

/// Index sync operations exposed to non-recognition code paths.
#[derive(Debug, Clone, Copy)]
pub enum SyncOp {
    Add,
    Update,
    Remove,
}

#[derive(Default)]
struct RollingStats {
    total: AtomicU64,
    matched: AtomicU64,
    processing_us_sum: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecognizerStats {
    pub total: u64,
    pub matched: u64,
    pub avg_processing_ms: f64,
    pub confidence_threshold: f32,
}

pub struct Recognizer {
    embedder: Arc<dyn FaceEmbedder>,
    store: Arc<dyn DescriptorStore>,
    index: Arc<RwLock<FaceIndex>>,
    cache: Arc<ResultCache>,
    metrics: Arc<Metrics>,
    config: Arc<RwLock<RecognitionConfig>>,
    rolling: RollingStats,
}

impl Recognizer {
    pub fn new(
        embedder: Arc<dyn FaceEmbedder>,
        store: Arc<dyn DescriptorStore>,
        index: Arc<RwLock<FaceIndex>>,
        cache: Arc<ResultCache>,
        metrics: Arc<Metrics>,
        config: Arc<RwLock<RecognitionConfig>>,
    ) -> Self {
        Self {
            embedder,
            store,
            index,
            cache,
            metrics,
            config,
            rolling: RollingStats::default(),
        }
    }

    pub fn index(&self) -> Arc<RwLock<FaceIndex>> {
        self.index.clone()
    }

    pub fn store(&self) -> Arc<dyn DescriptorStore> {
        self.store.clone()
    }

    pub fn cache(&self) -> Arc<ResultCache> {
        self.cache.clone()
    }

    /// Apply a threshold profile. Takes effect for in-flight config reads
    /// on the next operation.
    pub fn apply_profile(&self, profile: Profile) {
        self.config.write().apply_profile(profile);
    }

    async fn run_embedder(
        &self,
        image: Vec<u8>,
        mode: DetectionMode,
    ) -> Result<FaceObservation, RecognitionError> {
        let embedder = self.embedder.clone();
        let timeout = self.config.read().embed_timeout;

        let task = tokio::task::spawn_blocking(move || embedder.detect_and_embed(&image, mode));
        match tokio::time::timeout(timeout, task).await {
            Err(_) => Err(RecognitionError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
            Ok(Err(join_err)) => Err(RecognitionError::internal(join_err)),
            Ok(Ok(result)) => result,
        }
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, RecognitionError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DescriptorStore) -> Result<T, RecognitionError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(RecognitionError::internal)?
    }

    fn validate_face(&self, obs: &FaceObservation) -> Result<(), RecognitionError> {
        let (min_size, max_size, min_score) = {
            let cfg = self.config.read();
            (
                cfg.min_face_size,
                cfg.max_face_size,
                cfg.registration_min_score,
            )
        };

        let smaller = obs.bounding_box.width.min(obs.bounding_box.height);
        let larger = obs.bounding_box.width.max(obs.bounding_box.height);
        if smaller < min_size {
            return Err(RecognitionError::FaceTooSmall {
                size: smaller,
                min: min_size,
            });
        }
        if larger > max_size {
            return Err(RecognitionError::FaceTooLarge {
                size: larger,
                max: max_size,
            });
        }
        if obs.detection_score < min_score {
            return Err(RecognitionError::LowQuality {
                score: obs.detection_score,
            });
        }
        Ok(())
    }

    fn enrollment_confidence(obs: &FaceObservation) -> f32 {
        let landmark_factor = if obs.has_landmarks { 0.9 } else { 0.7 };
        (obs.detection_score * landmark_factor * 100.0).round() / 100.0
    }

    /// Enroll a new user: detect in high-precision mode, persist, index.
    pub async fn enroll(
        &self,
        image: &[u8],
        registration: Registration,
    ) -> Result<EnrollOutcome, RecognitionError> {
        let started = Instant::now();
        let result = self.enroll_inner(image, registration).await;

        let status = match &result {
            Ok(_) => "created",
            Err(e) => e.code(),
        };
        self.metrics
            .record_registration(status, started.elapsed().as_secs_f64());
        result
    }

    async fn enroll_inner(
        &self,
        image: &[u8],
        registration: Registration,
    ) -> Result<EnrollOutcome, RecognitionError> {
        let started = Instant::now();

        let obs = self
            .run_embedder(image.to_vec(), DetectionMode::Register)
            .await?;
        self.validate_face(&obs)?;
        let confidence = Self::enrollment_confidence(&obs);

        let new_user = NewUser {
            external_id: registration.external_id.clone(),
            display_name: registration.display_name.clone(),
            client_ref: registration.client_ref.clone(),
            descriptor: obs.descriptor.clone(),
            confidence,
        };
        let user_id = self.with_store(move |s| s.create(&new_user)).await?;

        let meta = IndexUserMeta {
            user_id,
            external_id: registration.external_id.clone(),
            display_name: registration.display_name,
            client_ref: registration.client_ref,
        };
        self.sync_index_blocking(user_id, Some(obs.descriptor.clone()), Some(meta), SyncOp::Add);

        self.refresh_gauges().await;
        self.log_event(LogEvent {
            event: "register",
            external_id: Some(registration.external_id.clone()),
            matched: false,
            distance: None,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
            backend: "store".to_string(),
        });

        Ok(EnrollOutcome {
            user_id,
            external_id: registration.external_id,
            descriptor: obs.descriptor,
            confidence,
            bounding_box: obs.bounding_box,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Identify a face against the enrolled population.
    pub async fn identify(
        &self,
        image: &[u8],
        options: IdentifyOptions,
    ) -> Result<IdentifyOutcome, RecognitionError> {
        let started = Instant::now();
        let mode = options.mode_label();
        let result = self.identify_inner(image, &options, started).await;

        let status = match &result {
            Ok(outcome) if outcome.matched.is_some() => "matched",
            Ok(_) => "not_found",
            Err(e) => e.code(),
        };
        self.metrics
            .record_recognition(status, mode, started.elapsed().as_secs_f64());

        if let Ok(outcome) = &result {
            self.rolling.total.fetch_add(1, Ordering::Relaxed);
            if outcome.matched.is_some() {
                self.rolling.matched.fetch_add(1, Ordering::Relaxed);
            }
            self.rolling.processing_us_sum.fetch_add(
                (outcome.processing_ms * 1000.0) as u64,
                Ordering::Relaxed,
            );
        }

        result
    }

    async fn identify_inner(
        &self,
        image: &[u8],
        options: &IdentifyOptions,
        started: Instant,
    ) -> Result<IdentifyOutcome, RecognitionError> {
        let threshold = self.config.read().confidence_threshold;
        let key = cache_key(image);

        if !options.skip_cache {
            if let Some(raw) = self.cache.get(&key).await {
                if let Ok(mut outcome) = serde_json::from_str::<IdentifyOutcome>(&raw) {
                    self.metrics.cache_hits_total.inc();
                    outcome.cached = true;
                    outcome.backend = "cache".to_string();
                    outcome.processing_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return Ok(outcome);
                }
                // Unreadable entries count as misses and get overwritten.
            }
            self.metrics.cache_misses_total.inc();
        }

        let obs = self
            .run_embedder(image.to_vec(), DetectionMode::Recognize)
            .await?;

        let (top, backend) = self.search_or_fallback(obs.descriptor, threshold, options).await?;

        // Defense in depth: the index already filters by threshold, but the
        // match decision is re-checked here.
        let matched = top.filter(|hit| hit.distance <= threshold);

        let outcome = IdentifyOutcome {
            confidence: matched.as_ref().map(|h| h.distance),
            matched,
            backend: backend.to_string(),
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
            cached: false,
        };

        if let Some(hit) = &outcome.matched {
            if !options.skip_cache {
                if let Ok(serialized) = serde_json::to_string(&outcome) {
                    self.cache.set(&key, &serialized, None).await;
                }
            }

            let user_id = hit.user_id;
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.record_recognition(user_id, Utc::now()) {
                    warn!("recording recognition for user {} failed: {}", user_id, e);
                }
            });
        }

        self.log_event(LogEvent {
            event: "recognize",
            external_id: outcome.matched.as_ref().map(|h| h.external_id.clone()),
            matched: outcome.matched.is_some(),
            distance: outcome.confidence,
            processing_ms: outcome.processing_ms,
            backend: outcome.backend.clone(),
        });

        Ok(outcome)
    }

    async fn search_or_fallback(
        &self,
        descriptor: Vec<f32>,
        threshold: f32,
        options: &IdentifyOptions,
    ) -> Result<(Option<SearchHit>, &'static str), RecognitionError> {
        let index = self.index.clone();
        let metrics = self.metrics.clone();
        let query = descriptor.clone();

        let ann_hits: Option<Vec<SearchHit>> = tokio::task::spawn_blocking(move || {
            let ix = index.read();
            if ix.is_initialized() && ix.size() > 0 {
                let search_started = Instant::now();
                let hits = ix.search(&query, 5, threshold);
                metrics
                    .hnsw_search_duration
                    .observe(search_started.elapsed().as_secs_f64());
                hits.map(Some)
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(RecognitionError::internal)??;

        if let Some(hits) = ann_hits {
            return Ok((hits.into_iter().next(), "hnsw"));
        }

        if let Some(snapshot) = options.fallback_users.clone() {
            let hit = tokio::task::spawn_blocking(move || {
                linear_scan(&snapshot, &descriptor, threshold)
            })
            .await
            .map_err(RecognitionError::internal)?;
            return Ok((hit, "linear"));
        }

        Ok((None, "hnsw"))
    }

    /// Update an existing user's descriptor from a new image.
    pub async fn update(
        &self,
        image: &[u8],
        external_id: &str,
    ) -> Result<EnrollOutcome, RecognitionError> {
        let started = Instant::now();
        let result = self.update_inner(image, external_id).await;

        let status = match &result {
            Ok(_) => "updated",
            Err(e) => e.code(),
        };
        self.metrics
            .record_registration(status, started.elapsed().as_secs_f64());
        result
    }

    async fn update_inner(
        &self,
        image: &[u8],
        external_id: &str,
    ) -> Result<EnrollOutcome, RecognitionError> {
        let started = Instant::now();

        let lookup_id = external_id.to_string();
        let user = self
            .with_store(move |s| s.find_by_external_id(&lookup_id))
            .await?
            .ok_or_else(|| RecognitionError::NotFound(external_id.to_string()))?;

        let obs = self
            .run_embedder(image.to_vec(), DetectionMode::Register)
            .await?;
        self.validate_face(&obs)?;
        let confidence = Self::enrollment_confidence(&obs);

        let user_id = user.user_id;
        let descriptor = obs.descriptor.clone();
        self.with_store(move |s| {
            s.update_descriptor(user_id, &descriptor, confidence, Utc::now())
        })
        .await?;

        let meta = IndexUserMeta::from(&user);
        self.sync_index_blocking(user_id, Some(obs.descriptor.clone()), Some(meta), SyncOp::Update);

        self.log_event(LogEvent {
            event: "update",
            external_id: Some(external_id.to_string()),
            matched: false,
            distance: None,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
            backend: "store".to_string(),
        });

        Ok(EnrollOutcome {
            user_id,
            external_id: external_id.to_string(),
            descriptor: obs.descriptor,
            confidence,
            bounding_box: obs.bounding_box,
            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Idempotent index-sync façade for non-recognition code paths.
    /// All failures are logged, counted, and swallowed.
    pub fn sync_index(
        &self,
        user_id: u64,
        descriptor: Option<Vec<f32>>,
        meta: Option<IndexUserMeta>,
        op: SyncOp,
    ) {
        self.sync_index_blocking(user_id, descriptor, meta, op);
    }

    fn sync_index_blocking(
        &self,
        user_id: u64,
        descriptor: Option<Vec<f32>>,
        meta: Option<IndexUserMeta>,
        op: SyncOp,
    ) {
        let result = {
            let mut ix = self.index.write();
            match op {
                SyncOp::Add => match (descriptor, meta) {
                    (Some(d), Some(m)) => ix.add_user(user_id, d, m),
                    _ => Err(RecognitionError::internal(
                        "add sync requires descriptor and meta",
                    )),
                },
                SyncOp::Update => match (descriptor, meta) {
                    (Some(d), Some(m)) => ix.update_user(user_id, d, m),
                    _ => Err(RecognitionError::internal(
                        "update sync requires descriptor and meta",
                    )),
                },
                SyncOp::Remove => {
                    ix.remove_user(user_id);
                    Ok(false)
                }
            }
        };

        match result {
            Ok(persist_hint) => {
                if persist_hint {
                    self.spawn_persist();
                }
                self.metrics
                    .hnsw_index_size
                    .set(self.index.read().size());
            }
            Err(e) => {
                warn!("index sync ({:?}) for user {} failed: {}", op, user_id, e);
                self.metrics.index_sync_failures_total.inc();
            }
        }
    }

    /// Persist the index off the caller's path. Errors are logged only.
    fn spawn_persist(&self) {
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = index.read().save() {
                warn!("asynchronous index persist failed: {}", e);
            }
        });
    }

    /// Rebuild the ANN index from the descriptor store. Unlike enroll-time
    /// sync, errors here surface to the caller.
    pub async fn rebuild_index(&self) -> Result<u64, RecognitionError> {
        let users = self.with_store(|s| s.list_active()).await?;

        let index = self.index.clone();
        let size = tokio::task::spawn_blocking(move || -> Result<u64, RecognitionError> {
            let mut ix = index.write();
            ix.rebuild(&users)?;
            Ok(ix.size())
        })
        .await
        .map_err(RecognitionError::internal)??;

        self.refresh_gauges().await;
        Ok(size)
    }

    async fn refresh_gauges(&self) {
        self.metrics.hnsw_index_size.set(self.index.read().size());
        if let Ok(active) = self.with_store(|s| s.count_active()).await {
            self.metrics.active_users.set(active);
        }
        if let Some((used, total)) = self.embedder.device_memory() {
            self.metrics.gpu_memory_used_bytes.set(used);
            self.metrics.gpu_memory_total_bytes.set(total);
            self.metrics.gpu_active.set(1);
        }
    }

    /// Prime gauges at startup.
    pub async fn prime_gauges(&self) {
        self.refresh_gauges().await;
    }

    fn log_event(&self, event: LogEvent) {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.log_best_effort(&event));
    }

    pub fn stats(&self) -> RecognizerStats {
        let total = self.rolling.total.load(Ordering::Relaxed);
        let sum_us = self.rolling.processing_us_sum.load(Ordering::Relaxed);
        RecognizerStats {
            total,
            matched: self.rolling.matched.load(Ordering::Relaxed),
            avg_processing_ms: if total > 0 {
                (sum_us as f64 / total as f64) / 1000.0
            } else {
                0.0
            },
            confidence_threshold: self.config.read().confidence_threshold,
        }
    }
}

/// O(n) exact scan over an active-user snapshot: minimum Euclidean distance
/// under the threshold wins.
fn linear_scan(users: &[UserRecord], query: &[f32], threshold: f32) -> Option<SearchHit> {
    let mut best: Option<(&UserRecord, f32)> = None;
    for user in users.iter().filter(|u| u.active) {
        if user.descriptor.len() != query.len() {
            continue;
        }
        let distance = visage_core::l2_distance(query, &user.descriptor);
        if distance < threshold && best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((user, distance));
        }
    }

    best.map(|(user, distance)| SearchHit {
        user_id: user.user_id,
        external_id: user.external_id.clone(),
        display_name: user.display_name.clone(),
        client_ref: user.client_ref.clone(),
        distance,
        similarity: ((1.0 - distance) * 100.0).round() as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecognitionConfig;
    use crate::embedder::StubEmbedder;
    use crate::store::MemoryStore;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    fn png_bytes(tint: u8) -> Vec<u8> {
        let img = image::RgbImage::from_fn(256, 256, |x, y| {
            image::Rgb([tint, (x % 256) as u8, (y % 256) as u8])
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("png encode");
        buf
    }

    async fn test_recognizer(dir: &TempDir) -> (Recognizer, Arc<Metrics>) {
        let config = RecognitionConfig::from_data_dir(dir.path().to_path_buf());
        let metrics = Arc::new(Metrics::new());

        let mut index = FaceIndex::new(
            config.index,
            config.persist_every,
            config.index_path.clone(),
            config.meta_path.clone(),
        );
        index.init().unwrap();

        let cache = Arc::new(
            ResultCache::connect(None, Duration::from_secs(60), 100).await,
        );

        let recognizer = Recognizer::new(
            Arc::new(StubEmbedder),
            Arc::new(MemoryStore::new()),
            Arc::new(RwLock::new(index)),
            cache,
            metrics.clone(),
            Arc::new(RwLock::new(config)),
        );
        (recognizer, metrics)
    }

    fn registration(external_id: &str) -> Registration {
        Registration {
            external_id: external_id.to_string(),
            display_name: "Ada".to_string(),
            client_ref: "client-1".to_string(),
        }
    }

    #[tokio::test]
    async fn enroll_then_identify_self() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;
        let image = png_bytes(1);

        let enrolled = recognizer
            .enroll(&image, registration("A1"))
            .await
            .unwrap();
        assert!(enrolled.confidence > 0.0);

        let outcome = recognizer
            .identify(&image, IdentifyOptions::default())
            .await
            .unwrap();
        let hit = outcome.matched.expect("should match the enrolled user");
        assert_eq!(hit.external_id, "A1");
        assert!(hit.distance < 0.1);
        assert!(hit.similarity >= 90);
        assert_eq!(outcome.backend, "hnsw");
    }

    #[tokio::test]
    async fn second_identify_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, metrics) = test_recognizer(&dir).await;
        let image = png_bytes(2);

        recognizer
            .enroll(&image, registration("A1"))
            .await
            .unwrap();

        let first = recognizer
            .identify(&image, IdentifyOptions::default())
            .await
            .unwrap();
        assert!(!first.cached);

        let second = recognizer
            .identify(&image, IdentifyOptions::default())
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.backend, "cache");
        assert_eq!(metrics.cache_hits_total.get(), 1);

        // Equal results modulo transport bookkeeping
        assert_eq!(
            first.matched.as_ref().map(|h| h.user_id),
            second.matched.as_ref().map(|h| h.user_id)
        );
    }

    #[tokio::test]
    async fn identify_with_empty_store_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, metrics) = test_recognizer(&dir).await;

        let outcome = recognizer
            .identify(&png_bytes(3), IdentifyOptions::default())
            .await
            .unwrap();
        assert!(outcome.matched.is_none());
        assert_eq!(
            metrics
                .recognition_total
                .get("status=\"not_found\",mode=\"single\""),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_enroll_rejected_descriptor_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let first_image = png_bytes(4);
        recognizer
            .enroll(&first_image, registration("A1"))
            .await
            .unwrap();

        let err = recognizer
            .enroll(&png_bytes(5), registration("A1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Duplicate(_)));

        // First user's descriptor still matches the first image
        let outcome = recognizer
            .identify(&first_image, IdentifyOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.matched.unwrap().external_id, "A1");
    }

    #[tokio::test]
    async fn update_changes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let image_one = png_bytes(6);
        let image_two = png_bytes(7);

        recognizer
            .enroll(&image_one, registration("A1"))
            .await
            .unwrap();
        recognizer.update(&image_two, "A1").await.unwrap();

        let opts = IdentifyOptions {
            skip_cache: true,
            ..Default::default()
        };
        let outcome = recognizer.identify(&image_one, opts.clone()).await.unwrap();
        assert!(outcome.matched.is_none(), "old image must no longer match");

        let outcome = recognizer.identify(&image_two, opts).await.unwrap();
        assert_eq!(outcome.matched.unwrap().external_id, "A1");
    }

    #[tokio::test]
    async fn update_unknown_user_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let err = recognizer.update(&png_bytes(8), "ghost").await.unwrap_err();
        assert!(matches!(err, RecognitionError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_image_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let err = recognizer
            .identify(b"not an image", IdentifyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn linear_fallback_used_when_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let image = png_bytes(9);
        let obs = StubEmbedder
            .detect_and_embed(&image, DetectionMode::Register)
            .unwrap();

        let snapshot = Arc::new(vec![UserRecord {
            user_id: 7,
            external_id: "A7".to_string(),
            display_name: "Ada".to_string(),
            client_ref: "c1".to_string(),
            descriptor: obs.descriptor,
            confidence: 0.9,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_recognition_at: None,
            recognition_count: 0,
        }]);

        let outcome = recognizer
            .identify(
                &image,
                IdentifyOptions {
                    skip_cache: true,
                    fallback_users: Some(snapshot),
                    batch: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.backend, "linear");
        assert_eq!(outcome.matched.unwrap().external_id, "A7");
    }

    #[tokio::test]
    async fn rebuild_restores_search_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        let image = png_bytes(10);
        recognizer
            .enroll(&image, registration("A1"))
            .await
            .unwrap();

        // Simulate a lost index: wipe in-memory state via rebuild from store
        let size = recognizer.rebuild_index().await.unwrap();
        assert_eq!(size, 1);

        let outcome = recognizer
            .identify(
                &image,
                IdentifyOptions {
                    skip_cache: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.matched.unwrap().external_id, "A1");
    }

    #[tokio::test]
    async fn rolling_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let (recognizer, _metrics) = test_recognizer(&dir).await;

        recognizer
            .identify(&png_bytes(11), IdentifyOptions::default())
            .await
            .unwrap();

        let stats = recognizer.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.confidence_threshold, 0.42);
    }
}
