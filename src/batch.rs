//! Batch identification: job registry plus a bounded-concurrency worker
//! pool.
//!
//! A job is accepted, registered, and answered immediately; processing runs
//! on spawned tasks. Workers drain a shared cursor over the items, so the
//! results arrive in completion order — callers correlate by item id. The
//! active-user snapshot for the linear fallback is loaded once per job; the
//! ANN index is consulted live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RecognitionError;
use crate::metrics::Metrics;
use crate::recognizer::{IdentifyOptions, IdentifyOutcome, Recognizer};

/// One image in a batch request.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: Option<String>,
    pub image: Vec<u8>,
}

/// Per-job knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Bypass the result cache for every item in the job.
    pub skip_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResultEntry {
    #[serde(rename = "itemId")]
    pub item_id: Option<String>,
    #[serde(flatten)]
    pub outcome: IdentifyOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchErrorEntry {
    #[serde(rename = "itemId")]
    pub item_id: Option<String>,
    pub code: &'static str,
    pub message: String,
    #[serde(rename = "processingMs")]
    pub processing_ms: f64,
}

/// Registry entry for one batch job.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub results: Vec<BatchResultEntry>,
    pub errors: Vec<BatchErrorEntry>,
    pub global_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn progress(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed as f64 / self.total as f64) * 100.0).round() as u32
    }

    pub fn processing_ms(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Summary view for job listings.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub progress: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
}

type Registry = Arc<RwLock<HashMap<Uuid, BatchJob>>>;

pub struct BatchEngine {
    registry: Registry,
    recognizer: Arc<Recognizer>,
    metrics: Arc<Metrics>,
    max_batch_size: usize,
    max_concurrency: usize,
    job_ttl: Duration,
}

impl BatchEngine {
    pub fn new(
        recognizer: Arc<Recognizer>,
        metrics: Arc<Metrics>,
        max_batch_size: usize,
        max_concurrency: usize,
        job_ttl: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            recognizer,
            metrics,
            max_batch_size: max_batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
            job_ttl,
        }
    }

    /// Register a job and kick off processing. Returns once the job is
    /// registered; the caller polls `get_job` for progress.
    pub fn create_job(
        &self,
        items: Vec<BatchItem>,
        options: BatchOptions,
    ) -> Result<BatchJobSummary, RecognitionError> {
        if items.is_empty() {
            return Err(RecognitionError::InvalidImage(
                "batch requires at least one image".to_string(),
            ));
        }
        if items.len() > self.max_batch_size {
            return Err(RecognitionError::InvalidImage(format!(
                "batch of {} exceeds maximum {}",
                items.len(),
                self.max_batch_size
            )));
        }

        let job = BatchJob {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            total: items.len(),
            processed: 0,
            results: Vec::new(),
            errors: Vec::new(),
            global_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let summary = summarize(&job);
        let job_id = job.id;
        self.registry.write().insert(job_id, job);

        let registry = self.registry.clone();
        let recognizer = self.recognizer.clone();
        let metrics = self.metrics.clone();
        let concurrency = self.max_concurrency;
        tokio::spawn(async move {
            run_job(registry, recognizer, metrics, job_id, items, options, concurrency).await;
        });

        info!("batch job {} created: {} items", job_id, summary.total);
        Ok(summary)
    }

    pub fn get_job(&self, id: Uuid) -> Option<BatchJob> {
        self.registry.read().get(&id).cloned()
    }

    /// Newest-first job summaries.
    pub fn list_jobs(&self, limit: usize) -> Vec<BatchJobSummary> {
        let registry = self.registry.read();
        let mut summaries: Vec<BatchJobSummary> = registry.values().map(summarize).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        summaries
    }

    pub fn job_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Drop terminal jobs older than the TTL. Returns the evicted count.
    pub fn evict_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.job_ttl).unwrap_or(chrono::Duration::hours(1));
        let mut registry = self.registry.write();
        let before = registry.len();
        registry.retain(|_, job| {
            !(job.status.is_terminal()
                && job.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        before - registry.len()
    }

    /// Periodic eviction task; runs until the process exits.
    pub fn spawn_eviction_loop(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = engine.evict_expired();
                if evicted > 0 {
                    info!("evicted {} expired batch jobs", evicted);
                }
            }
        });
    }
}

fn summarize(job: &BatchJob) -> BatchJobSummary {
    BatchJobSummary {
        id: job.id,
        status: job.status,
        total: job.total,
        processed: job.processed,
        progress: job.progress(),
        created_at: job.created_at,
        completed_at: job.completed_at,
    }
}

async fn run_job(
    registry: Registry,
    recognizer: Arc<Recognizer>,
    metrics: Arc<Metrics>,
    job_id: Uuid,
    items: Vec<BatchItem>,
    options: BatchOptions,
    concurrency: usize,
) {
    {
        let mut reg = registry.write();
        if let Some(job) = reg.get_mut(&job_id) {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
        }
    }

    // One active-user snapshot per job for the linear fallback path.
    let store = recognizer.store();
    let snapshot = match tokio::task::spawn_blocking(move || store.list_active()).await {
        Ok(Ok(users)) => Arc::new(users),
        Ok(Err(e)) => {
            fail_job(&registry, &metrics, job_id, e.to_string());
            return;
        }
        Err(e) => {
            fail_job(&registry, &metrics, job_id, e.to_string());
            return;
        }
    };

    let items = Arc::new(items);
    let cursor = Arc::new(AtomicUsize::new(0));
    let mut workers = tokio::task::JoinSet::new();

    for _ in 0..concurrency.min(items.len()) {
        let registry = registry.clone();
        let recognizer = recognizer.clone();
        let metrics = metrics.clone();
        let items = items.clone();
        let cursor = cursor.clone();
        let snapshot = snapshot.clone();

        workers.spawn(async move {
            loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(i) else {
                    break;
                };

                let started = std::time::Instant::now();
                let identify_options = IdentifyOptions {
                    skip_cache: options.skip_cache,
                    fallback_users: Some(snapshot.clone()),
                    batch: true,
                };
                let result = recognizer.identify(&item.image, identify_options).await;

                let mut reg = registry.write();
                let Some(job) = reg.get_mut(&job_id) else {
                    // Job evicted mid-run; keep draining to finish quietly.
                    continue;
                };
                match result {
                    Ok(outcome) => {
                        metrics.batch_images_total.inc(&format!(
                            "status=\"{}\"",
                            if outcome.matched.is_some() {
                                "matched"
                            } else {
                                "not_found"
                            }
                        ));
                        job.results.push(BatchResultEntry {
                            item_id: item.id.clone(),
                            outcome,
                        });
                    }
                    Err(e) => {
                        metrics
                            .batch_images_total
                            .inc(&format!("status=\"{}\"", e.code()));
                        job.errors.push(BatchErrorEntry {
                            item_id: item.id.clone(),
                            code: e.code(),
                            message: e.to_string(),
                            processing_ms: started.elapsed().as_secs_f64() * 1000.0,
                        });
                    }
                }
                job.processed += 1;
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("batch worker for job {} panicked: {}", job_id, e);
        }
    }

    let mut reg = registry.write();
    if let Some(job) = reg.get_mut(&job_id) {
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        metrics.batch_jobs_total.inc("status=\"completed\"");
        info!(
            "batch job {} completed: {} results, {} errors",
            job_id,
            job.results.len(),
            job.errors.len()
        );
    }
}

fn fail_job(registry: &Registry, metrics: &Metrics, job_id: Uuid, message: String) {
    warn!("batch job {} failed before processing: {}", job_id, message);
    let mut reg = registry.write();
    if let Some(job) = reg.get_mut(&job_id) {
        job.status = JobStatus::Failed;
        job.global_error = Some(message);
        job.completed_at = Some(Utc::now());
        metrics.batch_jobs_total.inc("status=\"failed\"");
    }
}
