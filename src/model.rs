//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::{BatchErrorEntry, BatchJob, BatchJobSummary, BatchResultEntry, JobStatus};
use crate::embedder::FaceBox;
use crate::index::IndexStats;
use crate::recognizer::RecognizerStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "externalId")]
    pub external_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "clientRef", default)]
    pub client_ref: Option<String>,
    /// Base64-encoded image, optionally a data URL.
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    #[serde(rename = "userId")]
    pub user_id: u64,
    #[serde(rename = "externalId")]
    pub external_id: String,
    pub confidence: f32,
    #[serde(rename = "boundingBox")]
    pub bounding_box: FaceBox,
    #[serde(rename = "processingMs")]
    pub processing_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognizeRequest {
    pub image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    #[serde(rename = "externalId")]
    pub external_id: String,
    pub image: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub images: Vec<BatchImageRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchImageRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchJobDetail {
    pub id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub progress: u32,
    pub results: Vec<BatchResultEntry>,
    pub errors: Vec<BatchErrorEntry>,
    #[serde(rename = "globalError", skip_serializing_if = "Option::is_none")]
    pub global_error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "processingMs")]
    pub processing_ms: Option<f64>,
}

impl From<BatchJob> for BatchJobDetail {
    fn from(job: BatchJob) -> Self {
        let progress = job.progress();
        let processing_ms = job.processing_ms();
        Self {
            id: job.id,
            status: job.status,
            total: job.total,
            processed: job.processed,
            progress,
            results: job.results,
            errors: job.errors,
            global_error: job.global_error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            processing_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchCreateResponse {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: usize,
}

impl From<BatchJobSummary> for BatchCreateResponse {
    fn from(summary: BatchJobSummary) -> Self {
        Self {
            job_id: summary.id,
            status: summary.status,
            total: summary.total,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub recognition: RecognizerStats,
    pub index: IndexStats,
    #[serde(rename = "cacheBackend")]
    pub cache_backend: &'static str,
    #[serde(rename = "activeUsers")]
    pub active_users: u64,
    #[serde(rename = "batchJobs")]
    pub batch_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetailResponse {
    pub status: &'static str,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: u64,
    pub store: ComponentHealth,
    pub index: ComponentHealth,
    pub cache: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
}
