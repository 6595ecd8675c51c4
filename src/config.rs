//! Typed service configuration.
//!
//! All tunables live here; the CLI populates a `RecognitionConfig` from
//! flags and `VISAGE_*` environment variables, and the running service holds
//! it behind a `RwLock` so threshold and profile changes apply hot.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::embedder::DetectionMode;

/// Named bundle of recognition thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    HighSecurity,
    Balanced,
    Fast,
    Permissive,
}

impl Profile {
    /// Match cut-off in Euclidean distance.
    pub fn threshold(self) -> f32 {
        match self {
            Profile::HighSecurity => 0.25,
            Profile::Balanced => 0.42,
            Profile::Fast => 0.55,
            Profile::Permissive => 0.65,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "high_security" => Some(Profile::HighSecurity),
            "balanced" => Some(Profile::Balanced),
            "fast" => Some(Profile::Fast),
            "permissive" => Some(Profile::Permissive),
            _ => None,
        }
    }
}

/// HNSW tuning parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexParams {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_elements: u64,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            dim: 128,
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            max_elements: 1_100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Match cut-off in Euclidean distance.
    pub confidence_threshold: f32,
    /// Accepted face box side lengths, pixels.
    pub min_face_size: u32,
    pub max_face_size: u32,
    /// Minimum detector score to accept an enrollment.
    pub registration_min_score: f32,
    /// Per-mode detector score floor.
    pub detection_confidence_register: f32,
    pub detection_confidence_recognize: f32,
    pub detection_confidence_precise: f32,

    pub index: IndexParams,
    pub index_path: PathBuf,
    pub meta_path: PathBuf,
    /// Adds between asynchronous index persists.
    pub persist_every: u32,
    /// Periodic background save interval.
    pub save_interval: Duration,

    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub job_ttl: Duration,

    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    pub redis_url: Option<String>,

    pub database_path: PathBuf,

    pub embed_timeout: Duration,
    pub model_load_timeout: Duration,
}

impl RecognitionConfig {
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        let index_dir = data_dir.join("index");
        Self {
            confidence_threshold: Profile::Balanced.threshold(),
            min_face_size: 80,
            max_face_size: 1000,
            registration_min_score: 0.8,
            detection_confidence_register: 0.8,
            detection_confidence_recognize: 0.6,
            detection_confidence_precise: 0.9,
            index: IndexParams::default(),
            index_path: index_dir.join("faces.idx"),
            meta_path: index_dir.join("faces.meta.json"),
            persist_every: 100,
            save_interval: Duration::from_secs(300),
            max_batch_size: 50,
            max_concurrency: 4,
            job_ttl: Duration::from_millis(3_600_000),
            cache_ttl: Duration::from_secs(1800),
            cache_max_size: 1000,
            redis_url: None,
            database_path: data_dir.join("visage.sqlite3"),
            embed_timeout: Duration::from_secs(10),
            model_load_timeout: Duration::from_secs(60),
        }
    }

    /// Apply a profile preset. Only the match threshold changes; face size
    /// and detector floors stay as configured.
    pub fn apply_profile(&mut self, profile: Profile) {
        self.confidence_threshold = profile.threshold();
    }

    /// Detector score floor for a detection mode.
    pub fn detection_confidence(&self, mode: DetectionMode) -> f32 {
        match mode {
            DetectionMode::Register => self.detection_confidence_register,
            DetectionMode::Recognize => self.detection_confidence_recognize,
            DetectionMode::Precise => self.detection_confidence_precise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_thresholds() {
        assert_eq!(Profile::HighSecurity.threshold(), 0.25);
        assert_eq!(Profile::Balanced.threshold(), 0.42);
        assert_eq!(Profile::Fast.threshold(), 0.55);
        assert_eq!(Profile::Permissive.threshold(), 0.65);
    }

    #[test]
    fn profile_parse() {
        assert_eq!(Profile::parse("balanced"), Some(Profile::Balanced));
        assert_eq!(Profile::parse("HIGH_SECURITY"), Some(Profile::HighSecurity));
        assert_eq!(Profile::parse("strict"), None);
    }

    #[test]
    fn defaults_match_operating_point() {
        let cfg = RecognitionConfig::from_data_dir(PathBuf::from("/tmp/visage"));
        assert_eq!(cfg.confidence_threshold, 0.42);
        assert_eq!(cfg.index.dim, 128);
        assert_eq!(cfg.index.max_elements, 1_100_000);
        assert_eq!(cfg.max_batch_size, 50);
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(1800));
    }

    #[test]
    fn apply_profile_changes_threshold_only() {
        let mut cfg = RecognitionConfig::from_data_dir(PathBuf::from("/tmp/visage"));
        let min_face = cfg.min_face_size;
        cfg.apply_profile(Profile::Fast);
        assert_eq!(cfg.confidence_threshold, 0.55);
        assert_eq!(cfg.min_face_size, min_face);
    }
}
