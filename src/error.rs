//! Error model for the recognition service.
//!
//! Propagation policy: cache, metrics, and log-append failures are swallowed
//! at the call site (logged, never returned). Index mutation failures during
//! enroll/update are swallowed and surfaced only through metrics — the
//! descriptor store stays authoritative and a rebuild reconciles. Descriptor
//! store failures are fatal to the calling operation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("no face detected")]
    NoFace,

    #[error("face too small: {size}px (minimum {min}px)")]
    FaceTooSmall { size: u32, min: u32 },

    #[error("face too large: {size}px (maximum {max}px)")]
    FaceTooLarge { size: u32, max: u32 },

    #[error("detection quality too low: {score:.2}")]
    LowQuality { score: f32 },

    #[error("external id already registered: {0}")]
    Duplicate(String),

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("index capacity exceeded: {max} vectors")]
    CapacityExceeded { max: u64 },

    #[error("index not initialized")]
    NotInitialized,

    #[error("operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RecognitionError {
    /// Stable machine-readable code, used in API bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            RecognitionError::InvalidImage(_) => "invalid_image",
            RecognitionError::NoFace => "no_face",
            RecognitionError::FaceTooSmall { .. } => "face_too_small",
            RecognitionError::FaceTooLarge { .. } => "face_too_large",
            RecognitionError::LowQuality { .. } => "low_quality",
            RecognitionError::Duplicate(_) => "duplicate",
            RecognitionError::NotFound(_) => "not_found",
            RecognitionError::CapacityExceeded { .. } => "capacity_exceeded",
            RecognitionError::NotInitialized => "not_initialized",
            RecognitionError::Timeout { .. } => "timeout",
            RecognitionError::Internal(_) => "internal",
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        RecognitionError::Internal(err.to_string())
    }
}
