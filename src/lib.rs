//! Visage-DB: a face-recognition service over an HNSW descriptor index
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │        /recognition/*, /metrics, /health, /health/*         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Recognition coordinator                   │
//! │        cache → detect/embed → ANN search → threshold        │
//! └─────────────────────────────────────────────────────────────┘
//!            │                 │                  │
//!            ▼                 ▼                  ▼
//! ┌───────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ Result cache  │  │    Face index    │  │ Descriptor store │
//! │ redis/memory  │  │ HNSW + user maps │  │ SQLite (users)   │
//! └───────────────┘  └──────────────────┘  └──────────────────┘
//! ```

pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod embedder;
pub mod error;
pub mod index;
pub mod metrics;
pub mod model;
pub mod recognizer;
pub mod store;

pub use api::{create_router, ServiceState};
pub use batch::BatchEngine;
pub use cache::ResultCache;
pub use config::{Profile, RecognitionConfig};
pub use embedder::{DetectionMode, FaceEmbedder, OnnxEmbedder, StubEmbedder};
pub use error::RecognitionError;
pub use index::FaceIndex;
pub use metrics::Metrics;
pub use recognizer::Recognizer;
pub use store::{DescriptorStore, MemoryStore, SqliteStore};
