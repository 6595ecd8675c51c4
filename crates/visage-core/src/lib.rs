//! visage-core: an in-memory HNSW index over squared-L2 distance.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Hnsw (graph)                           │
//! │       multi-layer navigable small-world over labels         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ vector accessor
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                caller-owned descriptor table                │
//! │              label → [f32; dim] (L2 point space)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The graph never owns vectors; the caller supplies an accessor closure
//! mapping a label to its descriptor. Distances are squared Euclidean
//! throughout — callers that need metric distance take the square root at
//! their own boundary.

pub mod container;
pub mod hnsw;
pub mod simd;

pub use container::{ContainerError, ContainerHeader, read_container, write_container};
pub use hnsw::Hnsw;
pub use simd::{l2_distance, l2_distance_squared, l2_normalized};
