//! HNSW (Hierarchical Navigable Small World) index.
//!
//! A multi-layer graph for approximate nearest-neighbor search in L2 space.
//!
//! ```text
//! Layer 2: o--------------------o   (few slots, long-range hops)
//!          |                    |
//! Layer 1: o----o------o--------o   (more slots)
//!          |    |      |        |
//! Layer 0: o-o-o-o-o-o-o-o-o-o-o-o  (every slot)
//! ```
//!
//! Queries hill-climb through the sparse layers, then beam-search the base
//! layer with `ef` candidates. See `index` for the slot-table storage
//! layout and `serialize` for the column-oriented wire format.

mod index;
mod serialize;
mod visited;

pub use index::{Hnsw, HnswStats};
