//! Approximate nearest-neighbour index.
//!
//! A hierarchical navigable small-world graph over squared L2 distance,
//! keyed by the engine's integer labels, with soft deletion and a
//! self-contained binary file format. The engine talks to it through
//! five calls: `new`/`load`, `save`, `add_point`, `mark_deleted`,
//! `search_knn`.

mod index;
mod node;
mod serialize;

pub use index::HnswIndex;
pub use node::Node;
