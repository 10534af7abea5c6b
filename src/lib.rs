//! MidDB: a hybrid record store.
//!
//! Records carry free-form string fields and a dense embedding, side by
//! side in named tables. Three query shapes run over them: exact field
//! equality, approximate k-nearest-neighbour over embeddings, and a
//! hybrid that intersects the two.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │   /insert /update /delete /queryField /queryEmbedding ...   │
//! └─────────────────────────────────────────────────────────────┘
//!               │ writes enqueue          │ reads (shared lock)
//!               ▼                         ▼
//! ┌──────────────────────┐   ┌─────────────────────────────────┐
//! │    Write pipeline    │──▶│        Database engine          │
//! │  one worker, batches │   │  tables: records + field index  │
//! └──────────────────────┘   │        + HNSW per table         │
//!               │            └─────────────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      Persistence: <table>.json + <table>.index per table    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes are asynchronous: accepted at enqueue, applied in batches by a
//! single worker, snapshotted after each batch. Reads go straight to the
//! in-memory state. On restart the storage directory is scanned and
//! every table is rebuilt from its snapshot plus serialized graph.

pub mod engine;
pub mod error;
pub mod hnsw;
pub mod server;
pub mod simd;

pub use engine::{Config, Database};
pub use error::{DbError, Result};
pub use hnsw::HnswIndex;
