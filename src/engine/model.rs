//! Record type and HTTP body shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A stored record: free-form string fields plus one embedding.
///
/// `label` is the integer surrogate key the ANN index knows this record
/// by. It is assigned at first insert and never changes or gets reused
/// within the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub fields: HashMap<String, String>,
    pub embedding: Vec<f32>,
    pub label: u64,
}

/// Body of `POST /insert` and `POST /update` (both are upserts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRequest {
    pub table: String,
    pub id: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    pub embedding: Vec<f32>,
}

/// Body of `POST /delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub table: String,
    pub id: String,
}

/// Body of `POST /queryEmbedding/{table}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingQueryRequest {
    pub embedding: Vec<f32>,
    #[serde(default = "default_top_k", rename = "topK")]
    pub top_k: usize,
}

/// Body of `POST /queryHybrid/{table}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridQueryRequest {
    pub field: String,
    pub value: String,
    pub embedding: Vec<f32>,
    #[serde(default = "default_top_k", rename = "topK")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusBody {
    pub status: &'static str,
}

impl StatusBody {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub tables: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStatsBody {
    pub records: usize,
    pub dim: usize,
    pub next_label: u64,
}
