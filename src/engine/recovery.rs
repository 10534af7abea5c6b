//! Startup recovery: rebuild every table from the storage directory.
//!
//! Each `<table>.json` becomes a table; `records`, `label_to_id`, and
//! the field index are rebuilt from the snapshot, `dim` comes from the
//! first record, and `next_label` is one past the highest stored label.
//! A readable `<table>.index` is attached as the ANN graph; an
//! unreadable one is logged and treated as absent — the records survive
//! and the graph repopulates as inserts arrive.

use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;
use crate::hnsw::HnswIndex;

use super::snapshot;
use super::table::Table;

/// `[A-Za-z0-9_]+`, the shape every table name must have.
pub fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Scan `data_dir` and reconstruct all tables found there.
pub fn load_tables(data_dir: &Path) -> Result<HashMap<String, Table>> {
    std::fs::create_dir_all(data_dir)?;

    let mut tables = HashMap::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !valid_table_name(name) {
            tracing::warn!(file = %path.display(), "skipping snapshot with invalid table name");
            continue;
        }

        let records = match snapshot::read_records(&path) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(table = name, error = %e, "skipping unreadable snapshot");
                continue;
            }
        };
        let mut table = Table::from_records(records);

        let index_path = snapshot::index_path(data_dir, name);
        if table.dim() > 0 && index_path.exists() {
            match HnswIndex::load(&index_path, table.dim()) {
                Ok(ann) => table.ann = Some(ann),
                Err(e) => {
                    tracing::warn!(
                        table = name,
                        error = %e,
                        "ANN index unreadable, continuing without it"
                    );
                }
            }
        }

        tracing::info!(
            table = name,
            records = table.len(),
            dim = table.dim(),
            next_label = table.next_label(),
            "recovered table"
        );
        tables.insert(name.to_string(), table);
    }
    Ok(tables)
}
