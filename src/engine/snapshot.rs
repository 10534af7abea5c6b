//! Per-table persistence: a JSON snapshot of the records and the
//! serialized ANN graph next to it.
//!
//! Each flush rewrites the whole table. Both files go through a
//! write-to-temp-then-rename so a crash mid-flush leaves the previous
//! snapshot intact rather than a torn one. The field index is derived
//! state and is not persisted.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

use super::model::Record;
use super::table::Table;

/// Bumped when the on-disk snapshot shape changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    version: u32,
    records: &'a HashMap<String, Record>,
}

#[derive(Deserialize)]
struct SnapshotFile {
    version: u32,
    records: HashMap<String, Record>,
}

pub fn snapshot_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.json"))
}

pub fn index_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.index"))
}

/// Write one table's snapshot and graph under `dir`.
pub fn write_table(dir: &Path, name: &str, table: &Table) -> Result<()> {
    write_table_inner(dir, name, table).map_err(|e| match e {
        DbError::Io(source) => DbError::Snapshot {
            table: name.to_string(),
            source,
        },
        other => other,
    })
}

fn write_table_inner(dir: &Path, name: &str, table: &Table) -> Result<()> {
    let tmp = dir.join(format!("{name}.json.tmp"));
    {
        let file = File::create(&tmp)?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(
            &mut w,
            &SnapshotFileRef {
                version: SNAPSHOT_VERSION,
                records: &table.records,
            },
        )?;
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, snapshot_path(dir, name))?;

    if let Some(ann) = table.ann.as_ref() {
        let tmp = dir.join(format!("{name}.index.tmp"));
        ann.save(&tmp)?;
        sync_file(&tmp)?;
        std::fs::rename(&tmp, index_path(dir, name))?;
    }
    Ok(())
}

/// Parse a snapshot file into its record map.
///
/// Accepts the versioned envelope and, for data directories written
/// before versioning existed, a bare `id → record` map.
pub fn read_records(path: &Path) -> Result<HashMap<String, Record>> {
    let bytes = std::fs::read(path)?;
    match serde_json::from_slice::<SnapshotFile>(&bytes) {
        Ok(snapshot) => {
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(DbError::BadRequest(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            Ok(snapshot.records)
        }
        Err(_) => Ok(serde_json::from_slice::<HashMap<String, Record>>(&bytes)?),
    }
}

fn sync_file(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}
