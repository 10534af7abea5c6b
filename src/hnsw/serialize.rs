//! Binary save/load for the HNSW graph.
//!
//! Layout, all integers little-endian:
//!
//! - Magic: `MDBINDEX` (8 bytes)
//! - Header: FormatVersion u32, Dim u32, M u32, EfConstruction u32,
//!   EntryPoint u64 (`u64::MAX` = none), MaxLayer u8
//! - Vectors: Count u32, then per point Label u64 + Dim × f32
//! - Tombstones: Count u32, then Label u64 each
//! - Nodes: Count u32, then per node Label u64, TopLayer u8, and per
//!   layer NeighborCount u32 + neighbor labels u64
//!
//! Anything structurally wrong on load is `DbError::IndexCorrupt`; the
//! engine treats such a file as absent and keeps serving records.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::index::HnswIndex;
use super::node::Node;
use crate::error::{DbError, Result};

const MAGIC: &[u8; 8] = b"MDBINDEX";
const FORMAT_VERSION: u32 = 1;
const NO_ENTRY: u64 = u64::MAX;

impl HnswIndex {
    /// Serialize the graph, vectors, and tombstones to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&(self.dim as u32).to_le_bytes())?;
        w.write_all(&(self.m as u32).to_le_bytes())?;
        w.write_all(&(self.ef_construction as u32).to_le_bytes())?;
        w.write_all(&self.entry_point.unwrap_or(NO_ENTRY).to_le_bytes())?;
        w.write_all(&[self.max_layer as u8])?;

        w.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        // Iterate nodes so the on-disk order is stable across saves.
        for node in &self.nodes {
            let vector = self
                .vectors
                .get(&node.label)
                .ok_or_else(|| DbError::IndexCorrupt(format!("no vector for label {}", node.label)))?;
            w.write_all(&node.label.to_le_bytes())?;
            for &x in vector {
                w.write_all(&x.to_le_bytes())?;
            }
        }

        w.write_all(&(self.deleted.len() as u32).to_le_bytes())?;
        for &label in &self.deleted {
            w.write_all(&label.to_le_bytes())?;
        }

        w.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        for node in &self.nodes {
            w.write_all(&node.label.to_le_bytes())?;
            w.write_all(&[node.top_layer() as u8])?;
            for layer in &node.layers {
                w.write_all(&(layer.len() as u32).to_le_bytes())?;
                for &neighbor in layer {
                    w.write_all(&neighbor.to_le_bytes())?;
                }
            }
        }

        w.flush()?;
        Ok(())
    }

    /// Restore an index from `path`, checking it was built for `dim`.
    pub fn load<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self> {
        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 8];
        read_exact(&mut r, &mut magic)?;
        if &magic != MAGIC {
            return Err(DbError::IndexCorrupt("bad magic".into()));
        }

        let version = read_u32(&mut r)?;
        if version != FORMAT_VERSION {
            return Err(DbError::IndexCorrupt(format!(
                "unsupported format version {version}"
            )));
        }

        let stored_dim = read_u32(&mut r)? as usize;
        if stored_dim != dim {
            return Err(DbError::IndexCorrupt(format!(
                "index dim {stored_dim} does not match table dim {dim}"
            )));
        }

        let m = read_u32(&mut r)? as usize;
        let ef_construction = read_u32(&mut r)? as usize;
        let entry_raw = read_u64(&mut r)?;
        let entry_point = if entry_raw == NO_ENTRY {
            None
        } else {
            Some(entry_raw)
        };
        let max_layer = read_u8(&mut r)? as usize;

        if m == 0 || m > 1024 {
            return Err(DbError::IndexCorrupt(format!("implausible M value {m}")));
        }

        let num_vectors = read_u32(&mut r)? as usize;
        let mut vectors: HashMap<u64, Vec<f32>> = HashMap::with_capacity(num_vectors);
        for _ in 0..num_vectors {
            let label = read_u64(&mut r)?;
            let mut v = Vec::with_capacity(dim);
            for _ in 0..dim {
                v.push(read_f32(&mut r)?);
            }
            vectors.insert(label, v);
        }

        let num_deleted = read_u32(&mut r)? as usize;
        let mut deleted: HashSet<u64> = HashSet::with_capacity(num_deleted);
        for _ in 0..num_deleted {
            deleted.insert(read_u64(&mut r)?);
        }

        let num_nodes = read_u32(&mut r)? as usize;
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let label = read_u64(&mut r)?;
            let top_layer = read_u8(&mut r)? as usize;
            let mut layers = Vec::with_capacity(top_layer + 1);
            for _ in 0..=top_layer {
                let count = read_u32(&mut r)? as usize;
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(read_u64(&mut r)?);
                }
                layers.push(neighbors);
            }
            nodes.push(Node { label, layers });
        }

        validate_parts(&nodes, &vectors, &deleted, entry_point)?;

        Ok(HnswIndex::from_parts(
            dim,
            m,
            ef_construction,
            entry_point,
            max_layer,
            nodes,
            vectors,
            deleted,
        ))
    }
}

/// Structural integrity checks before the graph is trusted: every node
/// has a vector, adjacency stays inside the label set, and the entry
/// point exists.
fn validate_parts(
    nodes: &[Node],
    vectors: &HashMap<u64, Vec<f32>>,
    deleted: &HashSet<u64>,
    entry_point: Option<u64>,
) -> Result<()> {
    let labels: HashSet<u64> = nodes.iter().map(|n| n.label).collect();
    if labels.len() != nodes.len() {
        return Err(DbError::IndexCorrupt("duplicate node labels".into()));
    }
    if let Some(ep) = entry_point {
        if !labels.contains(&ep) {
            return Err(DbError::IndexCorrupt(format!("entry point {ep} missing")));
        }
    } else if !nodes.is_empty() {
        return Err(DbError::IndexCorrupt(
            "non-empty graph without entry point".into(),
        ));
    }
    for node in nodes {
        if !vectors.contains_key(&node.label) {
            return Err(DbError::IndexCorrupt(format!(
                "node {} has no stored vector",
                node.label
            )));
        }
        for layer in &node.layers {
            for neighbor in layer {
                if !labels.contains(neighbor) {
                    return Err(DbError::IndexCorrupt(format!(
                        "edge to unknown label {neighbor}"
                    )));
                }
            }
        }
    }
    for label in deleted {
        if !labels.contains(label) {
            return Err(DbError::IndexCorrupt(format!(
                "tombstone for unknown label {label}"
            )));
        }
    }
    Ok(())
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf)
        .map_err(|e| DbError::IndexCorrupt(format!("truncated index file: {e}")))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_preserves_search_results() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.index");

        let mut index = HnswIndex::with_seed(4, 16, 42);
        for i in 0..25u64 {
            index
                .add_point(&[i as f32, 1.0, 0.0, -(i as f32)], i)
                .unwrap();
        }
        index.mark_deleted(7);
        index.save(&path).unwrap();

        let loaded = HnswIndex::load(&path, 4).unwrap();
        assert_eq!(loaded.live_len(), 24);

        let query = [12.0f32, 1.0, 0.0, -12.0];
        let before: Vec<u64> = index.search_knn(&query, 5).iter().map(|&(_, l)| l).collect();
        let after: Vec<u64> = loaded.search_knn(&query, 5).iter().map(|&(_, l)| l).collect();
        assert_eq!(before, after);

        // Tombstone survives the roundtrip.
        let hits = loaded.search_knn(&[7.0, 1.0, 0.0, -7.0], 25);
        assert!(hits.iter().all(|&(_, l)| l != 7));
    }

    #[test]
    fn empty_index_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.index");

        let index = HnswIndex::with_seed(8, 4, 1);
        index.save(&path).unwrap();
        let loaded = HnswIndex::load(&path, 8).unwrap();
        assert_eq!(loaded.live_len(), 0);
        assert!(loaded.search_knn(&[0.0; 8], 3).is_empty());
    }

    #[test]
    fn dim_mismatch_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dim.index");

        let mut index = HnswIndex::with_seed(3, 4, 1);
        index.add_point(&[1.0, 2.0, 3.0], 0).unwrap();
        index.save(&path).unwrap();

        let err = HnswIndex::load(&path, 5).unwrap_err();
        assert!(matches!(err, DbError::IndexCorrupt(_)));
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.index");
        std::fs::write(&path, b"not an index at all").unwrap();

        let err = HnswIndex::load(&path, 3).unwrap_err();
        assert!(matches!(err, DbError::IndexCorrupt(_)));
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.index");

        let mut index = HnswIndex::with_seed(4, 8, 9);
        for i in 0..10u64 {
            index.add_point(&[i as f32; 4], i).unwrap();
        }
        index.save(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = HnswIndex::load(&path, 4).unwrap_err();
        assert!(matches!(err, DbError::IndexCorrupt(_)));
    }
}
