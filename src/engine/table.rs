//! Per-table aggregate: records, label map, inverted field index, and
//! the table's ANN index handle.
//!
//! A table keeps four views of the same data in lockstep:
//!
//! - `records`: id → record (the source of truth)
//! - `label_to_id`: label → id, a bijection with the live records
//! - `field_index`: field → value → sorted id set, for exact-match lookups
//! - `ann`: the HNSW graph over embeddings, keyed by label
//!
//! The engine's reader/writer lock serializes all access, so nothing in
//! here synchronizes.

use std::collections::{BTreeSet, HashMap};

use crate::error::{DbError, Result};
use crate::hnsw::HnswIndex;

use super::model::Record;

pub struct Table {
    pub(crate) records: HashMap<String, Record>,
    pub(crate) label_to_id: HashMap<u64, String>,
    pub(crate) field_index: HashMap<String, HashMap<String, BTreeSet<String>>>,
    pub(crate) ann: Option<HnswIndex>,
    /// Embedding length, fixed by the first insert (or snapshot load).
    /// Zero only while the table has never held a record.
    pub(crate) dim: usize,
    /// Next label to allocate. Monotonic; deleted labels are never reused.
    pub(crate) next_label: u64,
}

impl Table {
    pub fn new(dim: usize) -> Self {
        Self {
            records: HashMap::new(),
            label_to_id: HashMap::new(),
            field_index: HashMap::new(),
            ann: None,
            dim,
            next_label: 0,
        }
    }

    /// Rebuild a table from a parsed snapshot. `dim` comes from the
    /// first record, `next_label` from the highest stored label; the
    /// field index is derived, not persisted. The ANN index is attached
    /// separately by recovery.
    pub fn from_records(records: HashMap<String, Record>) -> Self {
        let mut table = Self::new(0);
        for (id, record) in &records {
            if table.dim == 0 {
                table.dim = record.embedding.len();
            }
            table.label_to_id.insert(record.label, id.clone());
            table.next_label = table.next_label.max(record.label + 1);
            for (field, value) in &record.fields {
                table
                    .field_index
                    .entry(field.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        table.records = records;
        table
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn next_label(&self) -> u64 {
        self.next_label
    }

    /// Insert or replace a record.
    ///
    /// A new id allocates the next label; an existing id keeps its label
    /// and gets its point overwritten in the graph. Old field entries
    /// are removed before the new ones land, so replaced values never
    /// linger in the index.
    pub fn upsert(
        &mut self,
        id: &str,
        fields: HashMap<String, String>,
        embedding: Vec<f32>,
        ann_capacity: usize,
    ) -> Result<()> {
        if self.dim == 0 {
            self.dim = embedding.len();
        }
        if embedding.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: embedding.len(),
            });
        }

        let existing = self
            .records
            .get(id)
            .map(|record| (record.label, record.fields.clone()));
        let label = match existing {
            Some((label, old_fields)) => {
                self.unindex_fields(id, &old_fields);
                label
            }
            None => {
                let label = self.next_label;
                self.next_label += 1;
                label
            }
        };

        let ann = self
            .ann
            .get_or_insert_with(|| HnswIndex::new(self.dim, ann_capacity));
        ann.add_point(&embedding, label)?;

        for (field, value) in &fields {
            self.field_index
                .entry(field.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.label_to_id.insert(label, id.to_string());
        self.records.insert(
            id.to_string(),
            Record {
                fields,
                embedding,
                label,
            },
        );
        Ok(())
    }

    /// Remove a record if present. The label stays allocated and is
    /// tombstoned in the graph. Returns whether anything was removed.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };
        let fields = record.fields;
        self.unindex_fields(id, &fields);
        self.label_to_id.remove(&record.label);
        if let Some(ann) = self.ann.as_mut() {
            ann.mark_deleted(record.label);
        }
        true
    }

    /// Exact-match lookup. IDs come back lexicographically sorted.
    pub fn query_field(&self, field: &str, value: &str) -> Vec<String> {
        self.field_index
            .get(field)
            .and_then(|values| values.get(value))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// k-NN over embeddings, mapped back to record ids.
    pub fn query_embedding(&self, query: &[f32], top_k: usize) -> Result<Vec<String>> {
        if self.dim > 0 && query.len() != self.dim {
            return Err(DbError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        let Some(ann) = self.ann.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(ann
            .search_knn(query, top_k)
            .into_iter()
            .filter_map(|(_, label)| self.label_to_id.get(&label).cloned())
            .collect())
    }

    fn unindex_fields(&mut self, id: &str, fields: &HashMap<String, String>) {
        for (field, value) in fields {
            let Some(values) = self.field_index.get_mut(field) else {
                continue;
            };
            if let Some(ids) = values.get_mut(value) {
                ids.remove(id);
                if ids.is_empty() {
                    values.remove(value);
                }
            }
            if values.is_empty() {
                self.field_index.remove(field);
            }
        }
    }

    /// Structural consistency checks used by tests.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.records.len(), self.label_to_id.len());
        for (id, record) in &self.records {
            assert_eq!(record.embedding.len(), self.dim);
            assert!(record.label < self.next_label);
            assert_eq!(self.label_to_id.get(&record.label), Some(id));
            for (field, value) in &record.fields {
                let bucket = self
                    .field_index
                    .get(field)
                    .and_then(|values| values.get(value))
                    .unwrap_or_else(|| panic!("missing index bucket {field}={value}"));
                assert!(bucket.contains(id));
            }
        }
        for (field, values) in &self.field_index {
            for (value, ids) in values {
                for id in ids {
                    let record = self
                        .records
                        .get(id)
                        .unwrap_or_else(|| panic!("index entry for dead record {id}"));
                    assert_eq!(record.fields.get(field), Some(value));
                }
            }
        }
    }
}
