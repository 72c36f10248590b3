//! Categorical vocabularies: raw key → dense index, one per categorical column.
//!
//! Indices are assigned in first-seen order over the whole corpus, walking days in day order and
//! rows in row order. Day workers only collect their own first-seen-ordered key sets
//! ([`DayUniques`]); [`merge_day_uniques`] unions them in day order, so the result does not depend
//! on which worker finished first.

use std::fs;
use std::path::Path;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::error::{PreprocessError, PreprocessResult};
use crate::types::NUM_SPARSE;

/// Keys observed in one day, per column, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayUniques {
    columns: Vec<IndexSet<u32>>,
}

impl Default for DayUniques {
    fn default() -> Self {
        Self::new()
    }
}

impl DayUniques {
    pub fn new() -> Self {
        Self {
            columns: vec![IndexSet::new(); NUM_SPARSE],
        }
    }

    /// Record the categorical keys of one row.
    pub fn observe(&mut self, keys: &[u32; NUM_SPARSE]) {
        for (set, &key) in self.columns.iter_mut().zip(keys.iter()) {
            set.insert(key);
        }
    }

    /// Keys of `column` in first-seen order.
    pub fn column(&self, column: usize) -> &IndexSet<u32> {
        &self.columns[column]
    }
}

/// Injective map from raw key to dense index in `[0, count)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnVocabulary {
    keys: IndexSet<u32>,
}

impl ColumnVocabulary {
    /// Build from keys listed in index order. Duplicate keys are rejected.
    pub fn from_keys(column: usize, keys: impl IntoIterator<Item = u32>) -> PreprocessResult<Self> {
        let mut set = IndexSet::new();
        for key in keys {
            if !set.insert(key) {
                return Err(PreprocessError::InvalidVocabulary {
                    column,
                    message: format!("duplicate key {key}"),
                });
            }
        }
        Ok(Self { keys: set })
    }

    /// Number of distinct keys.
    pub fn count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Dense index of `key`, if it was observed.
    pub fn index_of(&self, key: u32) -> Option<u32> {
        self.keys.get_index_of(&key).map(|i| i as u32)
    }

    /// Dense index of `key`, falling back to 0 for unseen keys.
    pub fn index_or_default(&self, key: u32) -> u32 {
        self.index_of(key).unwrap_or(0)
    }

    /// Raw key assigned to `index`.
    pub fn key_of(&self, index: u32) -> Option<u32> {
        self.keys.get_index(index as usize).copied()
    }

    /// Keys in index order.
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.iter().copied()
    }
}

/// The vocabularies of all categorical columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularySet {
    columns: Vec<ColumnVocabulary>,
}

impl VocabularySet {
    /// Wrap exactly [`NUM_SPARSE`] column vocabularies.
    pub fn new(columns: Vec<ColumnVocabulary>) -> PreprocessResult<Self> {
        if columns.len() != NUM_SPARSE {
            return Err(PreprocessError::InvalidVocabulary {
                column: columns.len(),
                message: format!("expected {NUM_SPARSE} columns, found {}", columns.len()),
            });
        }
        Ok(Self { columns })
    }

    pub fn column(&self, column: usize) -> &ColumnVocabulary {
        &self.columns[column]
    }

    pub fn columns(&self) -> &[ColumnVocabulary] {
        &self.columns
    }

    /// Per-column number of distinct keys.
    pub fn counts(&self) -> Vec<usize> {
        self.columns.iter().map(ColumnVocabulary::count).collect()
    }

    /// Map raw keys to dense indices (unseen keys map to 0).
    pub fn encode(&self, keys: &[u32; NUM_SPARSE]) -> [u32; NUM_SPARSE] {
        let mut out = [0u32; NUM_SPARSE];
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = self.columns[j].index_or_default(keys[j]);
        }
        out
    }

    /// Map dense indices back to raw keys. `None` if any index is out of range.
    pub fn decode(&self, indices: &[u32; NUM_SPARSE]) -> Option<[u32; NUM_SPARSE]> {
        let mut out = [0u32; NUM_SPARSE];
        for (j, slot) in out.iter_mut().enumerate() {
            *slot = self.columns[j].key_of(indices[j])?;
        }
        Some(out)
    }

    /// Check that every column is a bijection onto `[0, count)`.
    pub fn verify(&self) -> PreprocessResult<()> {
        for (j, col) in self.columns.iter().enumerate() {
            for (i, key) in col.keys().enumerate() {
                if col.index_of(key) != Some(i as u32) {
                    return Err(PreprocessError::InvalidVocabulary {
                        column: j,
                        message: format!("key {key} is not assigned index {i}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Persist the vocabularies as JSON (written to a temporary file, then renamed).
    pub fn save_json(&self, path: impl AsRef<Path>) -> PreprocessResult<()> {
        let path = path.as_ref();
        let file = VocabularyFile {
            columns: self
                .columns
                .iter()
                .enumerate()
                .map(|(column, vocab)| VocabularyColumn {
                    column,
                    count: vocab.count(),
                    keys: vocab.keys().collect(),
                })
                .collect(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load vocabularies written by [`Self::save_json`].
    pub fn load_json(path: impl AsRef<Path>) -> PreprocessResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PreprocessError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let file: VocabularyFile = serde_json::from_slice(&fs::read(path)?)?;
        let mut columns = Vec::with_capacity(file.columns.len());
        for (expected, col) in file.columns.into_iter().enumerate() {
            if col.column != expected {
                return Err(PreprocessError::InvalidVocabulary {
                    column: col.column,
                    message: format!("columns out of order, expected column {expected}"),
                });
            }
            if col.count != col.keys.len() {
                return Err(PreprocessError::InvalidVocabulary {
                    column: col.column,
                    message: format!("count {} does not match {} keys", col.count, col.keys.len()),
                });
            }
            columns.push(ColumnVocabulary::from_keys(col.column, col.keys)?);
        }
        Self::new(columns)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    columns: Vec<VocabularyColumn>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VocabularyColumn {
    column: usize,
    count: usize,
    /// Raw keys in index order.
    keys: Vec<u32>,
}

/// Union per-day key sets in day order and assign dense indices in first-seen order.
///
/// `days` must be ordered by day index.
pub fn merge_day_uniques(days: &[DayUniques]) -> VocabularySet {
    let columns = (0..NUM_SPARSE)
        .map(|j| {
            let mut keys = IndexSet::new();
            for day in days {
                keys.extend(day.column(j).iter().copied());
            }
            ColumnVocabulary { keys }
        })
        .collect();
    VocabularySet { columns }
}
