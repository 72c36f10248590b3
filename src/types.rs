//! Core data model types.
//!
//! A raw click-log row decodes into a [`Record`]. Rows of one day are held column-wise, first as
//! a [`RawDay`] (integer features, raw categorical keys) and after transformation as a
//! [`DayArrays`] (log-scaled dense features, dense categorical indices). The concatenated output
//! is a [`DataSet`].

/// Number of continuous (dense) features per row.
pub const NUM_DENSE: usize = 13;

/// Number of categorical (sparse) features per row.
pub const NUM_SPARSE: usize = 26;

/// Number of delimited fields on one raw line: label, dense features, categorical features.
pub const NUM_FIELDS: usize = 1 + NUM_DENSE + NUM_SPARSE;

/// One decoded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// Click label (0 or 1).
    pub label: i32,
    /// Integer continuous features as they appear in the log.
    pub continuous: [i32; NUM_DENSE],
    /// Categorical keys, reduced modulo `max_ind_range` when configured.
    pub categorical: [u32; NUM_SPARSE],
}

/// Positive/negative label tally for a day or bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelCounts {
    /// Rows with label 1.
    pub positive: usize,
    /// Rows with label 0.
    pub negative: usize,
}

impl LabelCounts {
    /// Total number of rows counted.
    pub fn total(&self) -> usize {
        self.positive + self.negative
    }
}

/// Decoded rows of one day, before any transformation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDay {
    pub labels: Vec<i32>,
    pub continuous: Vec<[i32; NUM_DENSE]>,
    pub categorical: Vec<[u32; NUM_SPARSE]>,
}

impl RawDay {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            labels: Vec::with_capacity(rows),
            continuous: Vec::with_capacity(rows),
            categorical: Vec::with_capacity(rows),
        }
    }

    pub fn push(&mut self, record: Record) {
        self.labels.push(record.label);
        self.continuous.push(record.continuous);
        self.categorical.push(record.categorical);
    }

    pub fn row_count(&self) -> usize {
        self.labels.len()
    }
}

/// Transformed rows of one day or bucket, stored as three parallel columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayArrays {
    /// Labels.
    pub labels: Vec<i32>,
    /// `ln(max(x, 0) + 1)` of every continuous feature.
    pub continuous: Vec<[f32; NUM_DENSE]>,
    /// Dense vocabulary index of every categorical feature.
    pub categorical: Vec<[u32; NUM_SPARSE]>,
}

impl DayArrays {
    /// Create empty arrays with room for `rows` rows.
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            labels: Vec::with_capacity(rows),
            continuous: Vec::with_capacity(rows),
            categorical: Vec::with_capacity(rows),
        }
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Append one row.
    pub fn push(&mut self, label: i32, continuous: [f32; NUM_DENSE], categorical: [u32; NUM_SPARSE]) {
        self.labels.push(label);
        self.continuous.push(continuous);
        self.categorical.push(categorical);
    }

    /// Append row `idx` of `other`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds for `other`.
    pub fn push_row_from(&mut self, other: &DayArrays, idx: usize) {
        self.push(other.labels[idx], other.continuous[idx], other.categorical[idx]);
    }

    /// Append all rows of `other`.
    pub fn extend_from(&mut self, other: &DayArrays) {
        self.labels.extend_from_slice(&other.labels);
        self.continuous.extend_from_slice(&other.continuous);
        self.categorical.extend_from_slice(&other.categorical);
    }

    /// Return a copy whose row `k` is row `order[k]` of `self`.
    ///
    /// # Panics
    ///
    /// Panics if `order` contains an index out of bounds.
    pub fn gather(&self, order: &[usize]) -> Self {
        let mut out = Self::with_capacity(order.len());
        for &idx in order {
            out.push_row_from(self, idx);
        }
        out
    }

    /// Count positive and negative labels.
    pub fn label_counts(&self) -> LabelCounts {
        let positive = self.labels.iter().filter(|&&y| y == 1).count();
        LabelCounts {
            positive,
            negative: self.labels.len() - positive,
        }
    }
}

/// The concatenated output dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSet {
    /// Row storage, buckets laid out back to back in bucket order.
    pub arrays: DayArrays,
    /// Number of rows contributed by each bucket, in order.
    pub bucket_sizes: Vec<usize>,
}

impl DataSet {
    /// Number of rows in the dataset.
    pub fn row_count(&self) -> usize {
        self.arrays.row_count()
    }

    /// Row range occupied by `bucket`, if it exists.
    pub fn bucket_range(&self, bucket: usize) -> Option<std::ops::Range<usize>> {
        if bucket >= self.bucket_sizes.len() {
            return None;
        }
        let start: usize = self.bucket_sizes[..bucket].iter().sum();
        Some(start..start + self.bucket_sizes[bucket])
    }
}
