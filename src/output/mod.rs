//! Output sinks for the concatenated dataset.
//!
//! The concatenator hands every finished bucket, in bucket order, to a [`DatasetSink`]:
//!
//! - [`MemorySink`] collects an in-memory [`DataSet`]
//! - [`CountingSink`] keeps only the bucket sizes
//! - [`parquet::ParquetSink`] streams one row group per bucket into a Parquet file

pub mod parquet;

use crate::error::PreprocessResult;
use crate::types::{DataSet, DayArrays};

pub use self::parquet::{read_parquet_dataset, ParquetSink};

/// Receives finished buckets in bucket order.
pub trait DatasetSink {
    /// Append the rows of `bucket`.
    fn write_bucket(&mut self, bucket: usize, arrays: &DayArrays) -> PreprocessResult<()>;

    /// Called once after the last bucket. Nothing is published before this succeeds.
    fn finish(&mut self) -> PreprocessResult<()> {
        Ok(())
    }
}

/// Collects all buckets into an in-memory [`DataSet`].
#[derive(Debug, Default)]
pub struct MemorySink {
    dataset: DataSet,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected dataset.
    pub fn into_dataset(self) -> DataSet {
        self.dataset
    }
}

impl DatasetSink for MemorySink {
    fn write_bucket(&mut self, _bucket: usize, arrays: &DayArrays) -> PreprocessResult<()> {
        self.dataset.arrays.extend_from(arrays);
        self.dataset.bucket_sizes.push(arrays.row_count());
        Ok(())
    }
}

/// Records bucket sizes and drops the rows.
#[derive(Debug, Default)]
pub struct CountingSink {
    bucket_sizes: Vec<usize>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_sizes(&self) -> &[usize] {
        &self.bucket_sizes
    }

    pub fn row_count(&self) -> usize {
        self.bucket_sizes.iter().sum()
    }
}

impl DatasetSink for CountingSink {
    fn write_bucket(&mut self, bucket: usize, arrays: &DayArrays) -> PreprocessResult<()> {
        debug_assert_eq!(bucket, self.bucket_sizes.len());
        self.bucket_sizes.push(arrays.row_count());
        Ok(())
    }
}
