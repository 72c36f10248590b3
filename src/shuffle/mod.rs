//! Two-pass external shuffle (Fisher-Yates-Rao).
//!
//! - **Pass 1** ([`redistribute_day`]): every row of a source day is written to the target bucket
//!   chosen by the [`ShufflePlan`], at the offset the plan assigns it.
//! - **Pass 2** ([`permute_bucket`]): every bucket is loaded, permuted, and written out as a
//!   finished bucket.
//!
//! With memory mapping, buckets live in files under a work directory ([`ShuffleLayout`]) and the
//! two passes run day by day and bucket by bucket. [`shuffle_in_memory`] applies the same plan to
//! in-memory buckets and produces the same rows in the same order.

pub mod plan;
pub mod storage;

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;

use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::PipelineStage;
use crate::types::DayArrays;

pub use self::plan::{permutation, BucketSampler, ShufflePlan, ShufflePolicy, TargetStream};
pub use self::storage::{BucketFiles, RangeWriter};

/// Names of the bucket files of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleLayout {
    dir: PathBuf,
    stem: String,
}

impl ShuffleLayout {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Transformed rows of input day `day`.
    pub fn processed(&self, day: usize) -> BucketFiles {
        BucketFiles::new(&self.dir, &self.stem, day, "processed")
    }

    /// Bucket `bucket` after pass 1.
    pub fn intermediate(&self, bucket: usize) -> BucketFiles {
        BucketFiles::new(&self.dir, &self.stem, bucket, "intermediate")
    }

    /// Finished bucket `bucket` after pass 2.
    pub fn reordered(&self, bucket: usize) -> BucketFiles {
        BucketFiles::new(&self.dir, &self.stem, bucket, "reordered")
    }
}

/// Create the pass 1 bucket files, each sized to its capacity.
pub fn prepare_buckets(plan: &ShufflePlan, layout: &ShuffleLayout) -> PreprocessResult<()> {
    for (bucket, &capacity) in plan.capacities().iter().enumerate() {
        layout.intermediate(bucket).allocate(capacity)?;
    }
    Ok(())
}

/// Pass 1 for one source day: write its rows into the mapped bucket files.
///
/// Each target bucket is mapped only over the range this day owns. Returns the number of rows
/// written to each bucket.
pub fn redistribute_day(
    plan: &ShufflePlan,
    source: usize,
    rows: &DayArrays,
    layout: &ShuffleLayout,
) -> PreprocessResult<Vec<usize>> {
    check_source_rows(plan, source, rows)?;
    let days = plan.days();
    let mut writers = Vec::with_capacity(days);
    for target in 0..days {
        let files = layout.intermediate(target);
        writers.push(files.map_range(plan.start(source, target), plan.count(source, target))?);
    }

    let mut written = vec![0usize; days];
    for (k, step) in plan.targets(source).enumerate() {
        let (target, offset) = step?;
        let local = offset - plan.start(source, target);
        writers[target].put(local, rows.labels[k], &rows.continuous[k], &rows.categorical[k]);
        written[target] += 1;
    }
    for writer in &writers {
        writer.flush()?;
    }
    check_written(plan, source, &written)?;
    debug!(source, written = ?written, "redistributed day");
    Ok(written)
}

/// Pass 2 for one bucket: permute the pass 1 rows and write the finished bucket.
///
/// Returns the finished bucket's row count.
pub fn permute_bucket(plan: &ShufflePlan, bucket: usize, layout: &ShuffleLayout) -> PreprocessResult<usize> {
    let capacity = plan.capacity(bucket);
    let rows = layout.intermediate(bucket).read(capacity)?;
    let finished = rows.gather(&plan.permutation(bucket));
    layout.reordered(bucket).write(&finished)?;
    debug!(bucket, rows = capacity, "permuted bucket");
    Ok(capacity)
}

/// Both passes over in-memory days. `days[i]` must hold exactly the plan's rows for day `i`.
///
/// Returns the finished buckets in bucket order.
pub fn shuffle_in_memory(plan: &ShufflePlan, days: &[DayArrays]) -> PreprocessResult<Vec<DayArrays>> {
    let buckets = redistribute_in_memory(plan, days)?;
    Ok(permute_in_memory(plan, buckets))
}

/// Pass 1 over in-memory days. Returns the pass 1 buckets in bucket order.
pub fn redistribute_in_memory(plan: &ShufflePlan, days: &[DayArrays]) -> PreprocessResult<Vec<DayArrays>> {
    if days.len() != plan.days() {
        return Err(PreprocessError::invalid_config(format!(
            "shuffle plan covers {} days, got {}",
            plan.days(),
            days.len()
        )));
    }
    let mut buckets: Vec<DayArrays> = plan
        .capacities()
        .iter()
        .map(|&capacity| DayArrays::with_capacity(capacity))
        .collect();

    // Sources append in day order, which matches the plan's offsets.
    for (source, rows) in days.iter().enumerate() {
        check_source_rows(plan, source, rows)?;
        let mut written = vec![0usize; plan.days()];
        for (k, step) in plan.targets(source).enumerate() {
            let (target, offset) = step?;
            if offset != buckets[target].row_count() {
                return Err(PreprocessError::RowCountMismatch {
                    stage: PipelineStage::Bucketed,
                    day: target,
                    expected: offset,
                    actual: buckets[target].row_count(),
                });
            }
            buckets[target].push_row_from(rows, k);
            written[target] += 1;
        }
        check_written(plan, source, &written)?;
    }
    plan.verify()?;
    Ok(buckets)
}

/// Pass 2 over in-memory buckets, one task per bucket.
pub fn permute_in_memory(plan: &ShufflePlan, buckets: Vec<DayArrays>) -> Vec<DayArrays> {
    buckets
        .into_par_iter()
        .enumerate()
        .map(|(bucket, rows)| rows.gather(&plan.permutation(bucket)))
        .collect()
}

fn check_source_rows(plan: &ShufflePlan, source: usize, rows: &DayArrays) -> PreprocessResult<()> {
    let expected: usize = plan.counts_from(source).iter().sum();
    if rows.row_count() != expected {
        return Err(PreprocessError::RowCountMismatch {
            stage: PipelineStage::Bucketed,
            day: source,
            expected,
            actual: rows.row_count(),
        });
    }
    Ok(())
}

fn check_written(plan: &ShufflePlan, source: usize, written: &[usize]) -> PreprocessResult<()> {
    for (&got, &want) in written.iter().zip(plan.counts_from(source)) {
        if got != want {
            return Err(PreprocessError::RowCountMismatch {
                stage: PipelineStage::Bucketed,
                day: source,
                expected: want,
                actual: got,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSplit, Randomize};
    use crate::types::{NUM_DENSE, NUM_SPARSE};

    /// Day `d` row `k` is tagged `d * 100 + k` in every column.
    fn days(sizes: &[usize]) -> Vec<DayArrays> {
        sizes
            .iter()
            .enumerate()
            .map(|(d, &n)| {
                let mut out = DayArrays::with_capacity(n);
                for k in 0..n {
                    let tag = (d * 100 + k) as u32;
                    out.push((k % 2) as i32, [tag as f32; NUM_DENSE], [tag; NUM_SPARSE]);
                }
                out
            })
            .collect()
    }

    fn tags(arrays: &DayArrays) -> Vec<u32> {
        arrays.categorical.iter().map(|row| row[0]).collect()
    }

    fn sorted(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn randomize_none_keeps_input_order() {
        let sizes = [3, 2, 4];
        let input = days(&sizes);
        let plan = ShufflePlan::build(ShufflePolicy::new(Randomize::None, DataSplit::None, 3), &sizes, 1).unwrap();
        let out = shuffle_in_memory(&plan, &input).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn total_shuffle_preserves_the_multiset() {
        let sizes = [20, 15, 25];
        let input = days(&sizes);
        let plan = ShufflePlan::build(ShufflePolicy::new(Randomize::Total, DataSplit::None, 3), &sizes, 7).unwrap();
        let out = shuffle_in_memory(&plan, &input).unwrap();

        let before: Vec<u32> = input.iter().flat_map(tags).collect();
        let after: Vec<u32> = out.iter().flat_map(tags).collect();
        assert_ne!(before, after);
        assert_eq!(sorted(before), sorted(after));
        for (bucket, rows) in out.iter().enumerate() {
            assert_eq!(rows.row_count(), sizes[bucket]);
        }
    }

    #[test]
    fn day_mode_keeps_rows_in_their_day() {
        let sizes = [10, 10];
        let input = days(&sizes);
        let plan = ShufflePlan::build(ShufflePolicy::new(Randomize::Day, DataSplit::None, 2), &sizes, 3).unwrap();
        let out = shuffle_in_memory(&plan, &input).unwrap();
        for d in 0..2 {
            assert_eq!(sorted(tags(&out[d])), tags(&input[d]));
        }
    }

    #[test]
    fn mapped_passes_match_the_in_memory_shuffle() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShuffleLayout::new(dir.path(), "t");
        let sizes = [6, 0, 9, 5];
        let input = days(&sizes);
        let plan = ShufflePlan::build(ShufflePolicy::new(Randomize::Total, DataSplit::Train, 4), &sizes, 99).unwrap();

        prepare_buckets(&plan, &layout).unwrap();
        // Pass 1 order does not matter: ranges are disjoint.
        for source in (0..4).rev() {
            redistribute_day(&plan, source, &input[source], &layout).unwrap();
        }
        for bucket in 0..4 {
            assert_eq!(permute_bucket(&plan, bucket, &layout).unwrap(), sizes[bucket]);
        }

        let expected = shuffle_in_memory(&plan, &input).unwrap();
        for bucket in 0..4 {
            assert_eq!(layout.reordered(bucket).read(sizes[bucket]).unwrap(), expected[bucket]);
        }
        // The reserved last day keeps its order.
        assert_eq!(expected[3], input[3]);
    }

    #[test]
    fn wrong_day_length_is_rejected() {
        let sizes = [2, 2];
        let plan = ShufflePlan::build(ShufflePolicy::new(Randomize::Total, DataSplit::None, 2), &sizes, 0).unwrap();
        let err = shuffle_in_memory(&plan, &days(&[2, 1])).unwrap_err();
        assert!(matches!(err, PreprocessError::RowCountMismatch { day: 1, .. }));
    }
}
