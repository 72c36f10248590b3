//! Day concatenation.

use std::borrow::Borrow;

use tracing::info;

use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::PipelineStage;
use crate::output::DatasetSink;
use crate::types::{DayArrays, LabelCounts};

/// Hand `buckets` to `sink` in index order and finish the sink.
///
/// Returns the per-bucket label counts. Fails with [`PreprocessError::RowCountMismatch`] if the
/// buckets do not add up to `expected_rows`; in that case the sink is never finished.
pub fn concatenate<I, B>(
    buckets: I,
    expected_rows: usize,
    sink: &mut dyn DatasetSink,
) -> PreprocessResult<Vec<LabelCounts>>
where
    I: IntoIterator<Item = PreprocessResult<B>>,
    B: Borrow<DayArrays>,
{
    let mut counts = Vec::new();
    let mut total = 0usize;
    for (bucket, arrays) in buckets.into_iter().enumerate() {
        let arrays = arrays?;
        let arrays: &DayArrays = arrays.borrow();
        let label_counts = arrays.label_counts();
        info!(
            bucket,
            rows = arrays.row_count(),
            positive = label_counts.positive,
            negative = label_counts.negative,
            "concatenating bucket"
        );
        sink.write_bucket(bucket, arrays)?;
        total += arrays.row_count();
        counts.push(label_counts);
    }

    if total != expected_rows {
        return Err(PreprocessError::RowCountMismatch {
            stage: PipelineStage::Concatenated,
            day: counts.len(),
            expected: expected_rows,
            actual: total,
        });
    }
    sink.finish()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use crate::types::{NUM_DENSE, NUM_SPARSE};

    fn bucket(labels: &[i32], tag: u32) -> DayArrays {
        let mut out = DayArrays::with_capacity(labels.len());
        for &y in labels {
            out.push(y, [0.0; NUM_DENSE], [tag; NUM_SPARSE]);
        }
        out
    }

    #[test]
    fn buckets_are_appended_in_index_order() {
        let a = bucket(&[1, 0], 0);
        let b = bucket(&[], 1);
        let c = bucket(&[0, 0, 1], 2);
        let mut sink = MemorySink::new();
        let counts = concatenate([Ok(&a), Ok(&b), Ok(&c)], 5, &mut sink).unwrap();

        assert_eq!(counts[0], LabelCounts { positive: 1, negative: 1 });
        assert_eq!(counts[1].total(), 0);
        assert_eq!(counts[2], LabelCounts { positive: 1, negative: 2 });

        let ds = sink.into_dataset();
        assert_eq!(ds.row_count(), 5);
        assert_eq!(ds.bucket_sizes, vec![2, 0, 3]);
        assert_eq!(ds.arrays.categorical[2][0], 2);
        assert_eq!(ds.arrays.labels, vec![1, 0, 0, 0, 1]);
    }

    #[test]
    fn lost_rows_are_fatal() {
        let a = bucket(&[1, 0], 0);
        let mut sink = MemorySink::new();
        let err = concatenate([Ok(&a)], 3, &mut sink).unwrap_err();
        assert!(matches!(err, PreprocessError::RowCountMismatch { expected: 3, actual: 2, .. }));
    }
}
