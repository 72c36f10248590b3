//! Shuffle planning.
//!
//! Pass 1 of the shuffle sends every row of a source day to a target bucket chosen at random,
//! resampling while the drawn bucket is full. Capacity is checked against the *global* fill of
//! each bucket, so the outcome of a day's draws depends on every earlier day.
//!
//! [`ShufflePlan::build`] settles this sequentially and cheaply: it replays each source day's
//! [`RngStream::BucketDraw`] stream in day order, counting rows only, and records how full every
//! bucket was when each source day started. Writers then replay the same stream from that
//! starting fill (see [`ShufflePlan::targets`]) and land on exactly the same buckets and offsets,
//! so the (source, target) ranges are disjoint and no locking is needed.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::{DataSplit, Randomize};
use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::PipelineStage;
use crate::rng::{stream_rng, RngStream};

/// Failed draws per bucket before the sampler falls back to a linear scan.
const DRAWS_PER_BUCKET: usize = 64;

/// Which days and buckets take part in each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShufflePolicy {
    pub randomize: Randomize,
    pub data_split: DataSplit,
    pub days: usize,
}

impl ShufflePolicy {
    pub fn new(randomize: Randomize, data_split: DataSplit, days: usize) -> Self {
        Self {
            randomize,
            data_split,
            days,
        }
    }

    /// Target buckets are drawn from `[0, sampling_range)`.
    pub fn sampling_range(&self) -> usize {
        if self.data_split.reserves_last_day() {
            self.days.saturating_sub(1)
        } else {
            self.days
        }
    }

    fn is_reserved(&self, index: usize) -> bool {
        self.data_split.reserves_last_day() && index + 1 == self.days
    }

    /// Whether rows of `source` are sent to random buckets in pass 1.
    pub fn redistributes(&self, source: usize) -> bool {
        self.randomize.redistributes() && !self.is_reserved(source) && self.sampling_range() > 0
    }

    /// Whether `bucket` is randomly permuted in pass 2.
    pub fn permutes(&self, bucket: usize) -> bool {
        self.randomize.permutes() && !self.is_reserved(bucket)
    }
}

/// Bounded rejection sampler over target buckets.
#[derive(Debug, Clone)]
pub struct BucketSampler {
    capacities: Vec<usize>,
    range: usize,
    max_draws: usize,
}

impl BucketSampler {
    pub fn new(capacities: Vec<usize>, range: usize) -> Self {
        let max_draws = capacities.len().max(1) * DRAWS_PER_BUCKET;
        Self {
            capacities,
            range,
            max_draws,
        }
    }

    /// Draw a bucket in `[0, range)` with room left, and claim the next slot in it.
    ///
    /// Returns `(bucket, offset within bucket)`.
    pub fn draw<R: Rng + ?Sized>(
        &self,
        fill: &mut [usize],
        rng: &mut R,
        source: usize,
    ) -> PreprocessResult<(usize, usize)> {
        for _ in 0..self.max_draws {
            let p = rng.gen_range(0..self.range);
            if fill[p] < self.capacities[p] {
                return Ok(self.claim(fill, p));
            }
        }
        match (0..self.range).find(|&p| fill[p] < self.capacities[p]) {
            Some(p) => Ok(self.claim(fill, p)),
            None => Err(PreprocessError::CapacityOverflow {
                stage: PipelineStage::Bucketed,
                day: source,
                attempts: self.max_draws,
            }),
        }
    }

    fn claim(&self, fill: &mut [usize], p: usize) -> (usize, usize) {
        let offset = fill[p];
        fill[p] += 1;
        (p, offset)
    }
}

/// Row counts and offsets of every (source day, target bucket) pair.
#[derive(Debug, Clone)]
pub struct ShufflePlan {
    policy: ShufflePolicy,
    seed: u64,
    sources: Vec<usize>,
    sampler: BucketSampler,
    /// `counts[i][p]`: rows sent from source `i` to bucket `p`.
    counts: Vec<Vec<usize>>,
    /// `starts[i][p]`: fill of bucket `p` when source `i` starts writing.
    starts: Vec<Vec<usize>>,
}

impl ShufflePlan {
    /// Plan pass 1 for days holding `rows[i]` rows each.
    ///
    /// Bucket `p` has capacity `rows[p]`.
    pub fn build(policy: ShufflePolicy, rows: &[usize], seed: u64) -> PreprocessResult<Self> {
        let days = policy.days;
        if rows.len() != days {
            return Err(PreprocessError::invalid_config(format!(
                "shuffle plan expects {days} days, got {}",
                rows.len()
            )));
        }
        let sampler = BucketSampler::new(rows.to_vec(), policy.sampling_range());
        let mut plan = Self {
            policy,
            seed,
            sources: rows.to_vec(),
            sampler,
            counts: Vec::with_capacity(days),
            starts: Vec::with_capacity(days),
        };

        let mut fill = vec![0usize; days];
        for source in 0..days {
            plan.starts.push(fill.clone());
            let mut counts = vec![0usize; days];
            for step in plan.targets_from(source, fill.clone()) {
                let (p, _) = step?;
                counts[p] += 1;
            }
            for (f, c) in fill.iter_mut().zip(&counts) {
                *f += c;
            }
            plan.counts.push(counts);
        }
        Ok(plan)
    }

    pub fn policy(&self) -> &ShufflePolicy {
        &self.policy
    }

    pub fn days(&self) -> usize {
        self.policy.days
    }

    /// Rows of bucket `p` after pass 1.
    pub fn capacity(&self, bucket: usize) -> usize {
        self.sampler.capacities[bucket]
    }

    pub fn capacities(&self) -> &[usize] {
        &self.sampler.capacities
    }

    /// Rows sent from `source` to `target`.
    pub fn count(&self, source: usize, target: usize) -> usize {
        self.counts[source][target]
    }

    /// First row of `target` written by `source`.
    pub fn start(&self, source: usize, target: usize) -> usize {
        self.starts[source][target]
    }

    /// Rows sent from `source` to each bucket.
    pub fn counts_from(&self, source: usize) -> &[usize] {
        &self.counts[source]
    }

    /// Replay the target draws of `source`: one `(bucket, offset)` per row, in row order.
    pub fn targets(&self, source: usize) -> TargetStream<'_> {
        self.targets_from(source, self.starts[source].clone())
    }

    fn targets_from(&self, source: usize, fill: Vec<usize>) -> TargetStream<'_> {
        TargetStream {
            sampler: &self.sampler,
            redistribute: self.policy.redistributes(source),
            rng: stream_rng(self.seed, RngStream::BucketDraw, source),
            fill,
            source,
            remaining: self.sources[source],
        }
    }

    /// Check `sum_p rows(i -> p) == rows(i)` and `sum_i rows(i -> p) == capacity(p)`.
    pub fn verify(&self) -> PreprocessResult<()> {
        for (source, counts) in self.counts.iter().enumerate() {
            let sent: usize = counts.iter().sum();
            if sent != self.sources[source] {
                return Err(PreprocessError::RowCountMismatch {
                    stage: PipelineStage::Bucketed,
                    day: source,
                    expected: self.sources[source],
                    actual: sent,
                });
            }
        }
        for bucket in 0..self.days() {
            let received: usize = self.counts.iter().map(|c| c[bucket]).sum();
            if received != self.capacity(bucket) {
                return Err(PreprocessError::RowCountMismatch {
                    stage: PipelineStage::Bucketed,
                    day: bucket,
                    expected: self.capacity(bucket),
                    actual: received,
                });
            }
        }
        Ok(())
    }

    /// Pass 2 row order of `bucket`: row `k` of the finished bucket is row `order[k]` of the
    /// pass 1 bucket.
    pub fn permutation(&self, bucket: usize) -> Vec<usize> {
        let len = self.capacity(bucket);
        if self.policy.permutes(bucket) {
            let mut rng = stream_rng(self.seed, RngStream::Permutation, bucket);
            permutation(len, &mut rng)
        } else {
            (0..len).collect()
        }
    }
}

/// Replayed pass 1 target draws of one source day.
pub struct TargetStream<'a> {
    sampler: &'a BucketSampler,
    redistribute: bool,
    rng: ChaCha8Rng,
    fill: Vec<usize>,
    source: usize,
    remaining: usize,
}

impl Iterator for TargetStream<'_> {
    type Item = PreprocessResult<(usize, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if !self.redistribute {
            let offset = self.fill[self.source];
            self.fill[self.source] += 1;
            return Some(Ok((self.source, offset)));
        }
        let step = self.sampler.draw(&mut self.fill, &mut self.rng, self.source);
        if step.is_err() {
            self.remaining = 0;
        }
        Some(step)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// A uniformly random permutation of `0..len` (Fisher-Yates).
pub fn permutation<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(randomize: Randomize, data_split: DataSplit, days: usize) -> ShufflePolicy {
        ShufflePolicy::new(randomize, data_split, days)
    }

    #[test]
    fn train_split_reserves_the_last_day() {
        let p = policy(Randomize::Total, DataSplit::Train, 4);
        assert_eq!(p.sampling_range(), 3);
        assert!(p.redistributes(0));
        assert!(!p.redistributes(3));
        assert!(p.permutes(2));
        assert!(!p.permutes(3));

        let p = policy(Randomize::Total, DataSplit::None, 4);
        assert_eq!(p.sampling_range(), 4);
        assert!(p.redistributes(3));
        assert!(p.permutes(3));
    }

    #[test]
    fn day_and_none_modes_never_redistribute() {
        let day = policy(Randomize::Day, DataSplit::None, 3);
        assert!(!day.redistributes(0));
        assert!(day.permutes(0));
        let none = policy(Randomize::None, DataSplit::None, 3);
        assert!(!none.redistributes(1));
        assert!(!none.permutes(1));
    }

    #[test]
    fn single_day_train_split_is_a_no_op() {
        let p = policy(Randomize::Total, DataSplit::Train, 1);
        assert_eq!(p.sampling_range(), 0);
        assert!(!p.redistributes(0));
        let plan = ShufflePlan::build(p, &[5], 1).unwrap();
        assert_eq!(plan.count(0, 0), 5);
        assert_eq!(plan.permutation(0), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn plan_fills_every_bucket_exactly() {
        let rows = [7, 3, 0, 5, 4];
        let plan = ShufflePlan::build(policy(Randomize::Total, DataSplit::None, 5), &rows, 42).unwrap();
        plan.verify().unwrap();
        for (p, &cap) in rows.iter().enumerate() {
            let received: usize = (0..5).map(|i| plan.count(i, p)).sum();
            assert_eq!(received, cap);
        }
    }

    #[test]
    fn replayed_targets_match_the_plan_and_do_not_overlap() {
        let rows = [6, 2, 5, 4];
        let plan = ShufflePlan::build(policy(Randomize::Total, DataSplit::Train, 4), &rows, 9).unwrap();
        plan.verify().unwrap();

        let mut claimed: Vec<Vec<bool>> = rows.iter().map(|&c| vec![false; c]).collect();
        for source in 0..4 {
            let mut per_target = vec![0usize; 4];
            for step in plan.targets(source) {
                let (p, offset) = step.unwrap();
                assert!(offset >= plan.start(source, p));
                assert!(offset < plan.start(source, p) + plan.count(source, p));
                assert!(!claimed[p][offset], "slot {p}/{offset} written twice");
                claimed[p][offset] = true;
                per_target[p] += 1;
            }
            assert_eq!(per_target, plan.counts_from(source));
        }
        assert!(claimed.iter().flatten().all(|&c| c));
        // The reserved last day only ever lands in the last bucket.
        assert_eq!(plan.count(3, 3), 4);
        assert_eq!((0..3).map(|i| plan.count(i, 3)).sum::<usize>(), 0);
    }

    #[test]
    fn same_seed_gives_the_same_plan() {
        let rows = [10, 10, 10];
        let pol = policy(Randomize::Total, DataSplit::None, 3);
        let a = ShufflePlan::build(pol, &rows, 5).unwrap();
        let b = ShufflePlan::build(pol, &rows, 5).unwrap();
        for i in 0..3 {
            assert_eq!(a.counts_from(i), b.counts_from(i));
        }
        assert_eq!(a.permutation(1), b.permutation(1));
    }

    #[test]
    fn sampler_reports_overflow_when_every_bucket_is_full() {
        let sampler = BucketSampler::new(vec![1, 1], 2);
        let mut fill = vec![1, 1];
        let mut rng = stream_rng(0, RngStream::BucketDraw, 0);
        let err = sampler.draw(&mut fill, &mut rng, 0).unwrap_err();
        assert!(matches!(err, PreprocessError::CapacityOverflow { day: 0, attempts: 128, .. }));
    }

    #[test]
    fn sampler_falls_back_to_the_only_open_bucket() {
        let sampler = BucketSampler::new(vec![1, 1, 1], 3);
        let mut fill = vec![1, 0, 1];
        let mut rng = stream_rng(3, RngStream::BucketDraw, 0);
        assert_eq!(sampler.draw(&mut fill, &mut rng, 0).unwrap(), (1, 0));
        assert_eq!(fill, vec![1, 1, 1]);
    }

    #[test]
    fn permutation_is_a_bijection() {
        let mut rng = stream_rng(11, RngStream::Permutation, 0);
        let mut order = permutation(100, &mut rng);
        assert_ne!(order, (0..100).collect::<Vec<_>>());
        order.sort_unstable();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }
}
