//! Pipeline engine: stage state machine, parallel day workers, metrics and observer hooks.
//!
//! A run walks the stages
//! `Raw → Split → Encoded → VocabBuilt → Transformed → Bucketed → Shuffled → Concatenated`
//! in order. Each transition happens only after the stage's completeness checks pass, so a failed
//! run stops at the stage that failed and never hands partial results to the next one.
//!
//! Per-day work (both decode passes and shuffle pass 1) runs on a rayon pool, one task per day,
//! throttled by `max_in_flight_days`. Workers only return values; results are collected in day
//! order.

mod observer;
mod semaphore;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::config::PreprocessOptions;
use crate::error::{PreprocessError, PreprocessResult};
use crate::ingestion::decoder::LineDecoder;
use crate::ingestion::reader::{for_each_record, plan_input, DayInput, InputLayout, InputPlan};
use crate::output::{DatasetSink, MemorySink, ParquetSink};
use crate::processing::concat::concatenate;
use crate::processing::transform::encode_day;
use crate::processing::vocabulary::{merge_day_uniques, DayUniques, VocabularySet};
use crate::rng::{stream_rng, RngStream};
use crate::shuffle::{
    permute_bucket, permute_in_memory, prepare_buckets, redistribute_day, redistribute_in_memory,
    ShuffleLayout, ShufflePlan, ShufflePolicy,
};
use crate::types::{DataSet, DayArrays, LabelCounts, RawDay};

pub use observer::{
    CompositeObserver, ExecutionEvent, ExecutionMetrics, ExecutionMetricsSnapshot, FileObserver,
    PipelineObserver, RunContext, RunStats, Severity, TracingObserver,
};

use semaphore::Semaphore;

/// Stages of a preprocessing run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineStage {
    /// Nothing has been read yet.
    Raw,
    /// Input rows counted and partitioned into days.
    Split,
    /// Pass A: every day decoded, row counts and per-day key sets collected.
    Encoded,
    /// Per-column vocabularies merged.
    VocabBuilt,
    /// Pass B: every day re-decoded and transformed with the final vocabularies.
    Transformed,
    /// Shuffle pass 1: rows redistributed into target buckets.
    Bucketed,
    /// Shuffle pass 2: every bucket permuted.
    Shuffled,
    /// Buckets concatenated into the output sink.
    Concatenated,
}

impl PipelineStage {
    /// All stages in run order.
    pub const ALL: [PipelineStage; 8] = [
        Self::Raw,
        Self::Split,
        Self::Encoded,
        Self::VocabBuilt,
        Self::Transformed,
        Self::Bucketed,
        Self::Shuffled,
        Self::Concatenated,
    ];

    /// The stage that follows this one, if any.
    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|&s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Split => "split",
            Self::Encoded => "encoded",
            Self::VocabBuilt => "vocab_built",
            Self::Transformed => "transformed",
            Self::Bucketed => "bucketed",
            Self::Shuffled => "shuffled",
            Self::Concatenated => "concatenated",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current stage and how long each completed stage took.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: PipelineStage,
    entered: Instant,
    timings: Vec<(PipelineStage, Duration)>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: PipelineStage::Raw,
            entered: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineStage {
        self.current
    }

    /// Move to `to`, which must directly follow the current stage.
    pub fn advance(&mut self, to: PipelineStage) -> PreprocessResult<Duration> {
        if self.current.next() != Some(to) {
            return Err(PreprocessError::InvalidTransition {
                from: self.current,
                to,
            });
        }
        let elapsed = self.entered.elapsed();
        self.timings.push((to, elapsed));
        self.current = to;
        self.entered = Instant::now();
        Ok(elapsed)
    }

    /// Time spent reaching each completed stage.
    pub fn timings(&self) -> &[(PipelineStage, Duration)] {
        &self.timings
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct PreprocessReport {
    /// Seed every random stream was derived from.
    pub seed: u64,
    /// Raw rows per input day, before sub-sampling.
    pub day_rows: Vec<usize>,
    /// Rows per day kept after sub-sampling (the bucket capacities).
    pub kept_rows: Vec<usize>,
    /// Rows in the output.
    pub total_rows: usize,
    /// The final vocabularies.
    pub vocabulary: VocabularySet,
    /// Label counts of every finished bucket.
    pub bucket_counts: Vec<LabelCounts>,
    /// Time spent reaching each stage.
    pub stage_timings: Vec<(PipelineStage, Duration)>,
    pub metrics: ExecutionMetricsSnapshot,
}

/// Runs the preprocessing pipeline with a fixed set of options.
pub struct Preprocessor {
    pool: ThreadPool,
    opts: PreprocessOptions,
    metrics: Arc<ExecutionMetrics>,
}

impl fmt::Debug for Preprocessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Preprocessor")
            .field("threads", &self.pool.current_num_threads())
            .field("opts", &self.opts)
            .finish()
    }
}

/// Where the transformed days live between pass B and the shuffle.
enum Staged {
    InMemory(Vec<DayArrays>),
    Mapped(ShuffleLayout),
}

impl Preprocessor {
    /// Validate `opts` and build the worker pool.
    pub fn new(opts: PreprocessOptions) -> PreprocessResult<Self> {
        opts.validate()?;
        let n_threads = opts
            .num_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);
        let pool = ThreadPoolBuilder::new().num_threads(n_threads).build()?;
        Ok(Self {
            pool,
            opts,
            metrics: Arc::new(ExecutionMetrics::new()),
        })
    }

    pub fn options(&self) -> &PreprocessOptions {
        &self.opts
    }

    /// Get a handle to real-time execution metrics.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run every stage over `input` and write the result into `sink`.
    ///
    /// On failure the configured observer receives `on_failure` (and `on_alert` at or above the
    /// alert threshold), bucket files of the run are removed unless `keep_intermediates` is set,
    /// and `sink` is never finished.
    pub fn run(&self, input: &InputLayout, sink: &mut dyn DatasetSink) -> PreprocessResult<PreprocessReport> {
        let start = Instant::now();
        let seed = self.opts.seed.unwrap_or_else(rand::random);
        self.metrics.begin_run();
        info!(seed, days = self.opts.days, "starting preprocessing run");
        self.emit(ExecutionEvent::RunStarted {
            seed,
            days: self.opts.days,
        });

        let mut tracker = StageTracker::new();
        let result = self.run_stages(input, sink, seed, &mut tracker);

        self.metrics.end_run(start.elapsed());
        let ctx = RunContext {
            input: describe(input),
            stage: tracker.current(),
            seed,
        };
        match &result {
            Ok(report) => {
                self.emit(ExecutionEvent::RunFinished {
                    elapsed: start.elapsed(),
                    metrics: self.metrics.snapshot(),
                });
                if let Some(obs) = &self.opts.observer {
                    obs.on_success(
                        &ctx,
                        RunStats {
                            rows: report.total_rows,
                            days: report.kept_rows.len(),
                            elapsed: start.elapsed(),
                        },
                    );
                }
            }
            Err(e) => {
                warn!(stage = %tracker.current(), err = %e, "preprocessing run failed");
                if !self.opts.keep_intermediates {
                    self.remove_bucket_files(input);
                }
                if let Some(obs) = &self.opts.observer {
                    let sev = severity_for_error(e);
                    obs.on_failure(&ctx, sev, e);
                    if sev >= self.opts.alert_at_or_above {
                        obs.on_alert(&ctx, sev, e);
                    }
                }
            }
        }
        result
    }

    fn run_stages(
        &self,
        input: &InputLayout,
        sink: &mut dyn DatasetSink,
        seed: u64,
        tracker: &mut StageTracker,
    ) -> PreprocessResult<PreprocessReport> {
        let delimiter = self.opts.delimiter_byte()?;
        let decoder = LineDecoder::from_options(&self.opts);

        // Split
        self.stage_started(PipelineStage::Split);
        let plan = plan_input(input, self.opts.days)?;
        self.finish_stage(tracker, PipelineStage::Split)?;

        // Pass A: row counts and per-day key sets.
        self.stage_started(PipelineStage::Encoded);
        let collected = self.for_each_day(PipelineStage::Encoded, &plan, |day| {
            let mut rng = stream_rng(seed, RngStream::SubSample, day.day);
            let mut uniques = DayUniques::new();
            let kept = for_each_record(day, delimiter, &decoder, &mut rng, PipelineStage::Encoded, |rec| {
                uniques.observe(&rec.categorical)
            })?;
            Ok(((kept, uniques), kept))
        })?;
        let (kept_rows, uniques): (Vec<usize>, Vec<DayUniques>) = collected.into_iter().unzip();
        self.finish_stage(tracker, PipelineStage::Encoded)?;

        // Merge in day order.
        self.stage_started(PipelineStage::VocabBuilt);
        let vocabulary = merge_day_uniques(&uniques);
        drop(uniques);
        vocabulary.verify()?;
        info!(counts = ?vocabulary.counts(), "built vocabularies");
        self.finish_stage(tracker, PipelineStage::VocabBuilt)?;

        // Pass B: re-decode with the same sub-sampling streams and transform.
        self.stage_started(PipelineStage::Transformed);
        let layout = self.shuffle_layout(input)?;
        let transformed = self.for_each_day(PipelineStage::Transformed, &plan, |day| {
            let mut rng = stream_rng(seed, RngStream::SubSample, day.day);
            let mut raw = RawDay::with_capacity(kept_rows[day.day]);
            let kept = for_each_record(day, delimiter, &decoder, &mut rng, PipelineStage::Transformed, |rec| {
                raw.push(rec)
            })?;
            if kept != kept_rows[day.day] {
                return Err(PreprocessError::RowCountMismatch {
                    stage: PipelineStage::Transformed,
                    day: day.day,
                    expected: kept_rows[day.day],
                    actual: kept,
                });
            }
            let arrays = encode_day(&raw, &vocabulary);
            drop(raw);
            match &layout {
                Some(layout) => {
                    layout.processed(day.day).write(&arrays)?;
                    Ok((None, kept))
                }
                None => Ok((Some(arrays), kept)),
            }
        })?;
        let staged = match layout {
            Some(layout) => Staged::Mapped(layout),
            None => Staged::InMemory(transformed.into_iter().flatten().collect()),
        };
        self.finish_stage(tracker, PipelineStage::Transformed)?;

        // Shuffle pass 1.
        self.stage_started(PipelineStage::Bucketed);
        let policy = ShufflePolicy::new(self.opts.randomize, self.opts.data_split, self.opts.days);
        let shuffle = ShufflePlan::build(policy, &kept_rows, seed)?;
        shuffle.verify()?;
        let staged = match staged {
            Staged::Mapped(layout) => {
                prepare_buckets(&shuffle, &layout)?;
                self.for_each_day(PipelineStage::Bucketed, &plan, |day| {
                    let rows = layout.processed(day.day).read(kept_rows[day.day])?;
                    redistribute_day(&shuffle, day.day, &rows, &layout)?;
                    Ok(((), rows.row_count()))
                })?;
                if !self.opts.keep_intermediates {
                    for day in 0..self.opts.days {
                        layout.processed(day).remove()?;
                    }
                }
                Staged::Mapped(layout)
            }
            Staged::InMemory(days) => Staged::InMemory(redistribute_in_memory(&shuffle, &days)?),
        };
        self.finish_stage(tracker, PipelineStage::Bucketed)?;

        // Shuffle pass 2.
        self.stage_started(PipelineStage::Shuffled);
        let staged = match staged {
            Staged::Mapped(layout) => {
                let permuted: Vec<usize> = self.pool.install(|| {
                    (0..self.opts.days)
                        .into_par_iter()
                        .map(|bucket| permute_bucket(&shuffle, bucket, &layout))
                        .collect::<PreprocessResult<Vec<usize>>>()
                })?;
                debug!(rows = ?permuted, "finished buckets");
                if !self.opts.keep_intermediates {
                    for bucket in 0..self.opts.days {
                        layout.intermediate(bucket).remove()?;
                    }
                }
                Staged::Mapped(layout)
            }
            Staged::InMemory(buckets) => {
                Staged::InMemory(self.pool.install(|| permute_in_memory(&shuffle, buckets)))
            }
        };
        self.finish_stage(tracker, PipelineStage::Shuffled)?;

        // Concatenate.
        self.stage_started(PipelineStage::Concatenated);
        let total_rows: usize = kept_rows.iter().sum();
        let bucket_counts = match &staged {
            Staged::Mapped(layout) => concatenate(
                (0..self.opts.days).map(|bucket| layout.reordered(bucket).read(shuffle.capacity(bucket))),
                total_rows,
                sink,
            )?,
            Staged::InMemory(buckets) => concatenate(buckets.iter().map(Ok), total_rows, sink)?,
        };
        for (bucket, counts) in bucket_counts.iter().enumerate() {
            self.emit(ExecutionEvent::BucketFinished {
                bucket,
                rows: counts.total(),
                positive: counts.positive,
                negative: counts.negative,
            });
        }
        self.finish_stage(tracker, PipelineStage::Concatenated)?;

        Ok(PreprocessReport {
            seed,
            day_rows: plan.split.capacities().to_vec(),
            kept_rows,
            total_rows,
            vocabulary,
            bucket_counts,
            stage_timings: tracker.timings().to_vec(),
            metrics: self.metrics.snapshot(),
        })
    }

    /// Run `work` once per input day on the pool, in at most `max_in_flight_days` at a time.
    ///
    /// `work` returns its value and the number of rows it handled. Results come back in day order.
    fn for_each_day<T, F>(&self, stage: PipelineStage, plan: &InputPlan, work: F) -> PreprocessResult<Vec<T>>
    where
        T: Send,
        F: Fn(&DayInput) -> PreprocessResult<(T, usize)> + Sync,
    {
        let sem = Semaphore::new(self.opts.max_in_flight_days);
        self.pool.install(|| {
            plan.days
                .par_iter()
                .map(|day| {
                    let (_permit, waited) = sem.acquire();
                    if waited > Duration::ZERO {
                        self.metrics.on_throttle_wait(waited);
                        self.emit(ExecutionEvent::ThrottleWaited { duration: waited });
                    }

                    self.metrics.on_day_start();
                    self.emit(ExecutionEvent::DayStarted { stage, day: day.day });
                    let result = work(day);
                    self.metrics.on_day_end();

                    let (value, rows) = result?;
                    self.metrics.on_rows_processed(rows);
                    debug!(%stage, day = day.day, rows, "day finished");
                    self.emit(ExecutionEvent::DayFinished {
                        stage,
                        day: day.day,
                        rows,
                    });
                    Ok(value)
                })
                .collect()
        })
    }

    fn shuffle_layout(&self, input: &InputLayout) -> PreprocessResult<Option<ShuffleLayout>> {
        if !self.opts.memory_map {
            return Ok(None);
        }
        let dir = self
            .opts
            .work_dir
            .clone()
            .unwrap_or_else(|| input.directory());
        std::fs::create_dir_all(&dir)?;
        Ok(Some(ShuffleLayout::new(dir, input.stem())))
    }

    /// Best-effort removal of this run's bucket files.
    fn remove_bucket_files(&self, input: &InputLayout) {
        let Ok(Some(layout)) = self.shuffle_layout(input) else {
            return;
        };
        for idx in 0..self.opts.days {
            let _ = layout.processed(idx).remove();
            let _ = layout.intermediate(idx).remove();
            let _ = layout.reordered(idx).remove();
        }
    }

    fn stage_started(&self, stage: PipelineStage) {
        self.emit(ExecutionEvent::StageStarted { stage });
    }

    fn finish_stage(&self, tracker: &mut StageTracker, stage: PipelineStage) -> PreprocessResult<()> {
        let elapsed = tracker.advance(stage)?;
        info!(%stage, elapsed = ?elapsed, "stage complete");
        self.emit(ExecutionEvent::StageFinished { stage, elapsed });
        Ok(())
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(obs) = &self.opts.observer {
            obs.on_event(&event);
        }
    }
}

fn describe(input: &InputLayout) -> String {
    match input {
        InputLayout::SingleFile(path) => path.display().to_string(),
        InputLayout::DayFiles { prefix } => format!("{}_*", prefix.display()),
    }
}

/// Run the pipeline and collect the output in memory.
pub fn preprocess_to_dataset(
    input: &InputLayout,
    opts: PreprocessOptions,
) -> PreprocessResult<(DataSet, PreprocessReport)> {
    let pre = Preprocessor::new(opts)?;
    let mut sink = MemorySink::new();
    let report = pre.run(input, &mut sink)?;
    Ok((sink.into_dataset(), report))
}

/// Run the pipeline and write the output to a Parquet file at `output`.
pub fn preprocess_to_parquet(
    input: &InputLayout,
    output: impl AsRef<Path>,
    opts: PreprocessOptions,
) -> PreprocessResult<PreprocessReport> {
    let pre = Preprocessor::new(opts)?;
    let mut sink = ParquetSink::create(output)?;
    pre.run(input, &mut sink)
}

/// Run the pipeline, save the vocabularies to `vocab_output`, then publish the Parquet file.
///
/// The dataset only appears at `output` after the vocabularies were written, so a failed
/// vocabulary write leaves neither file behind.
pub fn preprocess_to_parquet_with_vocabulary(
    input: &InputLayout,
    output: impl AsRef<Path>,
    vocab_output: impl AsRef<Path>,
    opts: PreprocessOptions,
) -> PreprocessResult<PreprocessReport> {
    let pre = Preprocessor::new(opts)?;
    let mut sink = ParquetSink::deferred(output)?;
    let report = pre.run(input, &mut sink)?;
    report.vocabulary.save_json(&vocab_output)?;
    sink.publish()?;
    debug!(rows = sink.rows_written(), "published dataset after vocabularies");
    Ok(report)
}

fn severity_for_error(e: &PreprocessError) -> Severity {
    match e {
        PreprocessError::Io(_) | PreprocessError::MissingInput { .. } | PreprocessError::ThreadPool(_) => {
            Severity::Critical
        }
        PreprocessError::Parquet(err) => {
            if error_chain_contains_io(err) {
                Severity::Critical
            } else {
                Severity::Error
            }
        }
        PreprocessError::Csv(err) => match err.kind() {
            ::csv::ErrorKind::Io(_) => Severity::Critical,
            _ => Severity::Error,
        },
        PreprocessError::Json(err) if err.is_io() => Severity::Critical,
        PreprocessError::Json(_)
        | PreprocessError::InvalidConfig { .. }
        | PreprocessError::FieldCount { .. }
        | PreprocessError::ParseError { .. }
        | PreprocessError::RowCountMismatch { .. }
        | PreprocessError::CapacityOverflow { .. }
        | PreprocessError::InvalidVocabulary { .. }
        | PreprocessError::InvalidTransition { .. } => Severity::Error,
    }
}

fn error_chain_contains_io(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = cur {
        if err.is::<std::io::Error>() {
            return true;
        }
        cur = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_in_order_only() {
        let mut t = StageTracker::new();
        t.advance(PipelineStage::Split).unwrap();
        t.advance(PipelineStage::Encoded).unwrap();
        let err = t.advance(PipelineStage::Shuffled).unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::InvalidTransition {
                from: PipelineStage::Encoded,
                to: PipelineStage::Shuffled
            }
        ));
        assert_eq!(t.current(), PipelineStage::Encoded);
        assert_eq!(t.timings().len(), 2);
    }

    #[test]
    fn last_stage_has_no_successor() {
        assert_eq!(PipelineStage::Raw.next(), Some(PipelineStage::Split));
        assert_eq!(PipelineStage::Shuffled.next(), Some(PipelineStage::Concatenated));
        assert_eq!(PipelineStage::Concatenated.next(), None);
        assert_eq!(PipelineStage::VocabBuilt.to_string(), "vocab_built");
    }

    #[test]
    fn io_failures_are_critical_and_data_errors_are_not() {
        let io = PreprocessError::Io(std::io::Error::other("disk full"));
        assert_eq!(severity_for_error(&io), Severity::Critical);
        let missing = PreprocessError::MissingInput {
            path: "x".into(),
        };
        assert_eq!(severity_for_error(&missing), Severity::Critical);
        let data = PreprocessError::FieldCount {
            stage: PipelineStage::Encoded,
            day: 0,
            row: 1,
            expected: 40,
            found: 3,
        };
        assert_eq!(severity_for_error(&data), Severity::Error);
    }

    #[test]
    fn invalid_options_are_rejected_before_running() {
        let opts = PreprocessOptions {
            days: 0,
            ..Default::default()
        };
        assert!(matches!(
            Preprocessor::new(opts).unwrap_err(),
            PreprocessError::InvalidConfig { .. }
        ));
    }
}
