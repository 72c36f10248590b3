use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};

use crate::error::PreprocessError;

use super::PipelineStage;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational event.
    Info,
    /// Warning-level event (non-fatal).
    Warning,
    /// Error-level event (the run failed on its data).
    Error,
    /// Critical error (I/O or other infrastructure failures).
    #[default]
    Critical,
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted { seed: u64, days: usize },
    StageStarted { stage: PipelineStage },
    ThrottleWaited { duration: Duration },
    DayStarted { stage: PipelineStage, day: usize },
    DayFinished { stage: PipelineStage, day: usize, rows: usize },
    BucketFinished { bucket: usize, rows: usize, positive: usize, negative: usize },
    StageFinished { stage: PipelineStage, elapsed: Duration },
    RunFinished {
        elapsed: Duration,
        metrics: ExecutionMetricsSnapshot,
    },
}

/// Context about a run, passed to outcome callbacks.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Human-readable description of the input.
    pub input: String,
    /// Last stage the run reached.
    pub stage: PipelineStage,
    /// Seed of the run.
    pub seed: u64,
}

/// Stats reported on a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Rows in the output dataset.
    pub rows: usize,
    /// Number of day buckets.
    pub days: usize,
    pub elapsed: Duration,
}

/// Observer interface for run progress and outcomes.
///
/// Implementors can record metrics, logs, or trigger alerts. Every method has a no-op default.
pub trait PipelineObserver: Send + Sync {
    /// Called for every progress event. May be called from worker threads.
    fn on_event(&self, _event: &ExecutionEvent) {}

    /// Called when a run succeeds.
    fn on_success(&self, _ctx: &RunContext, _stats: RunStats) {}

    /// Called when a run fails.
    fn on_failure(&self, _ctx: &RunContext, _severity: Severity, _error: &PreprocessError) {}

    /// Called when a failure meets the alert threshold.
    ///
    /// Default behavior forwards to [`Self::on_failure`].
    fn on_alert(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        self.on_failure(ctx, severity, error)
    }
}

/// An observer that fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl CompositeObserver {
    /// Create a new composite observer from a list of observers.
    pub fn new(observers: Vec<Arc<dyn PipelineObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl PipelineObserver for CompositeObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        for o in &self.observers {
            o.on_event(event);
        }
    }

    fn on_success(&self, ctx: &RunContext, stats: RunStats) {
        for o in &self.observers {
            o.on_success(ctx, stats);
        }
    }

    fn on_failure(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        for o in &self.observers {
            o.on_failure(ctx, severity, error);
        }
    }

    fn on_alert(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        for o in &self.observers {
            o.on_alert(ctx, severity, error);
        }
    }
}

/// Routes run events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted { seed, days } => info!(seed, days, "run started"),
            ExecutionEvent::StageStarted { stage } => info!(%stage, "stage started"),
            ExecutionEvent::StageFinished { stage, elapsed } => {
                info!(%stage, elapsed = ?elapsed, "stage finished")
            }
            ExecutionEvent::RunFinished { metrics, .. } => info!(%metrics, "run finished"),
            other => tracing::debug!(event = ?other),
        }
    }

    fn on_success(&self, ctx: &RunContext, stats: RunStats) {
        info!(
            input = %ctx.input,
            seed = ctx.seed,
            rows = stats.rows,
            days = stats.days,
            elapsed = ?stats.elapsed,
            "[prep][ok]"
        );
    }

    fn on_failure(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        warn!(
            input = %ctx.input,
            stage = %ctx.stage,
            severity = ?severity,
            err = %error,
            "[prep][fail]"
        );
    }

    fn on_alert(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        error!(
            input = %ctx.input,
            stage = %ctx.stage,
            severity = ?severity,
            err = %error,
            "[ALERT][prep]"
        );
    }
}

/// Appends run outcomes to a local log file.
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    /// Create a file observer that appends events to `path`.
    ///
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append_line(&self, line: &str) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl PipelineObserver for FileObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StageFinished { stage, elapsed } => {
                self.append_line(&format!("{} stage={stage} elapsed={elapsed:?}", unix_ts()));
            }
            ExecutionEvent::BucketFinished {
                bucket,
                rows,
                positive,
                negative,
            } => {
                self.append_line(&format!(
                    "{} bucket={bucket} rows={rows} positive={positive} negative={negative}",
                    unix_ts()
                ));
            }
            _ => {}
        }
    }

    fn on_success(&self, ctx: &RunContext, stats: RunStats) {
        self.append_line(&format!(
            "{} ok input={} seed={} rows={} days={}",
            unix_ts(),
            ctx.input,
            ctx.seed,
            stats.rows,
            stats.days
        ));
    }

    fn on_failure(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        self.append_line(&format!(
            "{} fail severity={:?} stage={} input={} err={}",
            unix_ts(),
            severity,
            ctx.stage,
            ctx.input,
            error
        ));
    }

    fn on_alert(&self, ctx: &RunContext, severity: Severity, error: &PreprocessError) {
        self.append_line(&format!(
            "{} ALERT severity={:?} stage={} input={} err={}",
            unix_ts(),
            severity,
            ctx.stage,
            ctx.input,
            error
        ));
    }
}

fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Real-time metrics for a run.
///
/// The engine updates these counters during execution; callers can snapshot them at any time.
pub struct ExecutionMetrics {
    run_id: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    elapsed_ns: AtomicU64,

    rows_processed: AtomicU64,
    days_started: AtomicU64,
    days_finished: AtomicU64,
    throttle_wait_ns: AtomicU64,

    active_days: AtomicUsize,
    max_active_days: AtomicUsize,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self {
            run_id: AtomicU64::new(0),
            started_at: Mutex::new(None),
            elapsed_ns: AtomicU64::new(0),
            rows_processed: AtomicU64::new(0),
            days_started: AtomicU64::new(0),
            days_finished: AtomicU64::new(0),
            throttle_wait_ns: AtomicU64::new(0),
            active_days: AtomicUsize::new(0),
            max_active_days: AtomicUsize::new(0),
        }
    }

    pub fn begin_run(&self) {
        let _ = self.run_id.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock().expect("metrics mutex poisoned") = Some(Instant::now());

        self.elapsed_ns.store(0, Ordering::SeqCst);
        self.rows_processed.store(0, Ordering::SeqCst);
        self.days_started.store(0, Ordering::SeqCst);
        self.days_finished.store(0, Ordering::SeqCst);
        self.throttle_wait_ns.store(0, Ordering::SeqCst);
        self.active_days.store(0, Ordering::SeqCst);
        self.max_active_days.store(0, Ordering::SeqCst);
    }

    pub fn end_run(&self, elapsed: Duration) {
        self.elapsed_ns
            .store(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::SeqCst);
    }

    /// Time since [`Self::begin_run`], if a run was started.
    pub fn running_for(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .expect("metrics mutex poisoned")
            .map(|t| t.elapsed())
    }

    pub fn on_rows_processed(&self, rows: usize) {
        let _ = self.rows_processed.fetch_add(rows as u64, Ordering::SeqCst);
    }

    pub fn on_day_start(&self) {
        let _ = self.days_started.fetch_add(1, Ordering::SeqCst);
        let now = self.active_days.fetch_add(1, Ordering::SeqCst) + 1;
        update_max_usize(&self.max_active_days, now);
    }

    pub fn on_day_end(&self) {
        let _ = self.days_finished.fetch_add(1, Ordering::SeqCst);
        let _ = self.active_days.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn on_throttle_wait(&self, d: Duration) {
        let add = d.as_nanos().min(u64::MAX as u128) as u64;
        let _ = self.throttle_wait_ns.fetch_add(add, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        let run_id = self.run_id.load(Ordering::SeqCst);
        let elapsed_ns = self.elapsed_ns.load(Ordering::SeqCst);
        let elapsed = if elapsed_ns > 0 {
            Some(Duration::from_nanos(elapsed_ns))
        } else {
            None
        };

        ExecutionMetricsSnapshot {
            run_id,
            elapsed,
            rows_processed: self.rows_processed.load(Ordering::SeqCst),
            days_started: self.days_started.load(Ordering::SeqCst),
            days_finished: self.days_finished.load(Ordering::SeqCst),
            throttle_wait: Duration::from_nanos(self.throttle_wait_ns.load(Ordering::SeqCst)),
            max_active_days: self.max_active_days.load(Ordering::SeqCst),
        }
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn update_max_usize(dst: &AtomicUsize, now: usize) {
    loop {
        let cur = dst.load(Ordering::SeqCst);
        if now <= cur {
            break;
        }
        if dst
            .compare_exchange(cur, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}

/// Immutable snapshot of [`ExecutionMetrics`].
///
/// Day counters add up over every per-day task of the run (both decode passes and pass 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMetricsSnapshot {
    pub run_id: u64,
    pub elapsed: Option<Duration>,
    pub rows_processed: u64,
    pub days_started: u64,
    pub days_finished: u64,
    pub throttle_wait: Duration,
    pub max_active_days: usize,
}

impl fmt::Display for ExecutionMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, rows_processed={}, day_tasks={}/{}, max_active_days={}, throttle_wait={:?}, elapsed={:?}",
            self.run_id,
            self.rows_processed,
            self.days_finished,
            self.days_started,
            self.max_active_days,
            self.throttle_wait,
            self.elapsed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(Severity::default(), Severity::Critical);
    }

    #[test]
    fn file_observer_appends_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prep.log");
        let obs = FileObserver::new(&path);
        let ctx = RunContext {
            input: "train.txt".to_string(),
            stage: PipelineStage::Concatenated,
            seed: 3,
        };
        obs.on_success(
            &ctx,
            RunStats {
                rows: 10,
                days: 2,
                elapsed: Duration::from_millis(5),
            },
        );
        let err = PreprocessError::MissingInput {
            path: PathBuf::from("x"),
        };
        obs.on_alert(&ctx, Severity::Critical, &err);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ok input=train.txt seed=3 rows=10"));
        assert!(lines[1].contains("ALERT severity=Critical"));
    }

    #[test]
    fn metrics_track_peak_active_days() {
        let m = ExecutionMetrics::new();
        m.begin_run();
        m.on_day_start();
        m.on_day_start();
        m.on_day_end();
        m.on_day_start();
        m.on_rows_processed(7);
        let snap = m.snapshot();
        assert_eq!(snap.days_started, 3);
        assert_eq!(snap.days_finished, 1);
        assert_eq!(snap.max_active_days, 2);
        assert_eq!(snap.rows_processed, 7);
        assert!(snap.elapsed.is_none());
        assert!(m.running_for().is_some());
    }
}
