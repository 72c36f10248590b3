//! Command-line front end for the preprocessing pipeline.
//!
//! ```sh
//! click-log-prep --input data/train.txt --days 7 --max-ind-range 10000000 \
//!     --output data/train.parquet --vocab-output data/vocab.json
//! click-log-prep --day-files data/day --days 24 --memory-map --seed 42 --output day.parquet
//! ```
//!
//! Options given on the command line override the ones read from `--config`. Logging goes through
//! `tracing`; set `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use click_log_prep::config::{DataSplit, PreprocessOptions, Randomize};
use click_log_prep::execution::{
    preprocess_to_parquet, preprocess_to_parquet_with_vocabulary, CompositeObserver, FileObserver,
    PipelineObserver, PreprocessReport, Preprocessor, Severity, TracingObserver,
};
use click_log_prep::ingestion::InputLayout;
use click_log_prep::output::CountingSink;
use click_log_prep::PreprocessResult;

#[derive(Parser, Debug)]
#[command(name = "click-log-prep", about = "Build vocabularies for a click log and shuffle it into day buckets")]
struct Args {
    /// Single input file, split into `--days` days by row position.
    #[arg(long, conflicts_with = "day_files", required_unless_present = "day_files")]
    input: Option<PathBuf>,

    /// Prefix of per-day input files `<prefix>_0` .. `<prefix>_<days-1>`.
    #[arg(long)]
    day_files: Option<PathBuf>,

    /// JSON file with pipeline options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parquet file for the shuffled dataset. Without it only bucket sizes are reported.
    #[arg(long)]
    output: Option<PathBuf>,

    /// JSON file for the categorical vocabularies.
    #[arg(long)]
    vocab_output: Option<PathBuf>,

    /// Append run outcomes to this log file.
    #[arg(long)]
    event_log: Option<PathBuf>,

    #[arg(long)]
    days: Option<usize>,

    /// Categorical modulus; values <= 0 keep the raw key.
    #[arg(long, allow_negative_numbers = true)]
    max_ind_range: Option<i64>,

    /// Probability of dropping a label-0 row.
    #[arg(long)]
    sub_sample_rate: Option<f64>,

    /// total, day or none.
    #[arg(long)]
    randomize: Option<Randomize>,

    /// train or none.
    #[arg(long)]
    data_split: Option<DataSplit>,

    /// Shuffle through memory-mapped bucket files.
    #[arg(long)]
    memory_map: bool,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    num_threads: Option<usize>,

    #[arg(long)]
    max_in_flight_days: Option<usize>,

    #[arg(long)]
    delimiter: Option<char>,

    /// Directory for bucket files (defaults to the input's directory).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep processed and intermediate bucket files.
    #[arg(long)]
    keep_intermediates: bool,
}

impl Args {
    fn options(&self) -> PreprocessResult<PreprocessOptions> {
        let mut opts = match &self.config {
            Some(path) => PreprocessOptions::from_json_path(path)?,
            None => PreprocessOptions::default(),
        };
        if let Some(v) = self.days {
            opts.days = v;
        }
        if let Some(v) = self.max_ind_range {
            opts.max_ind_range = v;
        }
        if let Some(v) = self.sub_sample_rate {
            opts.sub_sample_rate = v;
        }
        if let Some(v) = self.randomize {
            opts.randomize = v;
        }
        if let Some(v) = self.data_split {
            opts.data_split = v;
        }
        if let Some(v) = self.seed {
            opts.seed = Some(v);
        }
        if let Some(v) = self.num_threads {
            opts.num_threads = Some(v);
        }
        if let Some(v) = self.max_in_flight_days {
            opts.max_in_flight_days = v;
        }
        if let Some(v) = self.delimiter {
            opts.delimiter = v;
        }
        if self.work_dir.is_some() {
            opts.work_dir = self.work_dir.clone();
        }
        opts.memory_map |= self.memory_map;
        opts.keep_intermediates |= self.keep_intermediates;

        let mut observers: Vec<Arc<dyn PipelineObserver>> = vec![Arc::new(TracingObserver)];
        if let Some(path) = &self.event_log {
            observers.push(Arc::new(FileObserver::new(path)));
        }
        opts.observer = Some(Arc::new(CompositeObserver::new(observers)));
        opts.alert_at_or_above = Severity::Critical;
        Ok(opts)
    }

    fn layout(&self) -> InputLayout {
        match (&self.input, &self.day_files) {
            (Some(path), _) => InputLayout::SingleFile(path.clone()),
            (None, Some(prefix)) => InputLayout::DayFiles {
                prefix: prefix.clone(),
            },
            // clap enforces one of the two.
            (None, None) => unreachable!("either --input or --day-files is required"),
        }
    }
}

fn run(args: &Args) -> PreprocessResult<PreprocessReport> {
    let opts = args.options()?;
    let layout = args.layout();
    info!(?layout, "preprocessing");

    match (&args.output, &args.vocab_output) {
        (Some(output), Some(vocab)) => {
            let report = preprocess_to_parquet_with_vocabulary(&layout, output, vocab, opts)?;
            info!(path = %vocab.display(), "wrote vocabularies");
            Ok(report)
        }
        (Some(output), None) => preprocess_to_parquet(&layout, output, opts),
        (None, vocab) => {
            // Nothing to publish: keep bucket sizes only.
            let mut sink = CountingSink::new();
            let report = Preprocessor::new(opts)?.run(&layout, &mut sink)?;
            info!(buckets = ?sink.bucket_sizes(), "dataset not written (no --output)");
            if let Some(path) = vocab {
                report.vocabulary.save_json(path)?;
                info!(path = %path.display(), "wrote vocabularies");
            }
            Ok(report)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(report) => {
            info!(
                seed = report.seed,
                rows = report.total_rows,
                vocab = ?report.vocabulary.counts(),
                metrics = %report.metrics,
                "done"
            );
            for (stage, elapsed) in &report.stage_timings {
                info!(%stage, ?elapsed, "stage timing");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(err = %e, "preprocessing failed");
            ExitCode::FAILURE
        }
    }
}
