//! `click-log-prep` turns a very large click-through log into a shuffled, day-partitioned
//! training dataset without holding the log in memory.
//!
//! Every raw row is one label, 13 integer features and 26 hexadecimal categorical keys, separated
//! by tabs. A run:
//!
//! 1. splits the rows into `days` contiguous buckets by position ([`ingestion::splitter`])
//! 2. decodes every day once to count rows and collect first-seen categorical keys
//!    ([`ingestion::decoder`], [`processing::vocabulary`])
//! 3. merges the keys in day order into one dense vocabulary per categorical column
//! 4. decodes every day again, log-scales the integer features and replaces categorical keys by
//!    their vocabulary index ([`processing::transform`])
//! 5. shuffles rows across and within buckets with a two-pass external shuffle ([`shuffle`])
//! 6. concatenates the finished buckets into an output sink ([`processing::concat`], [`output`])
//!
//! Row counts are checked at every step: the output holds exactly the rows kept after
//! sub-sampling, and the shuffle never changes the multiset of rows.
//!
//! ## Quick example: run the pipeline
//!
//! ```no_run
//! use click_log_prep::config::{PreprocessOptions, Randomize};
//! use click_log_prep::execution::preprocess_to_parquet;
//! use click_log_prep::ingestion::InputLayout;
//!
//! # fn main() -> Result<(), click_log_prep::PreprocessError> {
//! let opts = PreprocessOptions {
//!     days: 24,
//!     max_ind_range: 40_000_000,
//!     randomize: Randomize::Total,
//!     memory_map: true,
//!     seed: Some(1234),
//!     ..Default::default()
//! };
//! let report = preprocess_to_parquet(
//!     &InputLayout::DayFiles { prefix: "data/day".into() },
//!     "data/train.parquet",
//!     opts,
//! )?;
//! report.vocabulary.save_json("data/vocab.json")?;
//! println!("rows={} counts={:?}", report.total_rows, report.vocabulary.counts());
//! # Ok(())
//! # }
//! ```
//!
//! ## Decoding a single line
//!
//! ```rust
//! use click_log_prep::execution::PipelineStage;
//! use click_log_prep::ingestion::{LineDecoder, RowLocation};
//! use rand::rngs::mock::StepRng;
//!
//! let mut fields = vec!["1".to_string()];
//! fields.extend(std::iter::repeat("-3".to_string()).take(13));
//! fields.extend(std::iter::repeat("0A".to_string()).take(26));
//! let line = fields.join("\t");
//!
//! let decoder = LineDecoder::new(Some(4), 0.0);
//! let loc = RowLocation { stage: PipelineStage::Encoded, day: 0, row: 0 };
//! let record = decoder.decode_line(&line, &mut StepRng::new(0, 0), loc).unwrap().unwrap();
//! assert_eq!(record.label, 1);
//! assert_eq!(record.continuous[0], -3);
//! assert_eq!(record.categorical[0], 2); // 0x0A % 4
//! ```
//!
//! ## Observing a run
//!
//! Attach a [`execution::PipelineObserver`] through [`config::PreprocessOptions::observer`] to
//! receive stage and bucket events, success stats, failures with a [`execution::Severity`], and
//! alerts at or above [`config::PreprocessOptions::alert_at_or_above`].
//!
//! ## Modules
//!
//! - [`config`]: run options
//! - [`ingestion`]: input layout, day split and line decoding
//! - [`processing`]: vocabularies, transforms and concatenation
//! - [`shuffle`]: shuffle plan and on-disk bucket arrays
//! - [`output`]: in-memory and Parquet sinks
//! - [`execution`]: the stage state machine, worker pool, metrics and observers
//! - [`error`]: the error type shared by every stage

pub mod config;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod output;
pub mod processing;
pub mod rng;
pub mod shuffle;
pub mod types;

pub use error::{PreprocessError, PreprocessResult};
