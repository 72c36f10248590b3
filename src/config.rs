//! Pipeline configuration.
//!
//! [`PreprocessOptions`] is a plain struct with a [`Default`] covering common cases. It can also be
//! read from a JSON file (missing keys fall back to defaults):
//!
//! ```no_run
//! use click_log_prep::config::PreprocessOptions;
//!
//! # fn main() -> Result<(), click_log_prep::PreprocessError> {
//! let opts = PreprocessOptions::from_json_path("prep.json")?;
//! opts.validate()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::{PipelineObserver, Severity};

/// How rows are shuffled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Randomize {
    /// Redistribute rows across buckets, then permute within each bucket.
    #[default]
    Total,
    /// Keep rows in their day, permute within each bucket.
    Day,
    /// Keep the input order.
    None,
}

impl Randomize {
    /// Whether pass 1 draws random target buckets.
    pub fn redistributes(self) -> bool {
        matches!(self, Self::Total)
    }

    /// Whether pass 2 applies a random permutation.
    pub fn permutes(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl FromStr for Randomize {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "total" => Ok(Self::Total),
            "day" => Ok(Self::Day),
            "none" => Ok(Self::None),
            other => Err(PreprocessError::invalid_config(format!(
                "randomize must be one of total/day/none, got '{other}'"
            ))),
        }
    }
}

/// Whether the last day is held out from shuffling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSplit {
    /// Reserve the last day/bucket: its rows never cross a bucket boundary and keep their order.
    #[default]
    Train,
    /// Every day takes part in shuffling.
    None,
}

impl DataSplit {
    pub fn reserves_last_day(self) -> bool {
        matches!(self, Self::Train)
    }
}

impl FromStr for DataSplit {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "none" => Ok(Self::None),
            other => Err(PreprocessError::invalid_config(format!(
                "data_split must be one of train/none, got '{other}'"
            ))),
        }
    }
}

/// Options controlling a preprocessing run.
///
/// Use [`Default`] for common cases.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    /// Categorical modulus. Values `<= 0` keep the raw parsed key.
    pub max_ind_range: i64,
    /// Probability of dropping a label-0 row, in `[0, 1]`.
    pub sub_sample_rate: f64,
    /// Number of day buckets.
    pub days: usize,
    /// Shuffle mode.
    pub randomize: Randomize,
    /// Whether the last day is reserved (kept un-shuffled).
    pub data_split: DataSplit,
    /// Shuffle through memory-mapped bucket files instead of in-memory buckets.
    pub memory_map: bool,
    /// Seed for sub-sampling, bucket sampling and permutations. A random seed is drawn (and
    /// logged) when unset.
    pub seed: Option<u64>,
    /// Worker threads. If `None`, uses the platform's available parallelism.
    pub num_threads: Option<usize>,
    /// Upper bound on day workers holding a day's rows at the same time.
    pub max_in_flight_days: usize,
    /// Field delimiter of the raw input.
    pub delimiter: char,
    /// Directory for bucket files. Defaults to the input's directory.
    pub work_dir: Option<PathBuf>,
    /// Keep the processed and intermediate bucket files after the run.
    pub keep_intermediates: bool,
    /// Optional observer for stage events, failures and alerts.
    #[serde(skip)]
    pub observer: Option<Arc<dyn PipelineObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    #[serde(skip)]
    pub alert_at_or_above: Severity,
}

impl fmt::Debug for PreprocessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessOptions")
            .field("max_ind_range", &self.max_ind_range)
            .field("sub_sample_rate", &self.sub_sample_rate)
            .field("days", &self.days)
            .field("randomize", &self.randomize)
            .field("data_split", &self.data_split)
            .field("memory_map", &self.memory_map)
            .field("seed", &self.seed)
            .field("num_threads", &self.num_threads)
            .field("max_in_flight_days", &self.max_in_flight_days)
            .field("delimiter", &self.delimiter)
            .field("work_dir", &self.work_dir)
            .field("keep_intermediates", &self.keep_intermediates)
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            max_ind_range: -1,
            sub_sample_rate: 0.0,
            days: 7,
            randomize: Randomize::default(),
            data_split: DataSplit::default(),
            memory_map: false,
            seed: None,
            num_threads: Some(n),
            max_in_flight_days: n.max(1),
            delimiter: '\t',
            work_dir: None,
            keep_intermediates: false,
            observer: None,
            alert_at_or_above: Severity::Critical,
        }
    }
}

impl PreprocessOptions {
    /// Read options from a JSON file. Keys that are absent keep their default value.
    pub fn from_json_path(path: impl AsRef<Path>) -> PreprocessResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PreprocessError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The categorical modulus, if one is configured.
    pub fn modulus(&self) -> Option<u64> {
        u64::try_from(self.max_ind_range).ok().filter(|&m| m > 0)
    }

    /// The delimiter as a single byte.
    pub fn delimiter_byte(&self) -> PreprocessResult<u8> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                PreprocessError::invalid_config(format!(
                    "delimiter must be a single ASCII character, got {:?}",
                    self.delimiter
                ))
            })
    }

    /// Reject out-of-range options.
    pub fn validate(&self) -> PreprocessResult<()> {
        if self.days == 0 {
            return Err(PreprocessError::invalid_config("days must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.sub_sample_rate) {
            return Err(PreprocessError::invalid_config(format!(
                "sub_sample_rate must be in [0, 1], got {}",
                self.sub_sample_rate
            )));
        }
        if self.max_in_flight_days == 0 {
            return Err(PreprocessError::invalid_config("max_in_flight_days must be > 0"));
        }
        if self.num_threads == Some(0) {
            return Err(PreprocessError::invalid_config("num_threads must be > 0 when set"));
        }
        self.delimiter_byte()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let opts = PreprocessOptions::default();
        opts.validate().unwrap();
        assert_eq!(opts.modulus(), None);
        assert_eq!(opts.delimiter_byte().unwrap(), b'\t');
    }

    #[test]
    fn modulus_is_disabled_for_non_positive_ranges() {
        let mut opts = PreprocessOptions::default();
        opts.max_ind_range = 0;
        assert_eq!(opts.modulus(), None);
        opts.max_ind_range = 4;
        assert_eq!(opts.modulus(), Some(4));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let opts = PreprocessOptions {
            days: 0,
            ..Default::default()
        };
        assert!(opts.validate().unwrap_err().to_string().contains("days must be > 0"));

        let opts = PreprocessOptions {
            sub_sample_rate: 1.5,
            ..Default::default()
        };
        assert!(opts.validate().unwrap_err().to_string().contains("sub_sample_rate"));

        let opts = PreprocessOptions {
            sub_sample_rate: f64::NAN,
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = PreprocessOptions {
            delimiter: 'é',
            ..Default::default()
        };
        assert!(opts.validate().unwrap_err().to_string().contains("delimiter"));
    }

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!("TOTAL".parse::<Randomize>().unwrap(), Randomize::Total);
        assert_eq!("day".parse::<Randomize>().unwrap(), Randomize::Day);
        assert_eq!("None".parse::<DataSplit>().unwrap(), DataSplit::None);
        assert!("sometimes".parse::<Randomize>().is_err());
    }

    #[test]
    fn json_keys_override_defaults() {
        let opts: PreprocessOptions =
            serde_json::from_str(r#"{"days": 24, "randomize": "day", "max_ind_range": 40000000}"#).unwrap();
        assert_eq!(opts.days, 24);
        assert_eq!(opts.randomize, Randomize::Day);
        assert_eq!(opts.modulus(), Some(40_000_000));
        assert_eq!(opts.data_split, DataSplit::Train);
        assert!(opts.observer.is_none());
    }
}
