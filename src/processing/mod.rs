//! Vocabulary construction, day transforms and concatenation.
//!
//! - [`vocabulary`]: per-day key collection and the day-ordered merge
//! - [`transform`]: log scaling and categorical substitution
//! - [`concat`]: bucket concatenation into a [`crate::output::DatasetSink`]

pub mod concat;
pub mod transform;
pub mod vocabulary;

pub use concat::concatenate;
pub use transform::{encode_day, log_transform};
pub use vocabulary::{merge_day_uniques, ColumnVocabulary, DayUniques, VocabularySet};
