//! Reading raw rows.
//!
//! - [`reader`]: input layouts and the per-day row reader
//! - [`splitter`]: the fixed partition of rows into days
//! - [`decoder`]: one raw line into a typed [`crate::types::Record`]

pub mod decoder;
pub mod reader;
pub mod splitter;

pub use decoder::{LineDecoder, RowLocation};
pub use reader::{plan_input, DayInput, DayReader, InputLayout, InputPlan};
pub use splitter::DaySplit;
