//! Input layout and per-day row reading.
//!
//! Two layouts are supported:
//!
//! - [`InputLayout::SingleFile`]: one delimited file, split into `days` contiguous slices by
//!   [`DaySplit::even`]. A counting scan records the byte offset where each day starts, so every
//!   day worker can seek straight to its slice.
//! - [`InputLayout::DayFiles`]: files `<prefix>_0` .. `<prefix>_{days-1}`, one per day.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info};

use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::PipelineStage;
use crate::types::{NUM_FIELDS, Record};

use super::decoder::{LineDecoder, RowLocation};
use super::splitter::DaySplit;

/// Where the raw rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLayout {
    /// A single file split into days by row position.
    SingleFile(PathBuf),
    /// One file per day, named `<prefix>_<day>`.
    DayFiles { prefix: PathBuf },
}

impl InputLayout {
    /// The directory bucket files default to.
    pub fn directory(&self) -> PathBuf {
        let path = match self {
            Self::SingleFile(path) => path.as_path(),
            Self::DayFiles { prefix } => prefix.as_path(),
        };
        path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// File-name stem used to name bucket files.
    pub fn stem(&self) -> String {
        let path = match self {
            Self::SingleFile(path) => path.as_path(),
            Self::DayFiles { prefix } => prefix.as_path(),
        };
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string())
    }

    /// Path of the per-day file for `day` (only meaningful for [`Self::DayFiles`]).
    pub fn day_file(prefix: &Path, day: usize) -> PathBuf {
        let mut name = prefix.as_os_str().to_os_string();
        name.push(format!("_{day}"));
        PathBuf::from(name)
    }
}

/// One day's slice of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayInput {
    pub day: usize,
    pub path: PathBuf,
    /// Byte offset of the day's first row within `path`.
    pub start_byte: u64,
    /// Number of raw rows (before sub-sampling).
    pub rows: usize,
}

/// The fixed day partition of an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPlan {
    pub split: DaySplit,
    pub days: Vec<DayInput>,
}

impl InputPlan {
    pub fn total_rows(&self) -> usize {
        self.split.total()
    }
}

/// Scan the input and compute its day partition.
pub fn plan_input(layout: &InputLayout, days: usize) -> PreprocessResult<InputPlan> {
    match layout {
        InputLayout::SingleFile(path) => plan_single_file(path, days),
        InputLayout::DayFiles { prefix } => plan_day_files(prefix, days),
    }
}

fn plan_single_file(path: &Path, days: usize) -> PreprocessResult<InputPlan> {
    ensure_exists(path)?;
    info!(path = %path.display(), "counting rows");
    let scan = scan_lines(path, |_, _| {})?;
    let split = DaySplit::even(scan.rows, days)?;
    let boundaries = split.boundaries();
    if let Some(row) = scan.first_blank {
        // day_of is Some for every row below the total.
        let day = split.day_of(row).unwrap_or(days - 1);
        return Err(blank_line(day, row - boundaries[day]));
    }

    // Second scan: byte offset of the first row of every day. Days past the last row start at
    // the end of the file.
    let mut starts = vec![scan.bytes; days];
    starts[0] = 0;
    let mut next_day = 1usize;
    scan_lines(path, |row, byte| {
        while next_day < days && boundaries[next_day] == row {
            starts[next_day] = byte;
            next_day += 1;
        }
    })?;

    let day_inputs = (0..days)
        .map(|day| DayInput {
            day,
            path: path.to_path_buf(),
            start_byte: starts[day],
            rows: split.capacity(day),
        })
        .collect();
    debug!(capacities = ?split.capacities(), "split input into days");
    Ok(InputPlan {
        split,
        days: day_inputs,
    })
}

fn plan_day_files(prefix: &Path, days: usize) -> PreprocessResult<InputPlan> {
    if days == 0 {
        return Err(PreprocessError::invalid_config("days must be > 0"));
    }
    let mut day_inputs = Vec::with_capacity(days);
    for day in 0..days {
        let path = InputLayout::day_file(prefix, day);
        ensure_exists(&path)?;
        info!(path = %path.display(), "counting rows");
        let scan = scan_lines(&path, |_, _| {})?;
        if let Some(row) = scan.first_blank {
            return Err(blank_line(day, row));
        }
        day_inputs.push(DayInput {
            day,
            path,
            start_byte: 0,
            rows: scan.rows,
        });
    }
    let split = DaySplit::from_capacities(day_inputs.iter().map(|d| d.rows).collect());
    Ok(InputPlan {
        split,
        days: day_inputs,
    })
}

fn ensure_exists(path: &Path) -> PreprocessResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(PreprocessError::MissingInput {
            path: path.to_path_buf(),
        })
    }
}

/// Line framing of one input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineScan {
    /// Lines in the file, blank ones included.
    rows: usize,
    /// File length in bytes.
    bytes: u64,
    /// Index of the first line without any content.
    first_blank: Option<usize>,
}

/// Walk the `\n`-terminated lines of `path`, calling `at_line(row, start_byte)` for each.
///
/// Every line counts as a row, so a blank line keeps its place in the day split and is reported
/// instead of being skipped.
fn scan_lines(path: &Path, mut at_line: impl FnMut(usize, u64)) -> PreprocessResult<LineScan> {
    let mut reader = BufReader::with_capacity(1 << 20, File::open(path)?);
    let mut buf = Vec::new();
    let mut scan = LineScan {
        rows: 0,
        bytes: 0,
        first_blank: None,
    };
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(scan);
        }
        at_line(scan.rows, scan.bytes);
        if scan.first_blank.is_none() && buf.iter().all(|&b| b == b'\n' || b == b'\r') {
            scan.first_blank = Some(scan.rows);
        }
        scan.bytes += n as u64;
        scan.rows += 1;
    }
}

/// A blank line is a row with no fields.
fn blank_line(day: usize, row: usize) -> PreprocessError {
    PreprocessError::FieldCount {
        stage: PipelineStage::Split,
        day,
        row,
        expected: NUM_FIELDS,
        found: 0,
    }
}

fn reader_builder(delimiter: u8) -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .delimiter(delimiter);
    builder
}

/// Sequential reader over exactly one day's raw rows.
pub struct DayReader {
    rdr: csv::Reader<File>,
    record: csv::StringRecord,
    day: usize,
    expected: usize,
    read: usize,
}

impl DayReader {
    /// Open `input` and position the reader at its first row.
    pub fn open(input: &DayInput, delimiter: u8) -> PreprocessResult<Self> {
        ensure_exists(&input.path)?;
        let file = File::open(&input.path)?;
        let mut rdr = reader_builder(delimiter).from_reader(file);
        if input.start_byte > 0 {
            let mut pos = csv::Position::new();
            pos.set_byte(input.start_byte);
            rdr.seek(pos)?;
        }
        Ok(Self {
            rdr,
            record: csv::StringRecord::new(),
            day: input.day,
            expected: input.rows,
            read: 0,
        })
    }

    /// Next raw row of the day, or `None` once the day's rows are exhausted.
    ///
    /// A file that ends before the day's row count is reached is a fatal error.
    pub fn next_record(&mut self) -> PreprocessResult<Option<&csv::StringRecord>> {
        if self.read == self.expected {
            return Ok(None);
        }
        if !self.rdr.read_record(&mut self.record)? {
            return Err(PreprocessError::RowCountMismatch {
                stage: PipelineStage::Split,
                day: self.day,
                expected: self.expected,
                actual: self.read,
            });
        }
        self.read += 1;
        Ok(Some(&self.record))
    }

    /// Number of raw rows returned so far.
    pub fn rows_read(&self) -> usize {
        self.read
    }
}

/// Decode every row of a day, feeding kept records to `sink`.
///
/// Returns the number of records kept after sub-sampling.
pub fn for_each_record<R, F>(
    input: &DayInput,
    delimiter: u8,
    decoder: &LineDecoder,
    rng: &mut R,
    stage: PipelineStage,
    mut sink: F,
) -> PreprocessResult<usize>
where
    R: Rng + ?Sized,
    F: FnMut(Record),
{
    let mut reader = DayReader::open(input, delimiter)?;
    let mut kept = 0usize;
    let mut row = 0usize;
    while let Some(record) = reader.next_record()? {
        let loc = RowLocation {
            stage,
            day: input.day,
            row,
        };
        if let Some(rec) = decoder.decode_record(record, rng, loc)? {
            sink(rec);
            kept += 1;
        }
        row += 1;
    }
    Ok(kept)
}
