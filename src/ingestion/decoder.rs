//! Line decoding: one delimited text row into a typed [`Record`].
//!
//! Rules:
//!
//! - a line has exactly [`NUM_FIELDS`] fields (label, 13 integers, 26 hexadecimal keys); any other
//!   count is fatal
//! - empty fields decode as `0`
//! - categorical keys are parsed base-16 and reduced modulo `max_ind_range` when configured
//! - with a non-zero sub-sample rate, label-0 rows are dropped when a uniform draw falls below it

use rand::Rng;

use crate::config::PreprocessOptions;
use crate::error::{PreprocessError, PreprocessResult};
use crate::execution::PipelineStage;
use crate::types::{NUM_DENSE, NUM_FIELDS, NUM_SPARSE, Record};

/// Where a line came from, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub stage: PipelineStage,
    pub day: usize,
    /// Zero-based row index within the day.
    pub row: usize,
}

/// Decodes raw lines into [`Record`]s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineDecoder {
    modulus: Option<u64>,
    sub_sample_rate: f64,
    delimiter: char,
}

impl LineDecoder {
    /// Create a decoder. `modulus` of `None` keeps the raw categorical key.
    pub fn new(modulus: Option<u64>, sub_sample_rate: f64) -> Self {
        Self {
            modulus,
            sub_sample_rate,
            delimiter: '\t',
        }
    }

    /// Build a decoder from pipeline options.
    pub fn from_options(opts: &PreprocessOptions) -> Self {
        Self {
            modulus: opts.modulus(),
            sub_sample_rate: opts.sub_sample_rate,
            delimiter: opts.delimiter,
        }
    }

    /// Use `delimiter` in [`Self::decode_line`].
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Decode one text line (a trailing line terminator is ignored).
    ///
    /// Returns `Ok(None)` when the row was dropped by sub-sampling.
    pub fn decode_line<R: Rng + ?Sized>(
        &self,
        line: &str,
        rng: &mut R,
        loc: RowLocation,
    ) -> PreprocessResult<Option<Record>> {
        let line = line.trim_end_matches(['\n', '\r']);
        let fields: Vec<&str> = line.split(self.delimiter).collect();
        self.decode_fields(&fields, rng, loc)
    }

    /// Decode one record produced by the delimited-text reader.
    pub fn decode_record<R: Rng + ?Sized>(
        &self,
        record: &csv::StringRecord,
        rng: &mut R,
        loc: RowLocation,
    ) -> PreprocessResult<Option<Record>> {
        let fields: Vec<&str> = record.iter().collect();
        self.decode_fields(&fields, rng, loc)
    }

    /// Decode already-split fields.
    pub fn decode_fields<R: Rng + ?Sized>(
        &self,
        fields: &[&str],
        rng: &mut R,
        loc: RowLocation,
    ) -> PreprocessResult<Option<Record>> {
        if fields.len() != NUM_FIELDS {
            return Err(PreprocessError::FieldCount {
                stage: loc.stage,
                day: loc.day,
                row: loc.row,
                expected: NUM_FIELDS,
                found: fields.len(),
            });
        }

        // One draw per row keeps the stream aligned with the row index.
        let draw = if self.sub_sample_rate > 0.0 {
            Some(rng.r#gen::<f64>())
        } else {
            None
        };

        let label = parse_decimal(fields[0], "label", loc)?;
        if label == 0 && draw.is_some_and(|u| u < self.sub_sample_rate) {
            return Ok(None);
        }

        let mut continuous = [0_i32; NUM_DENSE];
        for (j, slot) in continuous.iter_mut().enumerate() {
            *slot = parse_decimal(fields[1 + j], &dense_column_name(j), loc)?;
        }

        let mut categorical = [0_u32; NUM_SPARSE];
        for (j, slot) in categorical.iter_mut().enumerate() {
            *slot = self.parse_key(fields[1 + NUM_DENSE + j], j, loc)?;
        }

        Ok(Some(Record {
            label,
            continuous,
            categorical,
        }))
    }

    fn parse_key(&self, raw: &str, column: usize, loc: RowLocation) -> PreprocessResult<u32> {
        let text = or_zero(raw);
        let value = match self.modulus {
            // Reduce digit by digit so keys of any length are accepted.
            Some(m) => fold_hex_mod(text, m),
            None => u64::from_str_radix(text, 16).map_err(|e| e.to_string()),
        }
        .map_err(|message| parse_error(loc, &sparse_column_name(column), raw, message))?;
        u32::try_from(value).map_err(|_| {
            parse_error(
                loc,
                &sparse_column_name(column),
                raw,
                "categorical key does not fit in 32 bits".to_string(),
            )
        })
    }
}

/// `int(text, 16) % modulus` for hexadecimal text of any length.
fn fold_hex_mod(text: &str, modulus: u64) -> Result<u64, String> {
    let digits = text.strip_prefix('+').unwrap_or(text);
    if digits.is_empty() {
        return Err("no hexadecimal digits".to_string());
    }
    let m = u128::from(modulus);
    let mut acc: u128 = 0;
    for c in digits.chars() {
        let d = c
            .to_digit(16)
            .ok_or_else(|| format!("invalid hexadecimal digit '{c}'"))?;
        acc = (acc * 16 + u128::from(d)) % m;
    }
    // acc < modulus
    Ok(acc as u64)
}

/// Column name of dense feature `j` (also used for the Parquet output).
pub fn dense_column_name(j: usize) -> String {
    format!("dense_{j}")
}

/// Column name of categorical feature `j` (also used for the Parquet output).
pub fn sparse_column_name(j: usize) -> String {
    format!("sparse_{j}")
}

fn or_zero(raw: &str) -> &str {
    let trimmed = raw.trim();
    if trimmed.is_empty() { "0" } else { trimmed }
}

fn parse_decimal(raw: &str, column: &str, loc: RowLocation) -> PreprocessResult<i32> {
    or_zero(raw)
        .parse::<i32>()
        .map_err(|e| parse_error(loc, column, raw, e.to_string()))
}

fn parse_error(loc: RowLocation, column: &str, raw: &str, message: String) -> PreprocessError {
    PreprocessError::ParseError {
        stage: loc.stage,
        day: loc.day,
        row: loc.row,
        column: column.to_owned(),
        raw: raw.to_owned(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;

    fn loc() -> RowLocation {
        RowLocation {
            stage: PipelineStage::Encoded,
            day: 0,
            row: 0,
        }
    }

    fn line(label: &str, dense: &[&str], sparse: &[&str]) -> String {
        let mut fields = vec![label.to_string()];
        fields.extend((0..NUM_DENSE).map(|j| dense.get(j).copied().unwrap_or("1").to_string()));
        fields.extend((0..NUM_SPARSE).map(|j| sparse.get(j).copied().unwrap_or("ff").to_string()));
        fields.join("\t")
    }

    #[test]
    fn decodes_hex_keys_with_modulus() {
        let decoder = LineDecoder::new(Some(4), 0.0);
        let mut rng = StepRng::new(0, 0);
        let rec = decoder
            .decode_line(&line("1", &["7", "-3"], &["0A", "ff"]), &mut rng, loc())
            .unwrap()
            .unwrap();
        assert_eq!(rec.label, 1);
        assert_eq!(rec.continuous[0], 7);
        assert_eq!(rec.continuous[1], -3);
        assert_eq!(rec.categorical[0], 10 % 4);
        assert_eq!(rec.categorical[1], 255 % 4);
    }

    #[test]
    fn keeps_raw_keys_without_modulus() {
        let decoder = LineDecoder::new(None, 0.0);
        let mut rng = StepRng::new(0, 0);
        let rec = decoder
            .decode_line(&line("0", &[], &["68fd1e64"]), &mut rng, loc())
            .unwrap()
            .unwrap();
        assert_eq!(rec.categorical[0], 0x68fd_1e64);
    }

    #[test]
    fn empty_fields_decode_as_zero() {
        let decoder = LineDecoder::new(None, 0.0);
        let mut rng = StepRng::new(0, 0);
        let rec = decoder
            .decode_line(&line("", &["", ""], &["", " "]), &mut rng, loc())
            .unwrap()
            .unwrap();
        assert_eq!(rec.label, 0);
        assert_eq!(rec.continuous[0], 0);
        assert_eq!(rec.categorical[0], 0);
        assert_eq!(rec.categorical[1], 0);
    }

    #[test]
    fn wrong_field_count_is_fatal() {
        let decoder = LineDecoder::new(None, 0.0);
        let mut rng = StepRng::new(0, 0);
        let err = decoder.decode_line("1\t2\t3\n", &mut rng, loc()).unwrap_err();
        assert!(matches!(err, PreprocessError::FieldCount { expected: 40, found: 3, .. }));
    }

    #[test]
    fn non_numeric_field_names_the_column() {
        let decoder = LineDecoder::new(None, 0.0);
        let mut rng = StepRng::new(0, 0);
        let err = decoder
            .decode_line(&line("1", &["x"], &[]), &mut rng, loc())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("column 'dense_0'"));
        assert!(msg.contains("raw='x'"));
    }

    #[test]
    fn oversized_key_without_modulus_is_fatal() {
        let decoder = LineDecoder::new(None, 0.0);
        let mut rng = StepRng::new(0, 0);
        let err = decoder
            .decode_line(&line("1", &[], &["1ffffffff"]), &mut rng, loc())
            .unwrap_err();
        assert!(err.to_string().contains("32 bits"));
    }

    #[test]
    fn long_keys_reduce_under_a_modulus() {
        let decoder = LineDecoder::new(Some(1000), 0.0);
        let mut rng = StepRng::new(0, 0);
        // 2^80 + 0xff: (2^80 mod 1000) = 176, plus 255.
        let rec = decoder
            .decode_line(&line("1", &[], &["1000000000000000000ff"]), &mut rng, loc())
            .unwrap()
            .unwrap();
        assert_eq!(rec.categorical[0], (176 + 255) % 1000);

        let err = decoder
            .decode_line(&line("1", &[], &["12g4"]), &mut rng, loc())
            .unwrap_err();
        assert!(err.to_string().contains("column 'sparse_0'"));
    }

    #[test]
    fn comma_delimited_lines_decode() {
        let decoder = LineDecoder::new(Some(4), 0.0).with_delimiter(',');
        let mut rng = StepRng::new(0, 0);
        let text = line("1", &["7"], &["0A"]).replace('\t', ",");
        let rec = decoder.decode_line(&text, &mut rng, loc()).unwrap().unwrap();
        assert_eq!(rec.continuous[0], 7);
        assert_eq!(rec.categorical[0], 2);
    }

    #[test]
    fn full_sub_sampling_drops_every_negative() {
        let decoder = LineDecoder::new(None, 1.0);
        // StepRng yields 0 for every draw, which is below any positive rate.
        let mut rng = StepRng::new(0, 0);
        let neg = decoder.decode_line(&line("0", &[], &[]), &mut rng, loc()).unwrap();
        let pos = decoder.decode_line(&line("1", &[], &[]), &mut rng, loc()).unwrap();
        assert!(neg.is_none());
        assert!(pos.is_some());
    }

    #[test]
    fn decode_record_matches_decode_line() {
        let decoder = LineDecoder::new(Some(1000), 0.0);
        let text = line("1", &["5"], &["abc"]);
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b'\t')
            .from_reader(text.as_bytes());
        let record = rdr.records().next().unwrap().unwrap();
        let mut rng = StepRng::new(0, 0);
        assert_eq!(
            decoder.decode_record(&record, &mut rng, loc()).unwrap(),
            decoder.decode_line(&text, &mut rng, loc()).unwrap()
        );
    }
}
