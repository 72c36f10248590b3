//! Parquet output.
//!
//! Layout: one `INT32` `label` column, [`NUM_DENSE`] `FLOAT` columns `dense_<j>` and
//! [`NUM_SPARSE`] `INT32 (UINT_32)` columns `sparse_<j>`. Each bucket becomes one row group, so
//! the file keeps the day partitioning while holding the whole dataset.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parquet::column::writer::ColumnWriter;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::FileReader;
use parquet::file::serialized_reader::SerializedFileReader;
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::parser::parse_message_type;
use tracing::{debug, info};

use crate::error::{PreprocessError, PreprocessResult};
use crate::ingestion::decoder::{dense_column_name, sparse_column_name};
use crate::types::{DataSet, DayArrays, NUM_DENSE, NUM_SPARSE};

use super::DatasetSink;

fn message_type() -> String {
    let mut out = String::from("message click_log {\n  REQUIRED INT32 label;\n");
    for j in 0..NUM_DENSE {
        out.push_str(&format!("  REQUIRED FLOAT {};\n", dense_column_name(j)));
    }
    for j in 0..NUM_SPARSE {
        out.push_str(&format!("  REQUIRED INT32 {} (UINT_32);\n", sparse_column_name(j)));
    }
    out.push('}');
    out
}

/// Streams buckets into a Parquet file.
///
/// Rows are written to `<path>.tmp`; the file is renamed to `path` only once the dataset is
/// complete, so a failed run never leaves a partial file at the final location. A sink built with
/// [`Self::create`] publishes in [`DatasetSink::finish`]; one built with [`Self::deferred`] waits
/// for an explicit [`Self::publish`], letting the caller persist companion files first.
pub struct ParquetSink {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<SerializedFileWriter<File>>,
    rows_written: usize,
    publish_on_finish: bool,
    published: bool,
}

impl ParquetSink {
    /// Create a sink that publishes `path` when finished.
    pub fn create(path: impl AsRef<Path>) -> PreprocessResult<Self> {
        Self::open(path.as_ref(), true)
    }

    /// Create a sink that keeps the finished file at its temporary name until [`Self::publish`].
    pub fn deferred(path: impl AsRef<Path>) -> PreprocessResult<Self> {
        Self::open(path.as_ref(), false)
    }

    fn open(path: &Path, publish_on_finish: bool) -> PreprocessResult<Self> {
        let path = path.to_path_buf();
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let schema = Arc::new(parse_message_type(&message_type())?);
        let props = Arc::new(WriterProperties::builder().build());
        let file = File::create(&tmp_path)?;
        let writer = SerializedFileWriter::new(file, schema, props)?;
        Ok(Self {
            path,
            tmp_path,
            writer: Some(writer),
            rows_written: 0,
            publish_on_finish,
            published: false,
        })
    }

    /// Number of rows written so far.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Rename the finished file into place.
    ///
    /// Fails if the dataset has not been finished yet. Publishing twice is a no-op.
    pub fn publish(&mut self) -> PreprocessResult<()> {
        if self.published {
            return Ok(());
        }
        if self.writer.is_some() {
            return Err(PreprocessError::Io(std::io::Error::other(
                "parquet sink published before the dataset was finished",
            )));
        }
        std::fs::rename(&self.tmp_path, &self.path)?;
        self.published = true;
        info!(path = %self.path.display(), rows = self.rows_written, "wrote parquet dataset");
        Ok(())
    }
}

impl DatasetSink for ParquetSink {
    fn write_bucket(&mut self, bucket: usize, arrays: &DayArrays) -> PreprocessResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            PreprocessError::Io(std::io::Error::other("parquet sink already finished"))
        })?;

        let mut rg = writer.next_row_group()?;
        let mut col_idx: usize = 0;
        while let Some(mut col) = rg.next_column()? {
            match col.untyped() {
                ColumnWriter::Int32ColumnWriter(w) if col_idx == 0 => {
                    w.write_batch(&arrays.labels, None, None)?;
                }
                ColumnWriter::FloatColumnWriter(w) => {
                    let j = col_idx - 1;
                    let values: Vec<f32> = arrays.continuous.iter().map(|row| row[j]).collect();
                    w.write_batch(&values, None, None)?;
                }
                ColumnWriter::Int32ColumnWriter(w) => {
                    let j = col_idx - 1 - NUM_DENSE;
                    // UINT_32 columns carry the unsigned bit pattern in physical INT32.
                    let values: Vec<i32> = arrays.categorical.iter().map(|row| row[j] as i32).collect();
                    w.write_batch(&values, None, None)?;
                }
                _ => {
                    return Err(PreprocessError::Io(std::io::Error::other(format!(
                        "unexpected parquet column writer at column {col_idx}"
                    ))));
                }
            }
            col.close()?;
            col_idx += 1;
        }
        rg.close()?;
        self.rows_written += arrays.row_count();
        debug!(bucket, rows = arrays.row_count(), "wrote parquet row group");
        Ok(())
    }

    fn finish(&mut self) -> PreprocessResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
            if self.publish_on_finish {
                self.publish()?;
            }
        }
        Ok(())
    }
}

impl Drop for ParquetSink {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Read a file written by [`ParquetSink`] back into memory.
///
/// Each row group becomes one entry of [`DataSet::bucket_sizes`].
pub fn read_parquet_dataset(path: impl AsRef<Path>) -> PreprocessResult<DataSet> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PreprocessError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    let reader = SerializedFileReader::try_from(path)?;
    let bucket_sizes = reader
        .metadata()
        .row_groups()
        .iter()
        .map(|rg| rg.num_rows() as usize)
        .collect();

    let mut arrays = DayArrays::default();
    for (idx0, row_res) in reader.into_iter().enumerate() {
        let row = row_res?;
        let mut map: HashMap<&str, &Field> = HashMap::new();
        for (name, field) in row.get_column_iter() {
            map.insert(name.as_str(), field);
        }
        let lookup = |name: &str| {
            map.get(name).copied().ok_or_else(|| PreprocessError::Parquet(
                parquet::errors::ParquetError::General(format!("row {idx0} missing column '{name}'")),
            ))
        };

        let label = match lookup("label")? {
            Field::Int(v) => *v,
            other => return Err(unexpected(idx0, "label", other)),
        };
        let mut continuous = [0f32; NUM_DENSE];
        for (j, slot) in continuous.iter_mut().enumerate() {
            let name = dense_column_name(j);
            *slot = match lookup(&name)? {
                Field::Float(v) => *v,
                other => return Err(unexpected(idx0, &name, other)),
            };
        }
        let mut categorical = [0u32; NUM_SPARSE];
        for (j, slot) in categorical.iter_mut().enumerate() {
            let name = sparse_column_name(j);
            *slot = match lookup(&name)? {
                Field::UInt(v) => *v,
                Field::Int(v) => *v as u32,
                other => return Err(unexpected(idx0, &name, other)),
            };
        }
        arrays.push(label, continuous, categorical);
    }

    Ok(DataSet {
        arrays,
        bucket_sizes,
    })
}

fn unexpected(row: usize, column: &str, field: &Field) -> PreprocessError {
    PreprocessError::Parquet(parquet::errors::ParquetError::General(format!(
        "row {row} column '{column}': unexpected value {field}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lists_every_column_in_order() {
        let schema = parse_message_type(&message_type()).unwrap();
        let names: Vec<String> = schema.get_fields().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names.len(), 1 + NUM_DENSE + NUM_SPARSE);
        assert_eq!(names[0], "label");
        assert_eq!(names[1], "dense_0");
        assert_eq!(names[1 + NUM_DENSE], "sparse_0");
    }

    #[test]
    fn deferred_sink_publishes_only_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let mut arrays = DayArrays::default();
        arrays.push(1, [0.5; NUM_DENSE], [7; NUM_SPARSE]);

        let mut sink = ParquetSink::deferred(&path).unwrap();
        sink.write_bucket(0, &arrays).unwrap();
        assert!(sink.publish().is_err());
        sink.finish().unwrap();
        assert!(!path.exists());
        sink.publish().unwrap();
        assert_eq!(sink.rows_written(), 1);
        drop(sink);

        let ds = read_parquet_dataset(&path).unwrap();
        assert_eq!(ds.bucket_sizes, vec![1]);
        assert_eq!(ds.arrays, arrays);
    }

    #[test]
    fn unpublished_sink_cleans_up_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let mut sink = ParquetSink::deferred(&path).unwrap();
        sink.finish().unwrap();
        drop(sink);
        assert!(!path.exists());
        assert!(!dir.path().join("out.parquet.tmp").exists());
    }
}
