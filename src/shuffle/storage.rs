//! On-disk bucket arrays.
//!
//! A bucket is stored as three flat little-endian files: labels (`i32`), continuous features
//! (`f32` x [`NUM_DENSE`]) and categorical indices (`u32` x [`NUM_SPARSE`]), one fixed-width
//! record per row.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{PreprocessError, PreprocessResult};
use crate::types::{DayArrays, NUM_DENSE, NUM_SPARSE};

const LABEL_WIDTH: usize = 4;
const DENSE_WIDTH: usize = 4 * NUM_DENSE;
const SPARSE_WIDTH: usize = 4 * NUM_SPARSE;

/// The three files of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketFiles {
    pub labels: PathBuf,
    pub dense: PathBuf,
    pub sparse: PathBuf,
}

impl BucketFiles {
    /// Files `<stem>_<index>_<kind>_{y,d,s}.bin` under `dir`.
    pub fn new(dir: &Path, stem: &str, index: usize, kind: &str) -> Self {
        let name = |field: &str| dir.join(format!("{stem}_{index}_{kind}_{field}.bin"));
        Self {
            labels: name("y"),
            dense: name("d"),
            sparse: name("s"),
        }
    }

    fn paths(&self) -> [(&Path, usize); 3] {
        [
            (self.labels.as_path(), LABEL_WIDTH),
            (self.dense.as_path(), DENSE_WIDTH),
            (self.sparse.as_path(), SPARSE_WIDTH),
        ]
    }

    /// Create the files pre-sized to `rows` rows.
    pub fn allocate(&self, rows: usize) -> PreprocessResult<()> {
        for (path, width) in self.paths() {
            let file = File::create(path)?;
            file.set_len((rows * width) as u64)?;
        }
        Ok(())
    }

    /// Whether all three files exist.
    pub fn exists(&self) -> bool {
        self.paths().iter().all(|(p, _)| p.exists())
    }

    /// Remove the files, ignoring ones that are already gone.
    pub fn remove(&self) -> PreprocessResult<()> {
        for (path, _) in self.paths() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Map rows `[start, start + rows)` of pre-allocated files for writing.
    pub fn map_range(&self, start: usize, rows: usize) -> PreprocessResult<RangeWriter> {
        let map = |path: &Path, width: usize| -> PreprocessResult<Option<MmapMut>> {
            if rows == 0 {
                return Ok(None);
            }
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            // SAFETY: the range belongs to this writer alone; no other mapping writes these bytes.
            let mmap = unsafe {
                MmapOptions::new()
                    .offset((start * width) as u64)
                    .len(rows * width)
                    .map_mut(&file)?
            };
            Ok(Some(mmap))
        };
        Ok(RangeWriter {
            labels: map(&self.labels, LABEL_WIDTH)?,
            dense: map(&self.dense, DENSE_WIDTH)?,
            sparse: map(&self.sparse, SPARSE_WIDTH)?,
            rows,
        })
    }

    /// Read `rows` rows back into memory.
    pub fn read(&self, rows: usize) -> PreprocessResult<DayArrays> {
        let mut out = DayArrays::with_capacity(rows);
        if rows == 0 {
            return Ok(out);
        }
        let labels = map_read(&self.labels, rows * LABEL_WIDTH)?;
        let dense = map_read(&self.dense, rows * DENSE_WIDTH)?;
        let sparse = map_read(&self.sparse, rows * SPARSE_WIDTH)?;
        for k in 0..rows {
            out.push(
                decode_label(&labels[k * LABEL_WIDTH..(k + 1) * LABEL_WIDTH]),
                decode_dense(&dense[k * DENSE_WIDTH..(k + 1) * DENSE_WIDTH]),
                decode_sparse(&sparse[k * SPARSE_WIDTH..(k + 1) * SPARSE_WIDTH]),
            );
        }
        Ok(out)
    }

    /// Write `arrays` as the complete content of the files.
    ///
    /// Each file is written under a `.tmp` name and renamed once complete.
    pub fn write(&self, arrays: &DayArrays) -> PreprocessResult<()> {
        let mut buf = [0u8; SPARSE_WIDTH];
        write_atomic(&self.labels, |w| {
            for &y in &arrays.labels {
                w.write_all(&y.to_le_bytes())?;
            }
            Ok(())
        })?;
        write_atomic(&self.dense, |w| {
            for row in &arrays.continuous {
                encode_dense(row, &mut buf[..DENSE_WIDTH]);
                w.write_all(&buf[..DENSE_WIDTH])?;
            }
            Ok(())
        })?;
        write_atomic(&self.sparse, |w| {
            for row in &arrays.categorical {
                encode_sparse(row, &mut buf);
                w.write_all(&buf)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Writable mapping of one (source, target) row range.
pub struct RangeWriter {
    labels: Option<MmapMut>,
    dense: Option<MmapMut>,
    sparse: Option<MmapMut>,
    rows: usize,
}

impl RangeWriter {
    /// Write one row at `offset` within the range.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the mapped range.
    pub fn put(&mut self, offset: usize, label: i32, dense: &[f32; NUM_DENSE], sparse: &[u32; NUM_SPARSE]) {
        assert!(offset < self.rows, "row {offset} outside mapped range of {} rows", self.rows);
        if let (Some(y), Some(d), Some(s)) = (&mut self.labels, &mut self.dense, &mut self.sparse) {
            y[offset * LABEL_WIDTH..(offset + 1) * LABEL_WIDTH].copy_from_slice(&label.to_le_bytes());
            encode_dense(dense, &mut d[offset * DENSE_WIDTH..(offset + 1) * DENSE_WIDTH]);
            encode_sparse(sparse, &mut s[offset * SPARSE_WIDTH..(offset + 1) * SPARSE_WIDTH]);
        }
    }

    /// Flush the mapped range to disk.
    pub fn flush(&self) -> PreprocessResult<()> {
        for map in [&self.labels, &self.dense, &self.sparse].into_iter().flatten() {
            map.flush()?;
        }
        Ok(())
    }
}

fn map_read(path: &Path, expected_len: usize) -> PreprocessResult<Mmap> {
    let file = File::open(path)?;
    // SAFETY: bucket files are not modified while they are read.
    let mmap = unsafe { Mmap::map(&file)? };
    if mmap.len() != expected_len {
        return Err(PreprocessError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{}: expected {expected_len} bytes, found {}",
                path.display(),
                mmap.len()
            ),
        )));
    }
    Ok(mmap)
}

fn write_atomic<F>(path: &Path, fill: F) -> PreprocessResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let mut w = BufWriter::new(File::create(&tmp)?);
    fill(&mut w)?;
    w.flush()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn encode_dense(row: &[f32; NUM_DENSE], out: &mut [u8]) {
    for (chunk, v) in out.chunks_exact_mut(4).zip(row) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

fn encode_sparse(row: &[u32; NUM_SPARSE], out: &mut [u8]) {
    for (chunk, v) in out.chunks_exact_mut(4).zip(row) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

fn word(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn decode_label(bytes: &[u8]) -> i32 {
    i32::from_le_bytes(word(bytes))
}

fn decode_dense(bytes: &[u8]) -> [f32; NUM_DENSE] {
    let mut out = [0f32; NUM_DENSE];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = f32::from_le_bytes(word(chunk));
    }
    out
}

fn decode_sparse(bytes: &[u8]) -> [u32; NUM_SPARSE] {
    let mut out = [0u32; NUM_SPARSE];
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = u32::from_le_bytes(word(chunk));
    }
    out
}
