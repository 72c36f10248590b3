#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use click_log_prep::types::{NUM_DENSE, NUM_SPARSE};

/// One raw log row before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub label: i32,
    pub dense: [i32; NUM_DENSE],
    pub sparse: [u64; NUM_SPARSE],
}

impl RawRow {
    pub fn to_line(&self) -> String {
        let mut fields = vec![self.label.to_string()];
        fields.extend(self.dense.iter().map(|v| v.to_string()));
        fields.extend(self.sparse.iter().map(|k| format!("{k:x}")));
        fields.join("\t")
    }
}

/// Deterministic rows with a mix of labels, negative integers and repeating keys.
pub fn synthetic_rows(n: usize, key_space: u64) -> Vec<RawRow> {
    (0..n)
        .map(|i| {
            let mut dense = [0i32; NUM_DENSE];
            for (j, v) in dense.iter_mut().enumerate() {
                *v = ((i * 7 + j * 3) % 23) as i32 - 4;
            }
            let mut sparse = [0u64; NUM_SPARSE];
            for (j, k) in sparse.iter_mut().enumerate() {
                *k = ((i as u64) * 31 + (j as u64) * 17 + (i as u64 % 5) * 1009) % key_space;
            }
            RawRow {
                label: i32::from(i % 3 == 0),
                dense,
                sparse,
            }
        })
        .collect()
}

pub fn write_rows(path: &Path, rows: &[RawRow]) {
    let mut w = BufWriter::new(File::create(path).unwrap());
    for row in rows {
        writeln!(w, "{}", row.to_line()).unwrap();
    }
    w.flush().unwrap();
}

/// `ln(max(v, 0) + 1)` of every dense feature, as the pipeline computes it.
pub fn expected_dense(row: &RawRow) -> [f32; NUM_DENSE] {
    row.dense.map(|v| (v.max(0) as f32).ln_1p())
}

/// Raw keys after the modulus, as the pipeline stores them in the vocabulary.
pub fn expected_keys(row: &RawRow, modulus: Option<u64>) -> [u32; NUM_SPARSE] {
    row.sparse.map(|k| match modulus {
        Some(m) => (k % m) as u32,
        None => k as u32,
    })
}
