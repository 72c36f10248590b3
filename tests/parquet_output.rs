mod common;

use click_log_prep::config::{DataSplit, PreprocessOptions, Randomize};
use click_log_prep::execution::{
    preprocess_to_dataset, preprocess_to_parquet, preprocess_to_parquet_with_vocabulary,
};
use click_log_prep::ingestion::InputLayout;
use click_log_prep::output::read_parquet_dataset;
use click_log_prep::processing::VocabularySet;
use click_log_prep::PreprocessError;

use common::{synthetic_rows, write_rows};

fn opts() -> PreprocessOptions {
    PreprocessOptions {
        days: 3,
        randomize: Randomize::Total,
        data_split: DataSplit::Train,
        max_ind_range: 100,
        seed: Some(21),
        num_threads: Some(2),
        ..Default::default()
    }
}

#[test]
fn parquet_output_matches_the_in_memory_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("train.txt");
    write_rows(&input_path, &synthetic_rows(64, 5000));
    let input = InputLayout::SingleFile(input_path);
    let out = dir.path().join("train.parquet");

    let report = preprocess_to_parquet(&input, &out, opts()).unwrap();
    let (expected, _) = preprocess_to_dataset(&input, opts()).unwrap();

    assert!(out.exists());
    assert!(!dir.path().join("train.parquet.tmp").exists());

    let ds = read_parquet_dataset(&out).unwrap();
    assert_eq!(ds.row_count(), report.total_rows);
    // One row group per bucket.
    assert_eq!(ds.bucket_sizes, vec![22, 21, 21]);
    assert_eq!(ds, expected);
}

#[test]
fn failed_run_leaves_no_parquet_file() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("bad.txt");
    std::fs::write(&input_path, "1\t2\n").unwrap();
    let out = dir.path().join("bad.parquet");

    let err = preprocess_to_parquet(&InputLayout::SingleFile(input_path), &out, opts()).unwrap_err();
    assert!(matches!(err, PreprocessError::FieldCount { found: 2, .. }));
    assert!(!out.exists());
    assert!(!dir.path().join("bad.parquet.tmp").exists());
}

#[test]
fn reading_a_missing_parquet_file_is_reported() {
    let err = read_parquet_dataset("tests/does_not_exist.parquet").unwrap_err();
    assert!(matches!(err, PreprocessError::MissingInput { .. }));
}

#[test]
fn vocabulary_is_written_before_the_dataset_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("train.txt");
    write_rows(&input_path, &synthetic_rows(30, 5000));
    let input = InputLayout::SingleFile(input_path);
    let out = dir.path().join("train.parquet");
    let vocab = dir.path().join("vocab.json");

    let report = preprocess_to_parquet_with_vocabulary(&input, &out, &vocab, opts()).unwrap();
    let loaded = VocabularySet::load_json(&vocab).unwrap();
    assert_eq!(loaded.counts(), report.vocabulary.counts());
    assert_eq!(read_parquet_dataset(&out).unwrap().row_count(), 30);
}

#[test]
fn failed_vocabulary_write_publishes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input_path = dir.path().join("train.txt");
    write_rows(&input_path, &synthetic_rows(30, 5000));
    let out = dir.path().join("train.parquet");
    let vocab = dir.path().join("no_such_dir").join("vocab.json");

    let err = preprocess_to_parquet_with_vocabulary(&InputLayout::SingleFile(input_path), &out, &vocab, opts())
        .unwrap_err();
    assert!(matches!(err, PreprocessError::Io(_)));
    assert!(!out.exists());
    assert!(!dir.path().join("train.parquet.tmp").exists());
}
