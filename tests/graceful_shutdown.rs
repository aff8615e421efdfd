//! Cancellation stops dispatch while keeping results well-formed.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use deepcarve::processing::process_file;

use common::{blob_bytes, test_config, write_input};

#[test]
fn preset_cancel_flag_stops_processing_before_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let input = write_input(dir.path(), "image.bin", &blob_bytes(b"never extracted"));

    let cancel = Arc::new(AtomicBool::new(true));
    let reports = process_file(&test_config(&out, 1), &input, cancel);

    assert!(reports.is_empty());
    assert!(!out.join("image.bin_extract").exists());
}

#[test]
fn preset_cancel_flag_stops_threaded_pool() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();

    let input = write_input(dir.path(), "image.bin", &blob_bytes(b"never extracted"));

    let cancel = Arc::new(AtomicBool::new(true));
    let reports = process_file(&test_config(&out, 4), &input, cancel);

    assert!(reports.is_empty());
    assert!(!out.join("image.bin_extract").exists());
}
