use std::fs;

use stack_analyzer::{read_text, sha256_file};
use tempfile::tempdir;

#[test]
fn sha256_file_hashes_contents() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("fw.bin");
    fs::write(&path, b"abc").unwrap();
    assert_eq!(
        sha256_file(&path).unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn sha256_file_reports_missing_image() {
    let temp = tempdir().unwrap();
    let err = sha256_file(&temp.path().join("missing.bin")).unwrap_err();
    assert!(err.to_string().contains("Failed to open image for hashing"));
}

#[test]
fn read_text_names_the_input() {
    let temp = tempdir().unwrap();
    let err = read_text(&temp.path().join("fw.dis"), "disassembly").unwrap_err();
    assert!(
        err.to_string().starts_with("Failed to read disassembly at "),
        "unexpected error: {err}"
    );
}
