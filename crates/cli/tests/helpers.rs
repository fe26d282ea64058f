use std::fs;
use std::path::Path;

use codematch::{canonicalize_or_current, config_path, sha256_file, CONFIG_FILE};
use codematch_core::model::ContentHash;
use tempfile::tempdir;

#[test]
fn canonicalize_or_current_returns_cwd_for_dot() {
    let result = canonicalize_or_current(".").expect("canonicalize");
    assert_eq!(result, std::env::current_dir().expect("cwd"));
}

#[test]
fn canonicalize_or_current_resolves_existing_path() {
    let tmp = tempdir().expect("tempdir");
    let subdir = tmp.path().join("nested");
    fs::create_dir_all(&subdir).expect("create nested");

    let result = canonicalize_or_current(subdir.to_str().expect("utf-8 path")).expect("resolve");
    assert_eq!(result, subdir.canonicalize().expect("canonicalize subdir"));
}

#[test]
fn canonicalize_or_current_keeps_missing_paths() {
    let result = canonicalize_or_current("does-not-exist-yet").expect("resolve");
    assert!(result.is_absolute());
    assert!(result.ends_with("does-not-exist-yet"));
}

#[test]
fn config_path_is_under_root() {
    assert_eq!(config_path(Path::new("/tmp/project")), Path::new("/tmp/project").join(CONFIG_FILE));
}

#[test]
fn sha256_file_matches_in_memory_digest() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("sample.bin");
    // Larger than one read buffer.
    let contents: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &contents).expect("write sample");

    assert_eq!(sha256_file(&path).expect("hash"), ContentHash::of(&contents));
}

#[test]
fn sha256_file_errors_on_missing_file() {
    let tmp = tempdir().expect("tempdir");
    let err = sha256_file(&tmp.path().join("missing.bin")).unwrap_err();
    assert!(err.to_string().contains("Failed to open binary for hashing"));
}
