//! End-to-end tests for the sluice binary: build a graph from the
//! command line, run it, inspect the produced files and exit codes.

use std::path::PathBuf;
use std::process::Command;

fn sluice_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sluice"))
}

fn run_sluice(args: &[&str]) -> std::process::Output {
    Command::new(sluice_bin())
        .args(args)
        .output()
        .expect("failed to invoke sluice")
}

#[test]
fn copies_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    let payload: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(&input, &payload).expect("write input");

    let out = run_sluice(&[
        &format!("src={}", input.display()),
        &format!("dst={}", output.display()),
    ]);
    assert!(
        out.status.success(),
        "sluice failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let copied = std::fs::read(&output).expect("read output");
    assert_eq!(copied, payload);
}

#[test]
fn copies_through_passthrough_chain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    std::fs::write(&input, b"through the middle").expect("write input");

    let out = run_sluice(&[
        &format!("filein:src={}:id=A", input.display()),
        "passthrough:id=B:sid=A",
        &format!("fileout:dst={}:sid=B", output.display()),
    ]);
    assert!(
        out.status.success(),
        "sluice failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let copied = std::fs::read(&output).expect("read output");
    assert_eq!(copied, b"through the middle");
}

#[test]
fn small_blocksize_still_copies_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    let payload: Vec<u8> = (0..5000u32).map(|v| (v % 251) as u8).collect();
    std::fs::write(&input, &payload).expect("write input");

    let out = run_sluice(&[
        &format!("filein:src={}:blocksize=17", input.display()),
        &format!("dst={}", output.display()),
    ]);
    assert!(out.status.success());
    let copied = std::fs::read(&output).expect("read output");
    assert_eq!(copied, payload);
}

#[test]
fn threaded_copy_matches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    let payload: Vec<u8> = (0..100_000u32).map(|v| (v % 256) as u8).collect();
    std::fs::write(&input, &payload).expect("write input");

    let out = run_sluice(&[
        "--threads",
        "4",
        &format!("src={}", input.display()),
        &format!("dst={}", output.display()),
    ]);
    assert!(out.status.success());
    let copied = std::fs::read(&output).expect("read output");
    assert_eq!(copied, payload);
}

#[test]
fn missing_input_fails_with_resource_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.bin");
    let out = run_sluice(&[
        "src=/definitely/not/here.bin",
        &format!("dst={}", output.display()),
    ]);
    assert!(!out.status.success());
    assert_eq!(out.status.code(), Some(3), "resource errors exit with 3");
}

#[test]
fn list_shows_builtin_filters() {
    let out = run_sluice(&["--list"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for name in ["filein", "fileout", "passthrough"] {
        assert!(text.contains(name), "missing {name} in: {text}");
    }
}

#[test]
fn stats_json_is_valid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("input.bin");
    let output = dir.path().join("output.bin");
    std::fs::write(&input, b"stats payload").expect("write input");

    let out = run_sluice(&[
        "--stats=json",
        &format!("src={}", input.display()),
        &format!("dst={}", output.display()),
    ]);
    assert!(out.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("stats must be valid json");
    let filters = parsed["filters"].as_array().expect("filters array");
    assert_eq!(filters.len(), 2);
}
