//! CLI contract tests that run offline: usage failures, exit codes, and
//! batch file handling.

use assert_cmd::cargo::CommandCargoExt;
use std::process::Command;

fn medkgctl() -> Command {
    Command::cargo_bin("medkgctl").expect("medkgctl binary builds")
}

#[test]
fn unknown_adapter_exits_2_and_lists_the_roster() {
    let dir = tempfile::tempdir().unwrap();
    let output = medkgctl()
        .args(["ingest", "ctgov"])
        .env("LEDGER_PATH", dir.path().join("ledger.log"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown adapter 'ctgov'"), "{stderr}");
    assert!(stderr.contains("clinicaltrials"), "{stderr}");
}

#[test]
fn missing_batch_file_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let output = medkgctl()
        .args(["ingest", "pubmed", "--batch", "/nonexistent/batch.ndjson"])
        .env("LEDGER_PATH", dir.path().join("ledger.log"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn malformed_batch_line_exits_2_with_line_number() {
    let dir = tempfile::tempdir().unwrap();
    let batch = dir.path().join("batch.ndjson");
    std::fs::write(&batch, "{\"pmid\":\"1\"}\n{broken\n").unwrap();

    let output = medkgctl()
        .args(["ingest", "pubmed"])
        .arg("--batch")
        .arg(&batch)
        .env("LEDGER_PATH", dir.path().join("ledger.log"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"), "{stderr}");
}

#[test]
fn unavailable_telemetry_exporter_exits_2_with_install_hint() {
    let dir = tempfile::tempdir().unwrap();
    let output = medkgctl()
        .args(["ingest", "pubmed", "--export-telemetry", "otlp"])
        .env("LEDGER_PATH", dir.path().join("ledger.log"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("opentelemetry-otlp"), "{stderr}");
    assert!(stderr.contains("observability"), "{stderr}");
}

#[test]
fn usage_errors_from_clap_exit_2() {
    let output = medkgctl().args(["ingest"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}
