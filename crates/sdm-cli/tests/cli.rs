//! Integration tests for the `sdm` binary

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn test_help_lists_commands() {
    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("tree"));
}

#[test]
fn test_run_integer_admm_converges() {
    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.args(["run", "integer", "--rho", "50", "--kmax", "20", "--warm-start"])
        .assert()
        .success()
        .stdout(predicate::str::contains("converged"))
        .stdout(predicate::str::contains("admm"))
        .stdout(predicate::str::contains("solution residual"));
}

#[test]
fn test_run_integer_json_report() {
    let mut cmd = cargo_bin_cmd!("sdm");
    let output = cmd
        .args(["--log-level", "warn", "run", "integer", "--mode", "bundle", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["mode"], "bundle");
    assert_eq!(report["status"], "converged");
    let bound = report["bound"].as_f64().unwrap();
    assert!((bound + 10.0 / 3.0).abs() < 1e-4);
}

#[test]
fn test_run_kmax_zero_is_not_a_failure() {
    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.args(["run", "integer", "--kmax", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("iteration limit reached"));
}

#[test]
fn test_run_writes_csv_trace() {
    let dir = tempdir().unwrap();
    let trace = dir.path().join("out").join("trace.csv");
    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.args(["run", "inventory", "--rho", "1", "--kmax", "5", "--trace-out"])
        .arg(&trace)
        .assert()
        .success();

    let text = fs::read_to_string(&trace).unwrap();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("iteration,elapsed_ms,objective"));
    assert!(lines.count() >= 1);
}

#[test]
fn test_run_rejects_bad_rho() {
    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.args(["run", "integer", "--rho=-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rho"));
}

#[test]
fn test_run_with_tree_file_and_params() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.yaml");
    fs::write(
        &tree,
        r#"
nodes:
  - id: root
  - id: cheap
    parent: root
    data: { c: 0.5 }
  - id: dear
    parent: root
    data: { c: 2.0 }
"#,
    )
    .unwrap();

    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.args(["run", "integer", "--param", "upper=3", "--tree"])
        .arg(&tree)
        .assert()
        .success()
        .stdout(predicate::str::contains("converged"))
        .stdout(predicate::str::contains("cheap"));
}

#[test]
fn test_tree_command_lists_nodes_and_writes_manifest() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.json");
    fs::write(
        &tree,
        r#"{"nodes": [
            {"id": "root"},
            {"id": "wet", "parent": "root", "probability": 0.25, "data": {"rain": 30.0}},
            {"id": "dry", "parent": "root", "probability": 0.75, "data": {"rain": 5.0}}
        ]}"#,
    )
    .unwrap();
    let manifest = dir.path().join("manifest.json");

    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.arg("tree")
        .arg(&tree)
        .arg("--out")
        .arg(&manifest)
        .assert()
        .success()
        .stdout(predicate::str::contains("wet"))
        .stdout(predicate::str::contains("3 nodes, 2 stages, 2 scenarios"));

    let text = fs::read_to_string(&manifest).unwrap();
    assert!(text.contains("\"path_probability\": 0.75"));
}

#[test]
fn test_tree_command_rejects_bad_probabilities() {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree.yaml");
    fs::write(
        &tree,
        "nodes:\n  - id: r\n  - id: a\n    parent: r\n    probability: 0.9\n",
    )
    .unwrap();

    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.arg("tree")
        .arg(&tree)
        .assert()
        .failure()
        .stderr(predicate::str::contains("probability"));
}

#[test]
fn test_config_command_fills_defaults() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("coordinator.yaml");
    fs::write(&config, "mode: lagrange_bundle\nkmax: 7\n").unwrap();

    let mut cmd = cargo_bin_cmd!("sdm");
    cmd.arg("config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"bundle\""))
        .stdout(predicate::str::contains("\"kmax\": 7"))
        .stdout(predicate::str::contains("\"proximal_weight\": 1.0"));
}
