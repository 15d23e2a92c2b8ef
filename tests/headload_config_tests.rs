//! Integration tests for headload config: file, env overrides, CLI flags, and precedence.

use std::process::Command;

use tempfile::TempDir;

/// Run headload in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_headload(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_headload");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run headload");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

#[test]
fn validate_config_no_config_uses_defaults() {
    let (ok, stdout, stderr) = run_headload(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("stripe_size=16384"), "stdout: {}", stdout);
    assert!(stdout.contains("chunk_range_ms=7200000"), "stdout: {}", stdout);
    assert!(stdout.contains("samples_per_chunk=120"), "stdout: {}", stdout);
    assert!(stdout.contains("gc_interval_secs=none"), "stdout: {}", stdout);
    assert!(stdout.contains("wal_dir=none"), "stdout: {}", stdout);
}

#[test]
fn file_then_env_then_cli() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("headload.toml");
    std::fs::write(
        &path,
        "stripe_size = 64\nsamples_per_chunk = 30\nseries = 7\nbatch_size = 100\n",
    )
    .expect("write config");
    let path = path.to_string_lossy().into_owned();

    let (ok, stdout, stderr) = run_headload(&["--validate-config", "--config", &path], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("stripe_size=64"), "stdout: {}", stdout);
    assert!(stdout.contains("samples_per_chunk=30"), "stdout: {}", stdout);
    assert!(stdout.contains("series=7"), "stdout: {}", stdout);

    let (ok, stdout, _) = run_headload(
        &["--validate-config", "--config", &path],
        &[("TSHEAD_SERIES", "9"), ("TSHEAD_STRIPE_SIZE", "128")],
    );
    assert!(ok);
    assert!(stdout.contains("series=9"), "env should beat file: {}", stdout);
    assert!(stdout.contains("stripe_size=128"), "env should beat file: {}", stdout);
    assert!(stdout.contains("batch_size=100"), "file value kept: {}", stdout);

    let (ok, stdout, _) = run_headload(
        &["--validate-config", "--config", &path, "--stripe-size", "256"],
        &[("TSHEAD_STRIPE_SIZE", "128")],
    );
    assert!(ok);
    assert!(stdout.contains("stripe_size=256"), "CLI should win: {}", stdout);
}

#[test]
fn invalid_stripe_size_fails_validation() {
    let (ok, _, stderr) = run_headload(
        &["--validate-config", "--no-config", "--stripe-size", "100"],
        &[],
    );
    assert!(!ok);
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
    assert!(stderr.contains("power of two"), "stderr: {}", stderr);
}

#[test]
fn missing_config_file_is_an_error() {
    let (ok, _, stderr) = run_headload(
        &["--validate-config", "--config", "/definitely/not/here.toml"],
        &[],
    );
    assert!(!ok);
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

#[test]
fn small_workloads_run() {
    let dir = TempDir::new().expect("tempdir");
    let wal = dir.path().join("wal");
    let wal = wal.to_string_lossy().into_owned();
    for workload in ["series-create", "series-create-parallel", "appender-commit"] {
        let (ok, stdout, stderr) = run_headload(
            &[
                "--no-config",
                "--workload",
                workload,
                "--series",
                "200",
                "--batches",
                "2",
                "--batch-size",
                "50",
                "--stripe-size",
                "16",
                "--wal-dir",
                &wal,
            ],
            &[],
        );
        assert!(ok, "{} failed: {}", workload, stderr);
        assert!(stdout.contains("ops="), "stdout: {}", stdout);
    }
}
