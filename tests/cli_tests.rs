//! Integration tests for the relink binary
//!
//! Runs the built binary against temporary configuration files.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

const RELINK_BINARY: &str = env!("CARGO_BIN_EXE_relink");

fn relink(config_dir: &TempDir, args: &[&str]) -> std::process::Output {
    Command::new(RELINK_BINARY)
        .args(args)
        .env("RELINK_CONFIG_DIR", config_dir.path())
        .env("RELINK_LOG", "error")
        .env_remove("JOURNAL_STREAM")
        .output()
        .expect("Failed to run relink")
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    let output = relink(&dir, &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check-config"));
    assert!(stdout.contains("probe"));
}

#[test]
fn test_check_config_without_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let output = relink(&dir, &["check-config"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"));
    assert!(stdout.contains("defaults"));
    assert!(stdout.contains("tun0"));
}

#[test]
fn test_check_config_reads_explicit_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    fs::write(
        &path,
        "[tunnel]\ninterface = \"wg0\"\nreconnect_command = \"wg-quick up wg0\"\n",
    )
    .unwrap();

    let output = relink(&dir, &["check-config", "--config", path.to_str().unwrap()]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("wg0"));
    assert!(stdout.contains("wg-quick up wg0"));
}

#[test]
fn test_invalid_config_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("config.toml"),
        "[backoff]\nbase = 0.0\n",
    )
    .unwrap();

    let output = relink(&dir, &["check-config"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("base must be between 1 and 10"));
}

#[test]
fn test_missing_explicit_config_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.toml");

    let output = relink(&dir, &["run", "--config", path.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(2));
}
