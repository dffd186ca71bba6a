use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn wo_sync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("wo-sync");
    path
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    // Nothing listens on port 9; commands under test must fail before any request.
    let config_content = format!(
        r#"[elasticsearch]
source_url = "http://127.0.0.1:9"
sink_url = "http://127.0.0.1:9"

[sync]
log_dir = "{}/log"
{}"#,
        root.display(),
        extra
    );

    let config_path = root.join("wo-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_wo_sync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = wo_sync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("WO_SYNC_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run wo-sync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let (_tmp, config) = setup_test_env("");
    let (stdout, _, success) = run_wo_sync(&config, &["--help"]);
    assert!(success);
    for command in ["sync", "sync-all", "alerts", "subscription", "snippets"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) =
        run_wo_sync(&tmp.path().join("nope.toml"), &["sync", "ori_x", "GM0363"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config) = setup_test_env("chunk_size = 0\n");
    let (_, stderr, success) = run_wo_sync(&config, &["sync", "ori_x", "GM0363"]);
    assert!(!success);
    assert!(stderr.contains("chunk_size"));
}

#[test]
fn test_sync_rejects_bad_municipality_code() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_wo_sync(&config, &["sync", "ori_x", "GM363"]);
    assert!(!success);
    assert!(stderr.contains("GM0000"));
}

#[test]
fn test_sync_all_requires_municipalities() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_wo_sync(&config, &["sync-all", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("No [[municipalities]] configured"));
}

#[test]
fn test_resend_rejects_bad_date() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_wo_sync(&config, &["alerts", "resend", "2018-13-40"]);
    assert!(!success);
    assert!(stderr.contains("expected YYYY-MM-DD"));
}

#[test]
fn test_subscription_create_rejects_bad_query() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_wo_sync(
        &config,
        &[
            "subscription",
            "create",
            "--email",
            "a@example.org",
            "--code",
            "GM0363",
            "--query",
            "{not json",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("--query is not valid JSON"));
}
