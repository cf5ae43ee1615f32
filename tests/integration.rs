use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let listings_dir = root.join("listings");
    fs::create_dir_all(&listings_dir).unwrap();

    // Literal public addresses keep validation off the network.
    fs::write(
        listings_dir.join("zillow.json"),
        r#"{
  "123 Main St": [
    "https://93.184.216.34/photos/front.jpg",
    "https://93.184.216.34/photos/kitchen.jpg",
    "http://169.254.169.254/latest/meta-data"
  ],
  "9 Elm Ave": {
    "urls": ["https://93.184.216.34/photos/elm.jpg"],
    "fields": { "beds": 3 }
  }
}"#,
    )
    .unwrap();
    fs::write(
        root.join("properties.json"),
        r#"["123 Main St", {"address": "9 Elm Ave"}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[storage]
root = "{root}/images"
backup_retention = 3

[safety]
mode = "permissive"
allowed_hosts = []

[orchestrator]
max_retries = 0

[properties]
path = "{root}/properties.json"

[[sources]]
name = "zillow"
kind = "manifest"
manifest = "{root}/listings/zillow.json"

[[sources]]
name = "redfin"
kind = "manifest"
manifest = "{root}/listings/redfin.json"
enabled = false
"#,
        root = root.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_sources() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["sources"]);
    assert!(success, "sources failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("zillow"));
    assert!(stdout.contains("redfin"));
    assert!(stdout.contains("(missing)"));
    assert!(stdout.contains("Permissive"));
}

#[test]
fn test_check_url_denies_metadata_endpoint() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_harvest(
        &config_path,
        &["check-url", "http://169.254.169.254/latest/meta-data"],
    );
    assert!(!success);
    assert!(stdout.contains("denied"));
}

#[test]
fn test_check_url_allows_public_address() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_harvest(&config_path, &["check-url", "https://93.184.216.34/a.jpg"]);
    assert!(success, "check-url failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("allowed"));
}

#[test]
fn test_check_url_denies_other_schemes() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_harvest(&config_path, &["check-url", "file:///etc/passwd"]);
    assert!(!success);
    assert!(stdout.contains("not allowed"));
}

#[test]
fn test_extract_dry_run() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(
        &config_path,
        &["extract", "--address", "123 Main St", "--dry-run"],
    );
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("extract (dry-run)"));
    assert!(stdout.contains("completed: 1"));
    assert!(stdout.contains("https://93.184.216.34/photos/front.jpg"));
    assert!(stdout.contains("urls rejected: 1"));
    assert!(stdout.trim_end().ends_with("ok"));

    // Nothing is persisted by a dry run.
    let metadata = tmp.path().join("images/metadata");
    assert!(!metadata.join("extraction_state.json").exists());
    assert!(!metadata.join("run_history.json").exists());
}

#[test]
fn test_extract_all_dry_run_reads_properties_file() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_harvest(&config_path, &["extract", "--all", "--dry-run"]);
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed: 2"));
    assert!(stdout.contains("9 Elm Ave: 1 urls"));
}

#[test]
fn test_extract_unknown_address_is_skipped() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(
        &config_path,
        &["extract", "--address", "1 Nowhere Rd", "--dry-run"],
    );
    assert!(success, "extract failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("skipped: 1"));
    assert!(stdout.contains("no eligible sources"));
}

#[test]
fn test_extract_requires_selection() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harvest(&config_path, &["extract"]);
    assert!(!success);
    assert!(stderr.contains("--address"));
}

#[test]
fn test_extract_rejects_unknown_source() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harvest(
        &config_path,
        &["extract", "--address", "123 Main St", "--source", "craigslist"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown source"));
}

#[test]
fn test_state_show_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["state", "show"]);
    assert!(success, "state show failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed: 0"));
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.contains("backups: 0"));
}

#[test]
fn test_state_backup_without_state() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_harvest(&config_path, &["state", "backup"]);
    assert!(success);
    assert!(stdout.contains("no state file"));
}

#[test]
fn test_state_restore_without_backups_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_harvest(&config_path, &["state", "restore"]);
    assert!(!success);
}

#[test]
fn test_state_history_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_harvest(&config_path, &["state", "history"]);
    assert!(success);
    assert!(stdout.contains("no runs recorded"));
}

#[test]
fn test_index_stats_and_clear() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["index", "stats"]);
    assert!(success, "index stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("hashes: 0"));

    let (_, stderr, success) = run_harvest(&config_path, &["index", "clear"]);
    assert!(!success);
    assert!(stderr.contains("--yes"));

    let (stdout, _, success) = run_harvest(&config_path, &["index", "clear", "--yes"]);
    assert!(success);
    assert!(stdout.contains("0 entries removed"));
}

#[test]
fn test_stats_empty() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["stats"]);
    assert!(success, "stats failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Images:      0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_harvest(&tmp.path().join("nope.toml"), &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
