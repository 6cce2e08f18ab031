use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn msgdex_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_msgdex"))
}

const FEED: &str = r#"{"id": "msg_1", "user_id": "u1", "user_name": "Layla Kawaguchi", "timestamp": "2024-05-01T09:00:00", "message": "Please book a private jet to Paris for Friday"}
{"id": "msg_2", "user_id": "u2", "user_name": "Vikram Desai", "timestamp": "2024-05-02T10:30:00", "message": "Need a luxury car rental in Paris"}
{"id": "msg_3", "user_id": "u1", "user_name": "Layla Kawaguchi", "timestamp": "2024-05-03T12:00:00", "message": "Dinner reservation for four at eight"}
{"id": "msg_4", "user_id": "u3"}
"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(root.join("feed.jsonl"), FEED).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/msgdex.sqlite"

[query]
default_limit = 10
max_limit = 50

[source]
kind = "jsonl"
path = "{root}/feed.jsonl"
page_size = 2

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("msgdex.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_msgdex(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = msgdex_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run msgdex binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_msgdex(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_msgdex(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_failed_records() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_msgdex(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("fetched:    4"), "got: {}", stdout);
    assert!(stdout.contains("inserted:   3"));
    assert!(stdout.contains("failed:     1"));
}

#[test]
fn test_second_ingest_only_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_msgdex(&config_path, &["ingest"]);
    let (stdout, _, success) = run_msgdex(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("inserted:   0"), "got: {}", stdout);
    assert!(stdout.contains("updated:    0"));
    assert!(stdout.contains("duplicates: 3"));
}

#[test]
fn test_search_ranks_and_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["ingest"]);

    let (stdout1, _, success) = run_msgdex(&config_path, &["search", "car rental Paris"]);
    assert!(success);
    let first_id = stdout1
        .lines()
        .find(|l| l.trim().starts_with("id:"))
        .map(|l| l.trim().trim_start_matches("id:").trim().to_string());
    assert_eq!(first_id.as_deref(), Some("msg_2"), "got: {}", stdout1);
    assert!(stdout1.contains("of 2 results"));

    let (stdout2, _, _) = run_msgdex(&config_path, &["search", "car rental Paris"]);
    assert_eq!(stdout1, stdout2, "Search output should be deterministic");
}

#[test]
fn test_search_rejects_limit_over_max() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["init"]);

    let (_, stderr, success) = run_msgdex(&config_path, &["search", "paris", "--limit", "51"]);
    assert!(!success);
    assert!(stderr.contains("limit must be between 1 and 50"), "got: {}", stderr);
}

#[test]
fn test_search_empty_query_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["init"]);

    let (_, stderr, success) = run_msgdex(&config_path, &["search", "  "]);
    assert!(!success);
    assert!(stderr.contains("invalid query"));
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["ingest"]);

    let (stdout, _, success) = run_msgdex(&config_path, &["search", "xyznonexistent"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_get_record_and_missing() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["ingest"]);

    let (stdout, _, success) = run_msgdex(&config_path, &["get", "msg_1"]);
    assert!(success);
    assert!(stdout.contains("Layla Kawaguchi"));
    assert!(stdout.contains("2024-05-01T09:00:00.000Z"));
    assert!(stdout.contains("jet"));

    let (_, stderr, success) = run_msgdex(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with missing ID should fail");
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_stats_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["ingest"]);

    let (stdout, _, success) = run_msgdex(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Records:      3"), "got: {}", stdout);
    assert!(stdout.contains("paris"));
}

#[test]
fn test_analyzer_change_requires_reindex() {
    let (_tmp, config_path) = setup_test_env();
    run_msgdex(&config_path, &["ingest"]);

    let content = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, format!("{}\n[index]\nmin_token_len = 4\n", content)).unwrap();

    let (_, stderr, success) = run_msgdex(&config_path, &["search", "jet"]);
    assert!(!success);
    assert!(stderr.contains("reindex"), "got: {}", stderr);

    let (stdout, _, success) = run_msgdex(&config_path, &["reindex"]);
    assert!(success);
    assert!(stdout.contains("Reindexed 3 records"));

    let (stdout, _, success) = run_msgdex(&config_path, &["search", "jet"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_unknown_source_kind() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_msgdex(&config_path, &["ingest", "--kind", "ftp"]);
    assert!(!success);
    assert!(stderr.contains("Unknown source kind"));
}
