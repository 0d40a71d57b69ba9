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

    let config_content = format!(
        r#"[db]
path = "{root}/data/harvester.sqlite"

[search]
backend = "memory"

[blobs]
path = "{root}/blobs"

[resources.http]
type = "http"

[sources.edurep]
extractor = "oai_pmh"

[sources.edurep.entities.products]
set_specification = "edurep_delen"
delete_policy = "transient"

[[sources.edurep.entities.products.phases]]
phase = "records"
strategy = "initial"
retrieve_data = {{ resource = "http", url = "https://oai.example.org/oai", params = {{ verb = "ListRecords", set = "{{set_specification}}" }}, pagination = {{ type = "resumption_token" }} }}

[sources.archive]
extractor = "json_api"
is_available = false

[sources.archive.entities.products]
set_specification = "all"

[[sources.archive.entities.products.phases]]
phase = "records"
strategy = "initial"
retrieve_data = {{ resource = "http", url = "https://archive.example.org/api/products" }}

[entities.products]
identifier = "external_id"

[datasets.edusources]
indexing = "index_and_promote"
harvest = [{{ source = "edurep", entity = "products" }}]
"#,
        root = root.display(),
    );

    let config_path = config_dir.join("harvester.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("1 datasets"));
    assert!(tmp.path().join("data/harvester.sqlite").exists());
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "first init failed: {}", stderr);
    let (_, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_sources_lists_entities() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("edurep"));
    assert!(stdout.contains("edurep_delen"));
    assert!(stdout.contains("transient"));

    let archive = stdout
        .lines()
        .find(|l| l.starts_with("archive"))
        .expect("archive source listed");
    assert!(archive.contains("NO"));
}

#[test]
fn test_status_after_init() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["status", "edusources"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("edusources"));
    assert!(stdout.contains("index_and_promote"));
    assert!(stdout.contains("Versions:    0"));
}

#[test]
fn test_status_json() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_harvest(&config_path, &["status", "edusources", "--json"]);
    assert!(success, "status --json failed: {}", stderr);
    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["dataset"], "edusources");
    assert_eq!(status["versions"], serde_json::json!([]));
}

#[test]
fn test_unknown_dataset_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["status", "nope"]);
    assert!(!success);
    assert!(stderr.contains("nope"));

    let (_, stderr, success) = run_harvest(&config_path, &["run", "nope"]);
    assert!(!success);
    assert!(stderr.contains("nope"));
}

#[test]
fn test_dispatch_without_versions_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["dispatch", "edusources"]);
    assert!(!success);
    assert!(stderr.contains("no unfinished version"));
}

#[test]
fn test_resources_purge_on_empty_cache() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(
        &config_path,
        &["resources", "purge", "--older-than-days", "30"],
    );
    assert!(success, "purge failed: {}", stderr);
    assert!(stdout.contains("Purged 0 resources"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_harvest(&tmp.path().join("missing.toml"), &["init"]);
    assert!(!success);
    assert!(!stderr.is_empty());
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, success) = run_harvest(
        &tmp.path().join("missing.toml"),
        &["completions", "bash"],
    );
    assert!(success);
    assert!(stdout.contains("harvest"));
}
