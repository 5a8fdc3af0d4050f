use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;
use tempfile::TempDir;

use workflow_deps::cache::{CacheLayer, Fetched};

// Port 9 refuses connections, so every network fetch fails fast.
const DEAD_LIST_URL: &str = "http://127.0.0.1:9/list";
const DEAD_CHANNEL_URL: &str = "http://127.0.0.1:9/ch";

fn wfdeps_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("wfdeps");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_content = format!(
        r#"[cache]
root = "{root}/cache"
ttl_hours = 0

[channels]
list_url = "{list}"

[download]
models_root = "{root}/models"

[finder]
enabled = false
"#,
        root = root.display(),
        list = DEAD_LIST_URL,
    );
    let config_path = root.join("wfdeps.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(wfdeps_binary())
        .arg("--config")
        .arg(config)
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run wfdeps")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

async fn seed_channel_cache(root: &Path) {
    let cache = CacheLayer::new(root.join("cache"), Duration::from_secs(3600));
    let ttl = cache.default_ttl();
    cache
        .get_or_fetch(DEAD_LIST_URL, &[], None, ttl, || async {
            Ok::<_, anyhow::Error>(Fetched::new(
                format!("default::{}\n", DEAD_CHANNEL_URL),
                Some("text/plain".to_string()),
            ))
        })
        .await
        .unwrap();

    let manifest_url = format!("{}/extension-node-map.json", DEAD_CHANNEL_URL);
    let manifest = serde_json::json!({
        "https://github.com/org/seed-pack": [["Seed (pack)", "Noise (pack)"], {}]
    });
    cache
        .get_or_fetch(&manifest_url, &[], None, ttl, || async move {
            Ok::<_, anyhow::Error>(Fetched::new(
                manifest.to_string(),
                Some("application/json".to_string()),
            ))
        })
        .await
        .unwrap();
}

#[test]
fn test_extract_lists_types_and_models() {
    let (tmp, config) = setup_test_env();
    let workflow = tmp.path().join("workflow.json");
    fs::write(
        &workflow,
        r#"{"nodes": [
            {"id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["sd_xl_base.safetensors"]},
            {"id": 2, "type": "KSampler", "widgets_values": [42, "euler"]}
        ]}"#,
    )
    .unwrap();

    let output = run(&config, &["extract", workflow.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(
        json["node_types"],
        serde_json::json!(["CheckpointLoaderSimple", "KSampler"])
    );
    assert_eq!(
        json["models"]["sd_xl_base.safetensors"],
        serde_json::json!(["CheckpointLoaderSimple"])
    );
}

#[test]
fn test_cache_path_is_deterministic() {
    let (tmp, config) = setup_test_env();
    let args = [
        "cache-path",
        "https://example.com/list",
        "--param",
        "page=2",
        "--ext",
        "json",
    ];

    let first = stdout(&run(&config, &args));
    let second = stdout(&run(&config, &args));
    assert_eq!(first, second);
    assert!(first.trim().ends_with(".json"));
    assert!(Path::new(first.trim()).starts_with(tmp.path().join("cache")));

    let other = stdout(&run(
        &config,
        &["cache-path", "https://example.com/list", "--param", "page=3", "--ext", "json"],
    ));
    assert_ne!(first, other);
}

#[test]
fn test_cache_path_rejects_bad_param() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["cache-path", "k", "--param", "no-equals"]);
    assert!(!output.status.success());
}

#[test]
fn test_infer_reports_folders() {
    let (tmp, config) = setup_test_env();
    let plugin = tmp.path().join("plugin");
    fs::create_dir_all(&plugin).unwrap();
    fs::write(
        plugin.join("loaders.py"),
        r#"
import folder_paths

class UpscaleLoader:
    @classmethod
    def INPUT_TYPES(cls):
        return {"required": {"name": (folder_paths.get_filename_list("upscale_models"),)}}
"#,
    )
    .unwrap();

    let output = run(&config, &["infer", plugin.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(
        json["folders"]["UpscaleLoader"],
        serde_json::json!(["upscale_models"])
    );
}

#[test]
fn test_channels_fail_without_cache() {
    let (_tmp, config) = setup_test_env();
    let output = run(&config, &["channels"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no cached copy"));
}

#[tokio::test]
async fn test_lookup_uses_stale_cache() {
    let (tmp, config) = setup_test_env();
    seed_channel_cache(tmp.path()).await;

    let output = run(&config, &["lookup", "Seed (pack)"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout(&output).trim(), "https://github.com/org/seed-pack");

    let output = run(&config, &["lookup", "Nobody Provides This"]);
    assert_eq!(stdout(&output).trim(), "unresolved");
}

#[tokio::test]
async fn test_resolve_writes_report() {
    let (tmp, config) = setup_test_env();
    seed_channel_cache(tmp.path()).await;

    let workflow = tmp.path().join("workflow.json");
    fs::write(
        &workflow,
        r#"{"nodes": [{"id": 1, "type": "Unknown Node"}]}"#,
    )
    .unwrap();
    let report_path = tmp.path().join("report.json");

    let output = run(
        &config,
        &[
            "resolve",
            workflow.to_str().unwrap(),
            "--output",
            report_path.to_str().unwrap(),
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["unresolved"], serde_json::json!(["Unknown Node"]));
    assert_eq!(report["channels_stale"], serde_json::json!(true));
}
