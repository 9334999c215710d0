use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ksync.sqlite"

[chunking]
size = 200

[queue]
backoff_ms = 0

[server]
bind = "127.0.0.1:0"
"#,
        root.display()
    );
    let config_path = root.join("config/ksync.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_ksync(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ksync"))
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run ksync")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config) = setup_test_env();
    for _ in 0..2 {
        let out = run_ksync(&config, &["init"]);
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    }
    assert!(tmp.path().join("data/ksync.sqlite").exists());
}

#[test]
fn test_group_add_and_list() {
    let (_tmp, config) = setup_test_env();
    run_ksync(&config, &["init"]);

    let out = run_ksync(
        &config,
        &[
            "group",
            "add",
            "--type",
            "github-issues",
            "--title",
            "Widgets",
            "--url",
            "https://github.com/acme/widgets",
            "--github-states",
            "closed",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let id = stdout(&out).trim().to_string();
    assert!(!id.is_empty());

    let list = stdout(&run_ksync(&config, &["group", "list"]));
    assert!(list.contains(&id));
    assert!(list.contains("github_issues"));
    assert!(list.contains("Widgets"));
}

#[test]
fn test_sync_of_placeholder_type_ends_in_error() {
    let (_tmp, config) = setup_test_env();
    run_ksync(&config, &["init"]);
    let out = run_ksync(
        &config,
        &["group", "add", "--type", "notion", "--title", "Wiki"],
    );
    let id = stdout(&out).trim().to_string();

    let out = run_ksync(&config, &["sync", &id]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&out).contains("is error"));
}

#[test]
fn test_stop_unknown_group_fails() {
    let (_tmp, config) = setup_test_env();
    run_ksync(&config, &["init"]);
    let out = run_ksync(&config, &["stop", "missing"]);
    assert!(!out.status.success());
}

#[test]
fn test_group_types_lists_every_source() {
    let out = run_ksync(Path::new("/nonexistent.toml"), &["group", "types"]);
    assert!(out.status.success());
    let text = stdout(&out);
    for t in ["web", "github_issues", "linear", "confluence", "youtube_videos", "upload"] {
        assert!(text.contains(t), "missing {}", t);
    }
}

#[test]
fn test_chunk_command_respects_size() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("doc.md");
    let body = "# Guide\n\n".to_string() + &"word ".repeat(100).trim_end().replace(' ', "\n");
    fs::write(&file, body).unwrap();

    let out = run_ksync(
        Path::new("/nonexistent.toml"),
        &["chunk", file.to_str().unwrap(), "--size", "60"],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.matches("--- chunk").count() > 1);
    assert!(text.contains("# Guide"));
}

#[test]
fn test_status_reports_queue_counts() {
    let (_tmp, config) = setup_test_env();
    run_ksync(&config, &["init"]);
    let out = run_ksync(&config, &["status"]);
    assert!(out.status.success());
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["group"]["waiting"], 0);
    assert_eq!(status["item"]["failed"], 0);
}
