//! End-to-end tests of the vstore binary over filesystem tiers

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scratch tiers and a config that keeps the audit log out of the home directory
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[general]\naudit_log = false\n",
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn vstore(&self) -> Command {
        self.vstore_with_local(&self.path("local"))
    }

    fn vstore_with_local(&self, local: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("vstore");
        cmd.arg("--config")
            .arg(self.path("config.toml"))
            .arg("--local")
            .arg(local)
            .arg("--remote")
            .arg(self.path("remote"));
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn put(&self, name: &str, contents: &str) -> String {
        let file = self.write(name, contents);
        let output = self.vstore().arg("put").arg(file).assert().success();
        String::from_utf8(output.get_output().stdout.clone())
            .unwrap()
            .trim()
            .to_string()
    }
}

fn step_record(output: &str, metadata: &str, input: &str) -> String {
    serde_json::json!({
        "tool": "cc",
        "args": ["-c", "main.c"],
        "declared_inputs": ["main.c"],
        "inputs": { "main.c": input },
        "outputs": [output],
        "metadata": metadata,
        "determinism": "deterministic",
    })
    .to_string()
}

#[test]
fn help_displays() {
    cargo_bin_cmd!("vstore")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build-artifact cache"));
}

#[test]
fn version_displays() {
    cargo_bin_cmd!("vstore")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vstore"));
}

#[test]
fn put_then_get() {
    let ws = Workspace::new();
    let hash = ws.put("artifact.txt", "hello cache");
    assert_eq!(hash.len(), 64);

    ws.vstore()
        .args(["get", hash.as_str()])
        .assert()
        .success()
        .stdout("hello cache");
}

#[test]
fn get_writes_output_file() {
    let ws = Workspace::new();
    let hash = ws.put("artifact.txt", "to a file");
    let target = ws.path("restored.txt");

    ws.vstore()
        .args(["get", hash.as_str(), "-o"])
        .arg(&target)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(target).unwrap(), "to a file");
}

#[test]
fn get_missing_content_fails() {
    let ws = Workspace::new();
    let missing = "0".repeat(64);

    ws.vstore()
        .args(["get", missing.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Content not found"));
}

#[test]
fn get_rejects_malformed_hash() {
    let ws = Workspace::new();

    ws.vstore()
        .args(["get", "not-a-hash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid digest"));
}

#[test]
fn pin_reports_missing_content() {
    let ws = Workspace::new();
    let present = ws.put("artifact.txt", "present");
    let missing = "f".repeat(64);

    ws.vstore()
        .args(["pin", present.as_str()])
        .assert()
        .success();
    ws.vstore()
        .args(["pin", present.as_str(), missing.as_str()])
        .assert()
        .failure();
}

#[test]
fn publish_then_lookup() {
    let ws = Workspace::new();
    let output = ws.put("main.o", "object code");
    let metadata = ws.put("meta.json", "{}");
    let input = ws.put("main.c", "int main() {}");
    let record = ws.write("step.json", &step_record(&output, &metadata, &input));

    let published = ws
        .vstore()
        .args(["--policy", "local-only", "publish", "--format", "json"])
        .arg(&record)
        .assert()
        .success();
    let json: serde_json::Value =
        serde_json::from_slice(&published.get_output().stdout).unwrap();
    assert_eq!(json["newly_added"], true);
    let weak = json["fingerprint"]["weak"].as_str().unwrap().to_string();
    let strong = json["fingerprint"]["hash"].as_str().unwrap().to_string();

    ws.vstore()
        .args(["--policy", "local-only", "lookup", weak.as_str(), "--format", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains(strong));
}

#[test]
fn write_through_publish_is_visible_from_fresh_local_tier() {
    let ws = Workspace::new();
    let output = ws.put("main.o", "object code");
    let metadata = ws.put("meta.json", "{}");
    let input = ws.put("main.c", "int main() {}");
    let record = ws.write("step.json", &step_record(&output, &metadata, &input));

    let published = ws
        .vstore()
        .args(["--policy", "write-through", "publish", "--format", "json"])
        .arg(&record)
        .assert()
        .success();
    let json: serde_json::Value =
        serde_json::from_slice(&published.get_output().stdout).unwrap();
    let weak = json["fingerprint"]["weak"].as_str().unwrap().to_string();
    let strong = json["fingerprint"]["hash"].as_str().unwrap().to_string();

    let fresh = ws.path("fresh-local");
    ws.vstore_with_local(&fresh)
        .args(["lookup", weak.as_str(), "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(strong).and(predicate::str::contains("\"remote\"")));

    ws.vstore_with_local(&fresh)
        .args(["get", output.as_str()])
        .assert()
        .success()
        .stdout("object code");
}

#[test]
fn publish_rejects_malformed_record() {
    let ws = Workspace::new();
    let record = ws.write("step.json", "{ not json");

    ws.vstore()
        .arg("publish")
        .arg(record)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid step record"));
}

#[test]
fn lookup_miss() {
    let ws = Workspace::new();
    let weak = "a".repeat(64);

    ws.vstore()
        .args(["lookup", weak.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("No entries"));
}

#[test]
fn status_json_lists_both_tiers() {
    let ws = Workspace::new();

    ws.vstore()
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"local\"")
                .and(predicate::str::contains("\"remote\""))
                .and(predicate::str::contains("write-behind")),
        );
}

#[test]
fn status_table_runs() {
    let ws = Workspace::new();

    ws.vstore()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Policy:"));
}

#[test]
fn config_path() {
    let ws = Workspace::new();

    ws.vstore()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn config_show() {
    let ws = Workspace::new();

    ws.vstore()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("[general]").and(predicate::str::contains("[aggregator]")),
        );
}

#[test]
fn config_init_refuses_to_overwrite() {
    let ws = Workspace::new();

    ws.vstore()
        .args(["config", "init"])
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn conflicting_config_is_reported() {
    let ws = Workspace::new();
    ws.write(
        "config.toml",
        "[general]\naudit_log = false\n\n[aggregator]\nwrite_policy = \"write-through\"\nremote_read_enabled = false\n",
    );

    ws.vstore()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}
