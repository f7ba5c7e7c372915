//! CLI argument parsing and offline command tests
//!
//! Every command runs against a scratch config directory and execution
//! store, so nothing here needs a browser.

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use replaybook::models::{Execution, ExecutionStatus};
use replaybook::suite::{ExecutionStore, JsonStore};

struct Sandbox {
    config: TempDir,
    store: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            config: TempDir::new().unwrap(),
            store: TempDir::new().unwrap(),
        }
    }

    /// Get the replaybook binary command, isolated from the user's setup
    fn replaybook(&self) -> Command {
        let mut cmd = Command::cargo_bin("replaybook").unwrap();
        cmd.env("XDG_CONFIG_HOME", self.config.path())
            .env("REPLAYBOOK_SUITE__STORE_DIR", self.store.path())
            .env_remove("REPLAYBOOK_BROWSER_PATH")
            .env_remove("REPLAYBOOK_HEADLESS")
            .env("NO_COLOR", "1");
        cmd
    }

    fn seed(&self, records: Vec<Execution>) -> Vec<Execution> {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = JsonStore::open(self.store.path()).await.unwrap();
            let mut created = Vec::new();
            for record in records {
                created.push(store.create(record).await.unwrap());
            }
            created
        })
    }
}

mod help {
    use super::*;

    #[test]
    fn shows_help() {
        Sandbox::new()
            .replaybook()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("replaybook"))
            .stdout(predicate::str::contains("record"))
            .stdout(predicate::str::contains("suite"));
    }

    #[test]
    fn shows_version() {
        Sandbox::new()
            .replaybook()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("replaybook"));
    }
}

mod devices_command {
    use super::*;

    #[test]
    fn lists_presets() {
        Sandbox::new()
            .replaybook()
            .arg("devices")
            .assert()
            .success()
            .stdout(predicate::str::contains("iPhone 12 Pro"));
    }

    #[test]
    fn json_output_is_an_array() {
        let output = Sandbox::new()
            .replaybook()
            .args(["--json", "devices"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert!(parsed.as_array().map(|a| !a.is_empty()).unwrap_or(false));
    }
}

mod run_command {
    use super::*;

    #[test]
    fn requires_case() {
        Sandbox::new()
            .replaybook()
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("CASE"));
    }

    #[test]
    fn missing_case_file_fails() {
        let sandbox = Sandbox::new();
        let missing = sandbox.store.path().join("nope.json");
        sandbox
            .replaybook()
            .arg("run")
            .arg(&missing)
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.json"));
    }

    #[test]
    fn unknown_device_is_rejected_before_launch() {
        let sandbox = Sandbox::new();
        let case = sandbox.config.path().join("case.json");
        std::fs::write(
            &case,
            r#"{"id": 7, "name": "login", "environment_base_url": "https://x.test", "steps": []}"#,
        )
        .unwrap();

        sandbox
            .replaybook()
            .arg("run")
            .arg(&case)
            .args(["--device", "Nokia 3310"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown device"));
    }
}

mod suite_command {
    use super::*;

    #[test]
    fn parent_requires_resume_failed() {
        Sandbox::new()
            .replaybook()
            .args(["suite", "run", "suite.json", "--parent", "3"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--resume-failed"));
    }

    #[test]
    fn stop_cancels_a_running_suite_record() {
        let sandbox = Sandbox::new();

        let mut suite = Execution::for_suite(9, 2);
        suite.mark_running();
        let suite = sandbox.seed(vec![suite]).remove(0);

        let mut child = Execution::for_suite_case(1, 9, suite.id);
        child.mark_running();
        let queued = Execution::for_suite_case(2, 9, suite.id);
        sandbox.seed(vec![child, queued]);

        sandbox
            .replaybook()
            .args(["suite", "stop", &suite.id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("stopped"))
            .stdout(predicate::str::contains("2 cases cancelled"));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let stored = runtime.block_on(async {
            let store = JsonStore::open(sandbox.store.path()).await.unwrap();
            store.get(suite.id).await.unwrap()
        });
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn stop_unknown_execution_fails() {
        Sandbox::new()
            .replaybook()
            .args(["suite", "stop", "404"])
            .assert()
            .failure();
    }
}

mod executions_command {
    use super::*;

    #[test]
    fn empty_store_lists_nothing() {
        Sandbox::new()
            .replaybook()
            .args(["executions", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No executions found"));
    }

    #[test]
    fn show_missing_record_fails() {
        Sandbox::new()
            .replaybook()
            .args(["executions", "show", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ExecutionNotFound"));
    }

    #[test]
    fn list_and_show_seeded_records() {
        let sandbox = Sandbox::new();
        let mut passed = Execution::for_case(11);
        passed.finish(ExecutionStatus::Passed, "");
        let created = sandbox.seed(vec![passed, Execution::for_case(12)]);

        let output = sandbox
            .replaybook()
            .args(["--json", "executions", "list", "--limit", "1"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let listed: Vec<Execution> = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created[1].id);

        sandbox
            .replaybook()
            .args(["executions", "show", &created[0].id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Case:     11"))
            .stdout(predicate::str::contains("passed"));
    }
}
