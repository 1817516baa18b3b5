//! End-to-end tests for the `foreman` binary.
//!
//! Each test builds a throwaway git repository with a `foreman.toml` and
//! drives the CLI against it with `sh -c` workers.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

/// Repository with one commit and a committer identity.
fn create_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Foreman Test").unwrap();
        config.set_str("user.email", "foreman@example.com").unwrap();
    }
    fs::write(dir.path().join("README.md"), "# fixture\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Foreman Test", "foreman@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[])
        .unwrap();
    dir
}

fn project(config: &str) -> TempDir {
    let dir = create_repo();
    fs::write(dir.path().join("foreman.toml"), config).unwrap();
    dir
}

/// `foreman` in `dir` with fast supervisor timing.
fn foreman_in(dir: &TempDir) -> Command {
    let mut cmd = foreman();
    cmd.current_dir(dir.path())
        .env("FOREMAN_POLL_INTERVAL", "0.05")
        .env("FOREMAN_STATUS_INTERVAL", "0")
        .env("FOREMAN_OFFLINE", "1")
        .env_remove("FOREMAN_CONFIG")
        .env_remove("FOREMAN_RESUME");
    cmd
}

fn ledger_lines(dir: &TempDir) -> Vec<serde_json::Value> {
    let content = fs::read_to_string(dir.path().join(".foreman/ledger.jsonl")).unwrap_or_default();
    content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const TWO_TASKS: &str = r#"
[[tasks]]
name = "core"
command = "echo core > core.txt"
outputs = { core_notes = "core.txt" }

[[tasks]]
name = "docs"
command = "cat \"$FOREMAN_ARTIFACT_CORE_NOTES\""
depends_on = ["core"]
requires = ["core_notes"]
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        foreman().arg("--help").assert().success();
    }

    #[test]
    fn test_foreman_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let dir = create_repo();
        foreman_in(&dir)
            .arg("run")
            .assert()
            .code(78)
            .stderr(predicate::str::contains("Config file not found"));
    }

    #[test]
    fn test_invalid_task_graph_is_config_error() {
        let dir = project(
            "[[tasks]]\nname = \"a\"\ncommand = \"true\"\ndepends_on = [\"b\"]\n\n[[tasks]]\nname = \"b\"\ncommand = \"true\"\ndepends_on = [\"a\"]\n",
        );
        foreman_in(&dir)
            .arg("run")
            .assert()
            .code(78)
            .stderr(predicate::str::contains("cycle"));
        assert!(ledger_lines(&dir).is_empty());
    }

    #[test]
    fn test_status_without_runs() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Lock: free"))
            .stdout(predicate::str::contains("No runs recorded"));
    }
}

// =============================================================================
// Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_successful_run_records_ledger_and_report() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir)
            .args(["run", "--phase", "main"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Run completed"));

        let events = ledger_lines(&dir);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["task"], "core");
        assert_eq!(events[0]["state"], "started");
        assert_eq!(events[1]["state"], "completed");
        assert_eq!(events[3]["task"], "docs");
        assert_eq!(events[3]["state"], "completed");

        let reports: Vec<_> = fs::read_dir(dir.path().join(".foreman/runs"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(!dir.path().join(".foreman/run.lock").exists());

        // The worker's output lands in its log, not on our stdout.
        let run_id = events[0]["run_id"].as_str().unwrap();
        let log = dir
            .path()
            .join(format!(".foreman/logs/{}/main-docs-1.log", run_id));
        assert!(fs::read_to_string(log).unwrap().contains("core"));
    }

    #[test]
    fn test_worker_failure_exits_one_and_names_log() {
        let dir = project(
            "[[tasks]]\nname = \"broken\"\ncommand = \"echo boom; exit 4\"\n\n[[tasks]]\nname = \"after\"\ncommand = \"true\"\ndepends_on = [\"broken\"]\n",
        );
        foreman_in(&dir)
            .args(["run", "--phase", "main"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Run failed"))
            .stdout(predicate::str::contains("main-broken-1.log"))
            .stdout(predicate::str::contains("blocked by: broken"));
    }

    #[test]
    fn test_stalled_worker_exits_124() {
        let dir = project("[[tasks]]\nname = \"hang\"\ncommand = \"sleep 60\"\n");
        foreman_in(&dir)
            .env("FOREMAN_STALL_TIMEOUT", "1")
            .args(["run", "--phase", "main"])
            .timeout(std::time::Duration::from_secs(30))
            .assert()
            .code(124);
        let alerts = fs::read_to_string(dir.path().join(".foreman/logs/alerts.log")).unwrap();
        assert!(alerts.contains("[ALERT]"));
    }

    #[test]
    fn test_lock_contention_exits_75() {
        let dir = project(TWO_TASKS);
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        fs::write(
            dir.path().join(".foreman/run.lock"),
            r#"{"run_id":"other","phase":"main","pid":1,"started_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        foreman_in(&dir)
            .args(["run", "--phase", "main"])
            .assert()
            .code(75)
            .stderr(predicate::str::contains("other"));
        // The foreign lock is untouched.
        assert!(dir.path().join(".foreman/run.lock").exists());
    }

    #[test]
    fn test_dry_run_prints_plan_only() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir)
            .args(["run", "--phase", "main", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("planned"))
            .stdout(predicate::str::contains("Dry run"));
        assert!(ledger_lines(&dir).is_empty());
        assert!(!dir.path().join(".foreman/worktrees").exists());
    }

    #[test]
    fn test_manual_tasks_need_explicit_flag() {
        let dir = project(
            "[[tasks]]\nname = \"auto\"\ncommand = \"true\"\n\n[[tasks]]\nname = \"apply\"\ncommand = \"true\"\nmanual = true\n",
        );
        foreman_in(&dir)
            .args(["run", "--phase", "main"])
            .assert()
            .success()
            .stdout(predicate::str::contains("awaiting manual invocation"));
        assert!(ledger_lines(&dir).iter().all(|e| e["task"] != "apply"));

        foreman_in(&dir)
            .args(["run", "--phase", "main", "--include-manual"])
            .assert()
            .success();
        assert!(ledger_lines(&dir).iter().any(|e| e["task"] == "apply"));
    }

    #[test]
    fn test_resume_skips_completed_tasks() {
        let dir = project(
            "[[tasks]]\nname = \"once\"\ncommand = \"echo x >> \\\"$FOREMAN_PROJECT_ROOT/once.count\\\"\"\nworkspace = \"shared\"\n\n[[tasks]]\nname = \"gate\"\ncommand = \"test -f \\\"$FOREMAN_PROJECT_ROOT/go\\\"\"\ndepends_on = [\"once\"]\n",
        );
        foreman_in(&dir)
            .args(["run", "--phase", "main"])
            .assert()
            .code(1);

        fs::write(dir.path().join("go"), "").unwrap();
        foreman_in(&dir)
            .args(["run", "--phase", "main", "--resume"])
            .assert()
            .success()
            .stdout(predicate::str::contains("resumed"));

        let count = fs::read_to_string(dir.path().join("once.count")).unwrap();
        assert_eq!(count.lines().count(), 1);
    }

    #[test]
    fn test_approval_gate_pauses_with_exit_zero() {
        let dir = project(
            r#"
[artifacts]
legacy_approval = "approvals/legacy.md"

[[phases]]
name = "main"
privileged = true

[[phases]]
name = "legacy"
gate = "approval"
approval = "legacy_approval"

[[tasks]]
name = "migrate"
phase = "legacy"
command = "true"
workspace = "shared"
"#,
        );
        foreman_in(&dir)
            .args(["run", "--phase", "legacy"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Paused"))
            .stdout(predicate::str::contains("legacy_approval"));
        assert!(ledger_lines(&dir).is_empty());
    }

    #[test]
    fn test_sigterm_releases_lock_and_kills_worker() {
        use std::process::{Command as StdCommand, Stdio};
        use std::time::{Duration, Instant};

        let dir = project(
            r#"
[[tasks]]
name = "long"
command = '''
if [ "$FOREMAN_ATTEMPT" = 1 ]; then
  echo $$ > "$FOREMAN_PROJECT_ROOT/worker.pid"
  exec sleep 37
fi
'''
"#,
        );
        let mut child = StdCommand::new(env!("CARGO_BIN_EXE_foreman"))
            .current_dir(dir.path())
            .env("FOREMAN_POLL_INTERVAL", "0.05")
            .env("FOREMAN_STATUS_INTERVAL", "0")
            .env("FOREMAN_OFFLINE", "1")
            .env_remove("FOREMAN_CONFIG")
            .env_remove("FOREMAN_RESUME")
            .args(["run", "--phase", "main"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let pid_file = dir.path().join("worker.pid");
        let deadline = Instant::now() + Duration::from_secs(30);
        let worker_pid: i32 = loop {
            if let Some(pid) = fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse().ok())
            {
                break pid;
            }
            assert!(Instant::now() < deadline, "worker never started");
            std::thread::sleep(Duration::from_millis(50));
        };
        let lock = dir.path().join(".foreman/run.lock");
        assert!(lock.exists());

        unsafe {
            libc::kill(child.id() as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + Duration::from_secs(30);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                panic!("foreman did not exit after SIGTERM");
            }
            std::thread::sleep(Duration::from_millis(50));
        };
        assert_eq!(status.code(), Some(130));
        assert!(!lock.exists());

        // The orphaned worker is reaped by init once foreman is gone.
        let deadline = Instant::now() + Duration::from_secs(10);
        while unsafe { libc::kill(worker_pid, 0) } == 0 {
            assert!(Instant::now() < deadline, "worker {} still alive", worker_pid);
            std::thread::sleep(Duration::from_millis(50));
        }

        let events = ledger_lines(&dir);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["state"], "started");
        assert_eq!(events[0]["attempt"], 1);

        foreman_in(&dir)
            .args(["run", "--phase", "main", "--resume"])
            .timeout(Duration::from_secs(30))
            .assert()
            .success();
        let events = ledger_lines(&dir);
        let last = &events[events.len() - 2..];
        assert_eq!(last[0]["state"], "started");
        assert_eq!(last[0]["attempt"], 2);
        assert_eq!(last[1]["state"], "completed");
    }

    #[test]
    fn test_worker_noop_smoke_run() {
        let dir = project("[[tasks]]\nname = \"real\"\ncommand = \"exit 9\"\n");
        foreman_in(&dir)
            .env("FOREMAN_WORKER_NOOP", "1")
            .args(["run", "--phase", "main"])
            .assert()
            .success();
    }
}

// =============================================================================
// Inspection commands
// =============================================================================

mod inspection {
    use super::*;

    #[test]
    fn test_ledger_json_after_run() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir).args(["run", "--phase", "main"]).assert().success();
        let output = foreman_in(&dir)
            .args(["ledger", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let text = String::from_utf8(output).unwrap();
        assert_eq!(text.lines().count(), 4);
        for line in text.lines() {
            let event: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(event["phase"], "main");
        }
    }

    #[test]
    fn test_status_shows_latest_run() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir).args(["run", "--phase", "main"]).assert().success();
        foreman_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Latest run"))
            .stdout(predicate::str::contains("core"))
            .stdout(predicate::str::contains("completed"));
    }

    #[test]
    fn test_lock_clear_removes_stale_lock() {
        let dir = project(TWO_TASKS);
        fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        // Far beyond any real pid_max.
        fs::write(
            dir.path().join(".foreman/run.lock"),
            r#"{"run_id":"dead","phase":"main","pid":2147483000,"started_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        foreman_in(&dir)
            .args(["lock", "clear"])
            .assert()
            .success()
            .stdout(predicate::str::contains("dead"));
        assert!(!dir.path().join(".foreman/run.lock").exists());
    }

    #[test]
    fn test_prune_removes_parked_worktrees() {
        let dir = project(TWO_TASKS);
        foreman_in(&dir).args(["run", "--phase", "main"]).assert().success();
        assert!(dir.path().join(".foreman/worktrees").read_dir().unwrap().next().is_some());
        foreman_in(&dir)
            .arg("prune")
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed"));
    }
}
