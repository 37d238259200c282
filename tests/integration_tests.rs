//! Integration tests for the nebula CLI
//!
//! These run the real binary against temporary nebula directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a nebula Command with a clean environment
fn nebula() -> Command {
    let mut cmd = cargo_bin_cmd!("nebula");
    cmd.env_remove("NEBULA_AGENT_CMD")
        .env_remove("NEBULA_MAX_WORKERS")
        .env_remove("NEBULA_DIR")
        .env_remove("NEBULA_LOG");
    cmd
}

fn write_phase(dir: &Path, file: &str, id: &str, title: &str, deps: &[&str]) {
    let deps = deps
        .iter()
        .map(|d| format!("\"{}\"", d))
        .collect::<Vec<_>>()
        .join(", ");
    let content = format!(
        "+++\nid = \"{id}\"\ntitle = \"{title}\"\ndepends_on = [{deps}]\n+++\n\nImplement {title}.\n"
    );
    fs::write(dir.join(file), content).unwrap();
}

/// Helper to create a nebula with setup -> (auth, billing)
fn create_nebula() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("nebula.toml"),
        "[nebula]\nname = \"rollout\"\n\n[execution]\ntick_interval_ms = 50\n",
    )
    .unwrap();
    write_phase(dir.path(), "01-setup.md", "setup", "Setup", &[]);
    write_phase(dir.path(), "02-auth.md", "auth", "Auth", &["setup"]);
    write_phase(dir.path(), "03-billing.md", "billing", "Billing", &["setup"]);
    dir
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_nebula_help() {
        nebula()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("apply"))
            .stdout(predicate::str::contains("plan"));
    }

    #[test]
    fn test_nebula_version() {
        nebula()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("nebula"));
    }

    #[test]
    fn test_unknown_command_fails() {
        nebula().arg("launch").assert().failure();
    }

    #[test]
    fn test_task_requires_a_cycle() {
        let dir = create_nebula();
        nebula()
            .args(["task", "fix the typo", "--max-cycles", "0"])
            .arg("--dir")
            .arg(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("--max-cycles must be at least 1"));
    }
}

// =============================================================================
// Plan Tests
// =============================================================================

mod plan {
    use super::*;

    #[test]
    fn test_plan_shows_waves() {
        let dir = create_nebula();
        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("rollout"))
            .stdout(predicate::str::contains("3 phases, 2 waves"))
            .stdout(predicate::str::contains("Wave 0"))
            .stdout(predicate::str::contains("Wave 1"))
            .stdout(predicate::str::contains("<- setup"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let dir = create_nebula();
        let output = nebula()
            .args(["plan", "--json"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(plan["name"], "rollout");
        assert_eq!(plan["phases"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_plan_save_writes_plan_file() {
        let dir = create_nebula();
        nebula()
            .args(["plan", "--save"])
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Saved plan to"));
        assert!(dir.path().join(".nebula/plan.json").exists());

        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("No changes since the saved plan."));
    }

    #[test]
    fn test_plan_reports_added_phase_against_saved_plan() {
        let dir = create_nebula();
        nebula()
            .args(["plan", "--save"])
            .current_dir(dir.path())
            .assert()
            .success();
        write_phase(dir.path(), "04-docs.md", "docs", "Docs", &["auth"]);

        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Changes since the saved plan"))
            .stdout(predicate::str::contains("+ docs"));
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let dir = TempDir::new().unwrap();
        write_phase(dir.path(), "a.md", "a", "A", &["b"]);
        write_phase(dir.path(), "b.md", "b", "B", &["a"]);
        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle detected"));
    }

    #[test]
    fn test_plan_rejects_unknown_dependency() {
        let dir = TempDir::new().unwrap();
        write_phase(dir.path(), "a.md", "a", "A", &["ghost"]);
        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    }

    #[test]
    fn test_plan_without_phases_fails() {
        let dir = TempDir::new().unwrap();
        nebula()
            .arg("plan")
            .current_dir(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("No phase files found"));
    }
}

// =============================================================================
// Intervention Tests
// =============================================================================

mod intervention {
    use super::*;

    #[test]
    fn test_pause_and_resume_toggle_sentinel() {
        let dir = create_nebula();
        let pause = dir.path().join(".nebula/PAUSE");

        nebula()
            .arg("pause")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Paused"));
        assert!(pause.exists());

        nebula()
            .arg("resume")
            .current_dir(dir.path())
            .assert()
            .success();
        assert!(!pause.exists());
    }

    #[test]
    fn test_stop_writes_sentinel() {
        let dir = create_nebula();
        nebula()
            .arg("stop")
            .current_dir(dir.path())
            .assert()
            .success();
        assert!(dir.path().join(".nebula/STOP").exists());
    }

    #[test]
    fn test_retry_writes_phase_id() {
        let dir = create_nebula();
        nebula()
            .args(["retry", "auth"])
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("no recorded status for auth"))
            .stdout(predicate::str::contains("Retry requested for auth"));
        let content = fs::read_to_string(dir.path().join(".nebula/RETRY")).unwrap();
        assert_eq!(content.trim(), "auth");
    }

    #[test]
    fn test_status_before_any_run() {
        let dir = create_nebula();
        nebula()
            .arg("status")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Scheduler: idle"))
            .stdout(predicate::str::contains("No phases have run yet."));
    }

    #[test]
    fn test_status_shows_pending_pause() {
        let dir = create_nebula();
        nebula().arg("pause").current_dir(dir.path()).assert().success();
        nebula()
            .arg("status")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("paused"));
    }
}

// =============================================================================
// Apply Tests
// =============================================================================

mod apply {
    use super::*;

    #[test]
    fn test_dry_run_executes_nothing() {
        let dir = create_nebula();
        nebula()
            .args(["apply", "--dry-run"])
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "Dispatch order with 2 workers: setup -> auth -> billing",
            ))
            .stdout(predicate::str::contains("Dry run: nothing was executed."));
        assert!(!dir.path().join(".nebula/state").exists());
    }

    #[test]
    fn test_stale_saved_plan_blocks_apply() {
        let dir = create_nebula();
        nebula()
            .args(["plan", "--save"])
            .current_dir(dir.path())
            .assert()
            .success();
        write_phase(dir.path(), "04-docs.md", "docs", "Docs", &["auth"]);

        nebula()
            .args(["apply", "--dry-run"])
            .current_dir(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Phase files changed"));

        nebula()
            .args(["apply", "--dry-run", "--force"])
            .current_dir(dir.path())
            .assert()
            .success();
    }

    #[cfg(unix)]
    const APPROVING_AGENT: &str = r##"
[agent]
command = "sh"
args = ["-c", '''cat > /dev/null; echo '{"type":"result","subtype":"success","result":"<verdict>approve</verdict>","total_cost_usd":0.01,"duration_ms":5}' ''']
"##;

    #[cfg(unix)]
    #[test]
    fn test_apply_runs_every_phase_with_command_agent() {
        let dir = create_nebula();
        let toml = dir.path().join("nebula.toml");
        let mut config = fs::read_to_string(&toml).unwrap();
        config.push_str(APPROVING_AGENT);
        fs::write(&toml, config).unwrap();

        nebula()
            .args(["apply", "--yes"])
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("3 done, 0 failed, 0 skipped"));

        assert!(
            dir.path()
                .join(".nebula/logs/agents/phase-setup-cycle-1-reviewer-prompt.md")
                .exists()
        );

        nebula()
            .arg("status")
            .current_dir(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("setup"))
            .stdout(predicate::str::contains("billing"))
            .stdout(predicate::str::contains("done"));
    }

    #[cfg(unix)]
    #[test]
    fn test_apply_fails_when_agent_cannot_start() {
        let dir = create_nebula();
        nebula()
            .args(["apply", "--yes"])
            .env("NEBULA_AGENT_CMD", "/nonexistent/agent-binary")
            .current_dir(dir.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("phase(s) failed"));
    }
}
