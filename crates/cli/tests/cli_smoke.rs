//! CLI smoke tests for idem.
//!
//! These tests verify that the CLI commands run without panicking and
//! return appropriate exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the idem binary.
fn idem_cmd() -> Command {
  cargo_bin_cmd!("idem")
}

/// Create a temp directory with an sls tree and a cache dir.
fn temp_site(content: &str) -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::create_dir_all(temp.path().join("sls")).unwrap();
  std::fs::write(temp.path().join("sls").join("site.sls"), content).unwrap();
  temp
}

const MINIMAL_SITE: &str = "web:\n  test.present:\n    - size: small\n";

fn run_args(temp: &TempDir) -> Vec<String> {
  vec![
    "site".to_string(),
    "--source".to_string(),
    temp.path().join("sls").display().to_string(),
    "--cache-dir".to_string(),
    temp.path().join("cache").display().to_string(),
  ]
}

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  idem_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  idem_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("idem"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["apply", "plan", "validate", "describe"] {
    idem_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Validate
// =============================================================================

#[test]
fn validate_accepts_a_good_document() {
  let temp = temp_site(MINIMAL_SITE);
  idem_cmd()
    .arg("validate")
    .args(run_args(&temp))
    .assert()
    .success()
    .stderr(predicate::str::contains("1 chunk(s) ok"));
}

#[test]
fn validate_rejects_a_missing_ref() {
  let temp = temp_site(MINIMAL_SITE);
  idem_cmd()
    .arg("validate")
    .arg("ghost")
    .args(&run_args(&temp)[1..])
    .assert()
    .failure()
    .stderr(predicate::str::contains("ghost"));
}

#[test]
fn validate_rejects_a_declaration_without_function() {
  let temp = temp_site("web:\n  test:\n    - size: small\n");
  idem_cmd()
    .arg("validate")
    .args(run_args(&temp))
    .assert()
    .failure()
    .stderr(predicate::str::contains("no function"));
}

// =============================================================================
// Plan & Apply
// =============================================================================

#[test]
fn plan_reports_would_change_without_committing() {
  let temp = temp_site(MINIMAL_SITE);
  idem_cmd()
    .arg("plan")
    .args(run_args(&temp))
    .assert()
    .success()
    .stderr(predicate::str::contains("would change"));

  assert!(!temp.path().join("cache").join("default.state.json").exists());
}

#[test]
fn apply_commits_enforced_state() {
  let temp = temp_site(MINIMAL_SITE);
  idem_cmd()
    .arg("apply")
    .args(run_args(&temp))
    .assert()
    .success()
    .stderr(predicate::str::contains("changed"));

  let state = std::fs::read_to_string(temp.path().join("cache").join("default.state.json")).unwrap();
  assert!(state.contains("test|web|web"));
}

#[test]
fn apply_exits_nonzero_on_failed_chunks() {
  let temp = temp_site("bad:\n  test.fail: []\n");
  idem_cmd()
    .arg("apply")
    .args(run_args(&temp))
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed"));
}

#[test]
fn second_apply_is_a_no_op_for_committed_state() {
  let temp = temp_site(MINIMAL_SITE);
  idem_cmd().arg("apply").args(run_args(&temp)).assert().success();
  idem_cmd().arg("apply").args(run_args(&temp)).assert().success();
}

// =============================================================================
// Describe
// =============================================================================

#[test]
fn describe_prints_json_for_known_resource() {
  idem_cmd()
    .arg("describe")
    .arg("test")
    .assert()
    .success()
    .stdout(predicate::str::contains("{}"));
}

#[test]
fn describe_rejects_unknown_resource() {
  idem_cmd()
    .arg("describe")
    .arg("ghost")
    .assert()
    .failure()
    .stderr(predicate::str::contains("no resource plugin"));
}
