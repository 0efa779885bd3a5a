//! The full apply pipeline: gather, compile, enter the enforced state,
//! execute, commit.
//!
//! Resolution errors short-circuit before anything touches managed
//! infrastructure: a run with collection errors reports them and executes
//! nothing. The ESM exclusion is entered only once execution is certain and
//! exited on every path afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::compile;
use crate::esm::{self, EsmConfig, EsmError};
use crate::exec::report::RunReport;
use crate::exec::{CancelToken, ExecError, ExecOpts, Reconcile, Runtime};
use crate::registry::Registry;
use crate::render::{self, GatherOpts, RenderError};
use crate::resource::OpContext;
use crate::run::RunContext;
use crate::source::SourceResolver;

#[derive(Debug, Error)]
pub enum ApplyError {
  #[error(transparent)]
  Render(#[from] RenderError),

  #[error(transparent)]
  Esm(#[from] EsmError),

  #[error("{0}")]
  Collection(String),
}

/// Options for one apply (or plan) invocation.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
  /// Run name; partitions enforced state.
  pub run_name: String,

  /// Document source directories, in priority order.
  pub sources: Vec<PathBuf>,

  /// Top-level document refs to gather.
  pub refs: Vec<String>,

  /// ESM backend name.
  pub esm_backend: String,

  /// Cache directory for the ESM scratch file and local backend state.
  pub cache_dir: PathBuf,

  /// Dry-run: resolve, sequence and report without touching resources or
  /// enforced state.
  pub test: bool,

  /// Abort on the first collection error.
  pub hard_fail: bool,

  /// Migrate an older enforced-state cache instead of refusing it.
  pub upgrade_esm: bool,

  /// Keep the scratch cache after a clean exit.
  pub keep_cache: bool,

  /// Maximum chunks in flight at once.
  pub parallelism: usize,

  pub cancel: CancelToken,
}

/// Run the pipeline end to end and produce the report.
pub async fn apply(registry: Arc<Registry>, options: ApplyOptions) -> Result<RunReport, ApplyError> {
  let mut run = RunContext::new(&options.run_name);
  let mut resolver = SourceResolver::new(options.sources.clone());

  let gather_opts = GatherOpts {
    hard_fail: options.hard_fail,
    ..GatherOpts::default()
  };
  render::gather(&mut run, &mut resolver, &registry, &options.refs, &gather_opts)?;

  let (low, compile_errors) = compile::compile_high(&run.high);
  run.low = low;
  for error in compile_errors {
    run.error(error.clone());
    if options.hard_fail {
      return Err(ApplyError::Collection(error));
    }
  }

  if !run.errors.is_empty() {
    warn!(
      run = %options.run_name,
      errors = run.errors.len(),
      "resolution errors present, nothing will be executed"
    );
    return Ok(RunReport::from_run(&run, options.test, false));
  }

  let backend = registry
    .esm_backend(&options.esm_backend)
    .ok_or_else(|| EsmError::NoBackend(options.esm_backend.clone()))?;
  let esm_config = EsmConfig {
    backend: options.esm_backend.clone(),
    run_name: options.run_name.clone(),
    cache_dir: options.cache_dir.clone(),
    upgrade: options.upgrade_esm,
    keep_cache: options.keep_cache,
  };
  let mut esm = esm::context(backend.as_ref(), registry.esm_upgrades(), &esm_config).await?;
  run.managed_state = esm.records().clone();

  let runtime = Runtime::new(
    registry.clone(),
    ExecOpts {
      parallelism: options.parallelism,
      cancel: options.cancel.clone(),
    },
  );
  let ctx = OpContext::new(&options.run_name, options.test);
  let esm_sink = if options.test { None } else { Some(&mut esm) };
  let reconcile = Reconcile {
    resolver: &mut resolver,
    opts: gather_opts,
  };
  let outcome = runtime.run(&mut run, &ctx, esm_sink, Some(reconcile)).await;

  let cancelled = matches!(outcome, Err(ExecError::Cancelled));
  if let Err(ExecError::Stalled(stall)) = &outcome {
    run.error(stall.to_string());
  }

  let had_error = cancelled || run.has_failures() || !run.errors.is_empty();
  if options.test {
    esm.release().await?;
  } else {
    esm.absorb(run.managed_state.clone())?;
    esm.exit(had_error).await?;
  }

  let report = RunReport::from_run(&run, options.test, cancelled);
  let (changed, unchanged, failed) = report.counts();
  info!(
    run = %options.run_name,
    changed,
    unchanged,
    failed,
    cancelled,
    "run finished"
  );
  Ok(report)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::exec::report::Outcome;
  use std::path::Path;
  use tempfile::TempDir;

  fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
  }

  fn options(tmp: &TempDir, refs: &[&str]) -> ApplyOptions {
    ApplyOptions {
      run_name: "t".to_string(),
      sources: vec![tmp.path().join("sls")],
      refs: refs.iter().map(|r| r.to_string()).collect(),
      esm_backend: "local".to_string(),
      cache_dir: tmp.path().join("cache"),
      test: false,
      hard_fail: false,
      upgrade_esm: false,
      keep_cache: false,
      parallelism: 2,
      cancel: CancelToken::new(),
    }
  }

  #[tokio::test]
  async fn applies_a_simple_document() {
    let tmp = TempDir::new().unwrap();
    write(
      tmp.path(),
      "sls/site.sls",
      "web:\n  test.present:\n    - size: small\n",
    );

    let registry = Arc::new(Registry::with_defaults());
    let report = apply(registry, options(&tmp, &["site"])).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].outcome, Outcome::Changed);
  }

  #[tokio::test]
  async fn enforced_state_survives_across_applies() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "sls/site.sls", "web:\n  test.present: []\n");

    let registry = Arc::new(Registry::with_defaults());
    apply(registry.clone(), options(&tmp, &["site"])).await.unwrap();

    // Second apply sees the committed record through a fresh ESM session.
    let state_path = tmp.path().join("cache").join("t.state.json");
    let state: serde_json::Value = serde_json::from_slice(&std::fs::read(state_path).unwrap()).unwrap();
    assert!(state.get("test|web|web").is_some());
  }

  #[tokio::test]
  async fn resolution_errors_skip_execution() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "sls/site.sls", "include:\n  - ghost\nweb:\n  test.present: []\n");

    let registry = Arc::new(Registry::with_defaults());
    let report = apply(registry, options(&tmp, &["site"])).await.unwrap();

    assert!(!report.succeeded());
    assert!(!report.errors.is_empty());
    assert!(report.entries.iter().all(|e| e.outcome == Outcome::Skipped));
    // The ESM was never entered, so no state file exists.
    assert!(!tmp.path().join("cache").join("t.state.json").exists());
  }

  #[tokio::test]
  async fn test_mode_plans_without_committing() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "sls/site.sls", "web:\n  test.present: []\n");

    let registry = Arc::new(Registry::with_defaults());
    let mut opts = options(&tmp, &["site"]);
    opts.test = true;
    let report = apply(registry, opts).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.entries[0].outcome, Outcome::WouldChange);

    // A plan exits the exclusion without committing anything.
    assert!(!tmp.path().join("cache").join("t.state.json").exists());
    assert!(!tmp.path().join("cache").join("t.scratch.json").exists());
  }

  #[tokio::test]
  async fn failed_chunk_fails_the_report_but_commits_survivors() {
    let tmp = TempDir::new().unwrap();
    write(
      tmp.path(),
      "sls/site.sls",
      "ok:\n  test.present: []\nbad:\n  test.fail: []\n",
    );

    let registry = Arc::new(Registry::with_defaults());
    let report = apply(registry, options(&tmp, &["site"])).await.unwrap();

    assert!(!report.succeeded());
    let state_path = tmp.path().join("cache").join("t.state.json");
    let state: serde_json::Value = serde_json::from_slice(&std::fs::read(state_path).unwrap()).unwrap();
    assert!(state.get("test|ok|ok").is_some());
  }

  #[tokio::test]
  async fn cross_chunk_binding_end_to_end() {
    let tmp = TempDir::new().unwrap();
    write(
      tmp.path(),
      "sls/site.sls",
      concat!(
        "db:\n  test.present:\n    - host: 10.0.0.5\n",
        "app:\n  test.present:\n    - db_host: \"${test:db:host}\"\n",
        "    - arg_bind:\n      - test: db\n",
      ),
    );

    let registry = Arc::new(Registry::with_defaults());
    let report = apply(registry, options(&tmp, &["site"])).await.unwrap();
    assert!(report.succeeded(), "errors: {:?}", report.errors);

    let app = report.entries.iter().find(|e| e.tag.contains("app")).unwrap();
    let changes = app.changes.as_ref().unwrap();
    assert_eq!(changes["new"]["db_host"], serde_json::json!("10.0.0.5"));
  }
}
