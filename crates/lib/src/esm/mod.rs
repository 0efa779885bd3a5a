//! Enforced State Manager: the locked, versioned record of what previous
//! runs created.
//!
//! Exactly one process may hold a run's enforced state at a time; the guard
//! returned by a backend holds that exclusion for the whole run. While held,
//! every mutation is written through to a scratch cache on local disk so that
//! a crash mid-run leaves an inspectable trail. On exit the full record set
//! is committed back through the backend and the scratch file is removed
//! (unless explicitly kept).

pub mod local;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chunk::JsonMap;

/// Engine cache-format version as (major, minor, patch).
pub const ESM_VERSION: (u32, u32, u32) = (1, 0, 0);

/// Reserved record key carrying cache metadata.
pub const META_KEY: &str = "__esm__";

#[derive(Debug, Error)]
pub enum EsmError {
  #[error("enforced state for run '{run_name}' is locked by another process: {detail}")]
  Locked { run_name: String, detail: String },

  #[error("ESM cache is out-of-date (cache version {stored}, engine {engine}); re-run with upgrade enabled")]
  OutOfDate { stored: String, engine: String },

  #[error("ESM cache version {stored} is newer than this engine ({engine}); upgrade the engine")]
  EngineTooOld { stored: String, engine: String },

  #[error("no ESM backend named '{0}'")]
  NoBackend(String),

  #[error("no upgrade path from cache version {0}")]
  NoUpgradePath(String),

  #[error("esm io failure: {0}")]
  Io(#[from] io::Error),

  #[error("esm serialization failure: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("{0}")]
  Backend(String),
}

/// Where and how one run's enforced state is held.
#[derive(Debug, Clone)]
pub struct EsmConfig {
  /// Backend name, e.g. `local`.
  pub backend: String,

  /// Run name; the partition key of the enforced state.
  pub run_name: String,

  /// Directory for the scratch cache and local-backend storage.
  pub cache_dir: PathBuf,

  /// Apply registered upgrades when the cache format is older than the
  /// engine instead of refusing.
  pub upgrade: bool,

  /// Keep the scratch cache on clean exit.
  pub keep_cache: bool,
}

/// Storage backend for enforced state.
#[async_trait]
pub trait EsmBackend: Send + Sync {
  fn name(&self) -> &'static str;

  /// Acquire exclusive access to the run's state and return a guard holding
  /// that exclusion.
  async fn enter(&self, config: &EsmConfig) -> Result<Box<dyn EsmGuard>, EsmError>;
}

/// Exclusive handle on one run's stored state. Dropping the guard without
/// `exit` releases the exclusion without committing.
#[async_trait]
pub trait EsmGuard: Send {
  /// Load the stored record set; `None` when no state exists yet.
  async fn get_state(&mut self) -> Result<Option<JsonMap>, EsmError>;

  /// Replace the stored record set.
  async fn set_state(&mut self, state: &JsonMap) -> Result<(), EsmError>;

  /// Release the exclusion. `had_error` reports whether the run failed, for
  /// backends that track it.
  async fn exit(self: Box<Self>, had_error: bool) -> Result<(), EsmError>;
}

/// One cache-format migration step.
pub trait EsmUpgrade: Send + Sync {
  /// Version this step upgrades from (patch ignored).
  fn from_version(&self) -> (u32, u32, u32);

  /// Version the records are in afterwards.
  fn to_version(&self) -> (u32, u32, u32);

  fn apply(&self, records: &mut JsonMap) -> Result<(), EsmError>;
}

/// A held ESM session: exclusive guard, in-memory records and the
/// write-through scratch cache.
pub struct EsmContext {
  guard: Box<dyn EsmGuard>,
  records: JsonMap,
  scratch_path: PathBuf,
  keep_cache: bool,
}

/// Open the enforced state for one run: lock it, load it, and verify the
/// cache format against the engine version.
pub async fn context(
  backend: &dyn EsmBackend,
  upgrades: &[Arc<dyn EsmUpgrade>],
  config: &EsmConfig,
) -> Result<EsmContext, EsmError> {
  let mut guard = backend.enter(config).await?;

  let mut records = match guard.get_state().await {
    Ok(state) => state.unwrap_or_default(),
    Err(e) => {
      // Never leave the exclusion held on a load failure.
      let _ = guard.exit(true).await;
      return Err(e);
    }
  };

  let stored_version = match records.remove(META_KEY) {
    Some(meta) => parse_version(&meta),
    None if records.is_empty() => ESM_VERSION,
    None => (0, 0, 0),
  };

  if let Err(e) = reconcile_version(stored_version, config.upgrade, upgrades, &mut records) {
    let _ = guard.exit(true).await;
    return Err(e);
  }

  let scratch_path = config.cache_dir.join(format!("{}.scratch.json", config.run_name));
  info!(
    run = %config.run_name,
    backend = backend.name(),
    records = records.len(),
    "entered enforced state"
  );

  let ctx = EsmContext {
    guard,
    records,
    scratch_path,
    keep_cache: config.keep_cache,
  };
  ctx.flush_scratch()?;
  Ok(ctx)
}

impl EsmContext {
  /// All live records, keyed by ESM tag.
  pub fn records(&self) -> &JsonMap {
    &self.records
  }

  pub fn get(&self, esm_tag: &str) -> Option<&Value> {
    self.records.get(esm_tag)
  }

  pub fn insert(&mut self, esm_tag: impl Into<String>, record: Value) -> Result<(), EsmError> {
    self.records.insert(esm_tag.into(), record);
    self.flush_scratch()
  }

  pub fn remove(&mut self, esm_tag: &str) -> Result<(), EsmError> {
    self.records.remove(esm_tag);
    self.flush_scratch()
  }

  /// Replace the record set with the state a finished run accumulated.
  pub fn absorb(&mut self, records: JsonMap) -> Result<(), EsmError> {
    self.records = records;
    self.flush_scratch()
  }

  /// Commit the records through the backend and release the exclusion.
  ///
  /// The exclusion is released even when the commit fails; the scratch cache
  /// is then left behind so nothing is lost.
  pub async fn exit(mut self, had_error: bool) -> Result<(), EsmError> {
    let mut persisted = self.records.clone();
    persisted.insert(META_KEY.to_string(), meta_record());

    let commit = self.guard.set_state(&persisted).await;
    let release = self.guard.exit(had_error || commit.is_err()).await;

    commit?;
    release?;

    if self.keep_cache {
      debug!(path = %self.scratch_path.display(), "scratch cache kept on request");
    } else if let Err(e) = std::fs::remove_file(&self.scratch_path) {
      if e.kind() != io::ErrorKind::NotFound {
        warn!(path = %self.scratch_path.display(), error = %e, "failed to remove scratch cache");
      }
    }
    Ok(())
  }

  /// Release the exclusion without committing; the stored state is left
  /// exactly as it was on enter. Plans end through here.
  pub async fn release(self) -> Result<(), EsmError> {
    let EsmContext {
      guard,
      scratch_path,
      keep_cache,
      ..
    } = self;
    let released = guard.exit(false).await;

    if keep_cache {
      debug!(path = %scratch_path.display(), "scratch cache kept on request");
    } else if let Err(e) = std::fs::remove_file(&scratch_path) {
      if e.kind() != io::ErrorKind::NotFound {
        warn!(path = %scratch_path.display(), error = %e, "failed to remove scratch cache");
      }
    }
    released
  }

  /// Write-through: every mutation lands on local disk before the engine
  /// moves on.
  fn flush_scratch(&self) -> Result<(), EsmError> {
    if let Some(parent) = self.scratch_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let tmp = self.scratch_path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&self.records)?)?;
    std::fs::rename(&tmp, &self.scratch_path)?;
    Ok(())
  }
}

fn meta_record() -> Value {
  json!({
    "version": [ESM_VERSION.0, ESM_VERSION.1, ESM_VERSION.2],
    "written_at_unix": std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
  })
}

fn parse_version(meta: &Value) -> (u32, u32, u32) {
  let Some(parts) = meta.get("version").and_then(Value::as_array) else {
    return (0, 0, 0);
  };
  let at = |i: usize| parts.get(i).and_then(Value::as_u64).unwrap_or(0) as u32;
  (at(0), at(1), at(2))
}

fn version_string(v: (u32, u32, u32)) -> String {
  format!("{}.{}.{}", v.0, v.1, v.2)
}

/// Compare the stored cache version against the engine. Patch differences
/// are compatible; an older major/minor needs an explicit upgrade; a newer
/// one needs a newer engine.
fn reconcile_version(
  stored: (u32, u32, u32),
  upgrade: bool,
  upgrades: &[Arc<dyn EsmUpgrade>],
  records: &mut JsonMap,
) -> Result<(), EsmError> {
  // Only major/minor participate in the compare; the patch position never
  // gates an open.
  if (stored.0, stored.1) == (ESM_VERSION.0, ESM_VERSION.1) {
    return Ok(());
  }

  if (stored.0, stored.1) > (ESM_VERSION.0, ESM_VERSION.1) {
    return Err(EsmError::EngineTooOld {
      stored: version_string(stored),
      engine: version_string(ESM_VERSION),
    });
  }

  if !upgrade {
    return Err(EsmError::OutOfDate {
      stored: version_string(stored),
      engine: version_string(ESM_VERSION),
    });
  }

  let mut current = stored;
  while (current.0, current.1) < (ESM_VERSION.0, ESM_VERSION.1) {
    let Some(step) = upgrades
      .iter()
      .find(|u| (u.from_version().0, u.from_version().1) == (current.0, current.1))
    else {
      return Err(EsmError::NoUpgradePath(version_string(current)));
    };
    info!(
      from = %version_string(current),
      to = %version_string(step.to_version()),
      "upgrading enforced state cache"
    );
    step.apply(records)?;
    current = step.to_version();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::local::LocalBackend;
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  fn config(tmp: &TempDir) -> EsmConfig {
    EsmConfig {
      backend: "local".to_string(),
      run_name: "t".to_string(),
      cache_dir: tmp.path().to_path_buf(),
      upgrade: false,
      keep_cache: false,
    }
  }

  #[tokio::test]
  async fn fresh_context_is_empty_and_commits_records() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;

    let mut ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    assert!(ctx.records().is_empty());

    ctx.insert("test|web|web", json!({"resource_id": "i-1"})).unwrap();
    ctx.exit(false).await.unwrap();

    let ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    assert_eq!(ctx.get("test|web|web"), Some(&json!({"resource_id": "i-1"})));
    assert!(ctx.get(META_KEY).is_none());
    ctx.exit(false).await.unwrap();
  }

  #[tokio::test]
  async fn scratch_cache_tracks_mutations_and_is_removed_on_exit() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;
    let scratch = tmp.path().join("t.scratch.json");

    let mut ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    ctx.insert("a", json!(1)).unwrap();

    let on_disk: JsonMap = serde_json::from_slice(&std::fs::read(&scratch).unwrap()).unwrap();
    assert_eq!(on_disk.get("a"), Some(&json!(1)));

    ctx.exit(false).await.unwrap();
    assert!(!scratch.exists());
  }

  #[tokio::test]
  async fn release_skips_the_commit() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;

    let mut ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    ctx.insert("a", json!(1)).unwrap();
    ctx.release().await.unwrap();

    // Nothing committed, scratch gone, exclusion released.
    assert!(!tmp.path().join("t.state.json").exists());
    assert!(!tmp.path().join("t.scratch.json").exists());
    let ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    assert!(ctx.records().is_empty());
    ctx.exit(false).await.unwrap();
  }

  #[tokio::test]
  async fn keep_cache_leaves_scratch_behind() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;
    let mut cfg = config(&tmp);
    cfg.keep_cache = true;

    let ctx = context(&backend, &[], &cfg).await.unwrap();
    ctx.exit(false).await.unwrap();
    assert!(tmp.path().join("t.scratch.json").exists());
  }

  #[tokio::test]
  async fn versionless_records_are_out_of_date() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;

    // Simulate a pre-versioning cache: records but no meta.
    std::fs::write(
      tmp.path().join("t.state.json"),
      serde_json::to_vec(&json!({"test|a|a": {"resource_id": "x"}})).unwrap(),
    )
    .unwrap();

    let Err(err) = context(&backend, &[], &config(&tmp)).await else {
      panic!("a versionless cache must refuse without upgrade enabled");
    };
    assert!(err.to_string().contains("ESM cache is out-of-date"));

    // The exclusion was released; a correct attempt can proceed.
    struct ZeroToOne;
    impl EsmUpgrade for ZeroToOne {
      fn from_version(&self) -> (u32, u32, u32) {
        (0, 0, 0)
      }
      fn to_version(&self) -> (u32, u32, u32) {
        (1, 0, 0)
      }
      fn apply(&self, _records: &mut JsonMap) -> Result<(), EsmError> {
        Ok(())
      }
    }

    let mut cfg = config(&tmp);
    cfg.upgrade = true;
    let upgrades: Vec<Arc<dyn EsmUpgrade>> = vec![Arc::new(ZeroToOne)];
    let ctx = context(&backend, &upgrades, &cfg).await.unwrap();
    assert!(ctx.get("test|a|a").is_some());
    ctx.exit(false).await.unwrap();
  }

  #[tokio::test]
  async fn newer_cache_refuses_older_engine() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;

    std::fs::write(
      tmp.path().join("t.state.json"),
      serde_json::to_vec(&json!({META_KEY: {"version": [9, 0, 0]}})).unwrap(),
    )
    .unwrap();

    let Err(err) = context(&backend, &[], &config(&tmp)).await else {
      panic!("a newer cache must refuse an older engine");
    };
    assert!(matches!(err, EsmError::EngineTooOld { .. }));
  }

  #[tokio::test]
  async fn absorb_replaces_the_record_set() {
    let tmp = TempDir::new().unwrap();
    let backend = LocalBackend;

    let mut ctx = context(&backend, &[], &config(&tmp)).await.unwrap();
    ctx.insert("stale", json!(1)).unwrap();

    let mut fresh = JsonMap::new();
    fresh.insert("live".to_string(), json!(2));
    ctx.absorb(fresh).unwrap();

    assert!(ctx.get("stale").is_none());
    assert_eq!(ctx.get("live"), Some(&json!(2)));
    ctx.exit(false).await.unwrap();
  }
}
