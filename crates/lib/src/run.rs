//! Per-run state: everything one state-application owns and mutates.
//!
//! Exactly one [`RunContext`] exists per invocation. It is created at run
//! start, threaded by reference through rendering, compilation and execution,
//! and read by reporting at the end. Nothing here is shared across runs;
//! cross-run serialization happens through the ESM lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde_json::Value;
use tracing::warn;

use crate::chunk::{Chunk, ChunkResult, ChunkTag, JsonMap};

/// Resolved declarative tree: declaration-id -> resource body.
pub type HighData = JsonMap;

/// Completed operation results keyed by chunk tag.
pub type RunningMap = HashMap<ChunkTag, ChunkResult>;

/// All mutable state for one state-application.
#[derive(Debug, Default)]
pub struct RunContext {
  pub run_name: String,

  /// Resolved declarative tree (merged across all gathered documents).
  pub high: HighData,

  /// Flattened operation list, in document resolution order. Grows mid-run
  /// when requisite rules synthesize chunks.
  pub low: Vec<Chunk>,

  /// Addendum appended exactly once after the main body drains.
  pub post_low: Vec<Chunk>,

  /// Results of completed operations.
  pub running: RunningMap,

  /// Previously enforced state, loaded from the ESM and updated as chunks
  /// succeed. Committed back through the ESM at the end of the run.
  pub managed_state: JsonMap,

  /// Canonical ref -> file path for every document consumed.
  pub sls_refs: BTreeMap<String, PathBuf>,

  /// Per-ref rendered declaration trees (pre-merge).
  pub rendered: BTreeMap<String, Value>,

  /// Set of document refs already consumed.
  pub resolved: BTreeSet<String>,

  /// Document resolution order; governs parameter-override precedence
  /// (later entries win). A re-requested ref moves to the end.
  pub order: Vec<String>,

  /// Refs queued for mid-run gathering; drained by the runtime between
  /// waves.
  pub pending_refs: Vec<String>,

  /// Aggregated collection errors. Rendering and compilation continue past
  /// these unless hard-fail mode is set.
  pub errors: Vec<String>,

  /// Layered parameter sources in gather order, keyed by originating ref.
  pub param_sources: Vec<(String, JsonMap)>,
}

impl RunContext {
  pub fn new(run_name: impl Into<String>) -> Self {
    Self {
      run_name: run_name.into(),
      ..Self::default()
    }
  }

  /// Record a collection error and keep going.
  pub fn error(&mut self, message: impl Into<String>) {
    let message = message.into();
    warn!(run = %self.run_name, error = %message, "collection error");
    self.errors.push(message);
  }

  /// Look up a parameter by key. Sources are ranked by their ref's position
  /// in the resolution order (later refs win); sources with no order slot
  /// fall back to reverse insertion order.
  pub fn param(&self, key: &str) -> Option<&Value> {
    for refr in self.order.iter().rev() {
      if let Some((_, params)) = self.param_sources.iter().find(|(r, _)| r == refr)
        && let Some(value) = params.get(key)
      {
        return Some(value);
      }
    }
    self
      .param_sources
      .iter()
      .rev()
      .filter(|(r, _)| !self.order.contains(r))
      .find_map(|(_, params)| params.get(key))
  }

  /// Replace or append the parameter source contributed by one document.
  pub fn set_param_source(&mut self, refr: &str, params: JsonMap) {
    if let Some(entry) = self.param_sources.iter_mut().find(|(r, _)| r == refr) {
      entry.1 = params;
    } else {
      self.param_sources.push((refr.to_string(), params));
    }
  }

  /// Move a ref to the end of the resolution order (last-wins dedup).
  pub fn touch_order(&mut self, refr: &str) {
    self.order.retain(|r| r != refr);
    self.order.push(refr.to_string());
  }

  /// True when any executed chunk reported failure.
  pub fn has_failures(&self) -> bool {
    self.running.values().any(|r| !r.result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn later_param_sources_override_earlier() {
    let mut run = RunContext::new("t");
    let mut a = JsonMap::new();
    a.insert("env".to_string(), json!("dev"));
    let mut b = JsonMap::new();
    b.insert("env".to_string(), json!("prod"));

    run.set_param_source("base", a);
    run.set_param_source("site", b);
    assert_eq!(run.param("env"), Some(&json!("prod")));
  }

  #[test]
  fn set_param_source_replaces_same_ref() {
    let mut run = RunContext::new("t");
    let mut a = JsonMap::new();
    a.insert("env".to_string(), json!("dev"));
    run.set_param_source("base", a.clone());

    let mut b = JsonMap::new();
    b.insert("env".to_string(), json!("stage"));
    run.set_param_source("base", b);

    assert_eq!(run.param_sources.len(), 1);
    assert_eq!(run.param("env"), Some(&json!("stage")));
  }

  #[test]
  fn resolution_order_governs_param_precedence() {
    let mut run = RunContext::new("t");
    let mut a = JsonMap::new();
    a.insert("env".to_string(), json!("prod"));
    let mut b = JsonMap::new();
    b.insert("env".to_string(), json!("dev"));

    run.touch_order("a");
    run.set_param_source("a", a);
    run.touch_order("b");
    run.set_param_source("b", b);
    assert_eq!(run.param("env"), Some(&json!("dev")));

    // Re-requesting "a" moves it to the end of the order and its value wins
    // without its source being re-inserted.
    run.touch_order("a");
    assert_eq!(run.param("env"), Some(&json!("prod")));
  }

  #[test]
  fn touch_order_moves_ref_to_end() {
    let mut run = RunContext::new("t");
    run.touch_order("a");
    run.touch_order("b");
    run.touch_order("a");
    assert_eq!(run.order, vec!["b".to_string(), "a".to_string()]);
  }
}
