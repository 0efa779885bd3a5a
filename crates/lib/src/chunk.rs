//! Low-data types: the flattened, directly-executable form of declarations.
//!
//! A [`Chunk`] is one resource invocation compiled out of the high-data tree.
//! Its identity is the [`ChunkTag`] tuple (resource, function, declaration-id),
//! which is also the node key in the dependency graph and the key under which
//! execution results are recorded.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dynamic mapping used throughout the engine (insertion-ordered).
pub type JsonMap = serde_json::Map<String, Value>;

/// Ordered parameter mapping for one chunk invocation.
pub type Params = JsonMap;

/// Declaration keys that are requisite directives rather than resource
/// parameters. The compiler pulls these out of the parameter fragments.
pub const REQUISITE_KEYWORDS: &[&str] = &["require", "arg_bind", "recreate_on_update"];

/// Identity of a chunk: (resource-type, function, declaration-id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkTag {
  pub resource: String,
  pub func: String,
  pub decl_id: String,
}

impl fmt::Display for ChunkTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}({})", self.resource, self.func, self.decl_id)
  }
}

/// A cross-declaration dependency/behavior directive attached to a chunk.
///
/// The keyword is kept as a plain string so that requisites with no plugin
/// registered for their keyword surface as permanently-unmet instead of being
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requisite {
  pub keyword: String,

  /// Optional resource-type qualifier for the referenced declaration.
  pub resource: Option<String>,

  /// Referenced declaration-id. `None` for self-directed requisites such as
  /// `recreate_on_update`, which constrain the owning chunk itself.
  pub decl_id: Option<String>,

  /// Keyword-specific payload (e.g. the recreate allow-list, or explicit
  /// arg_bind source/destination path mappings).
  pub args: Option<Value>,
}

impl fmt::Display for Requisite {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (&self.resource, &self.decl_id) {
      (Some(res), Some(id)) => write!(f, "{}({}: {})", self.keyword, res, id),
      (None, Some(id)) => write!(f, "{}({})", self.keyword, id),
      _ => write!(f, "{}", self.keyword),
    }
  }
}

/// One flattened, parameter-expanded resource invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
  /// Resource-type ("sub"), e.g. `cloud.instance`.
  pub resource: String,

  /// Function to invoke on the resource plugin (`present`, `absent`, ...).
  pub func: String,

  /// Declaration-id this chunk was compiled from.
  pub decl_id: String,

  /// Canonical reference of the document the declaration came from.
  pub sls: String,

  /// Resource name; defaults to the declaration-id.
  pub name: String,

  /// Ordered parameter mapping. Unresolved `${type:decl:path}` templates stay
  /// opaque here and are bound lazily at execution time.
  pub params: Params,

  /// Requisite directives carried verbatim from the declaration.
  pub requisites: Vec<Requisite>,

  /// Last-known backing resource identifier, populated from enforced state.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resource_id: Option<Value>,

  /// Marks chunks synthesized by a recreate flow (replacement-driven
  /// create/delete rather than direct user intent).
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub recreation_flow: bool,

  /// When set, the sequencer never reports this chunk as ready; a requisite
  /// rule has replaced it with synthesized chunks.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub halt_current_execution: bool,
}

impl Chunk {
  pub fn new(resource: &str, func: &str, decl_id: &str, sls: &str) -> Self {
    Self {
      resource: resource.to_string(),
      func: func.to_string(),
      decl_id: decl_id.to_string(),
      sls: sls.to_string(),
      name: decl_id.to_string(),
      params: Params::new(),
      requisites: Vec::new(),
      resource_id: None,
      recreation_flow: false,
      halt_current_execution: false,
    }
  }

  /// Dependency-graph identity of this chunk.
  pub fn tag(&self) -> ChunkTag {
    ChunkTag {
      resource: self.resource.clone(),
      func: self.func.clone(),
      decl_id: self.decl_id.clone(),
    }
  }

  /// Key under which this chunk's enforced state is persisted. Stable across
  /// `present`/`absent` invocations for the same resource.
  pub fn esm_tag(&self) -> String {
    format!("{}|{}|{}", self.resource, self.decl_id, self.name)
  }

  /// Requisites matching the given keyword.
  pub fn requisites_for<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a Requisite> {
    self.requisites.iter().filter(move |r| r.keyword == keyword)
  }
}

/// Result of executing one chunk, recorded into the run's `running` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
  /// Whether the operation succeeded.
  pub result: bool,

  /// Human-readable outcome description.
  pub comment: String,

  /// Resource attributes before the operation, if known.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub old_state: Option<Value>,

  /// Resource attributes after the operation, if known.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_state: Option<Value>,

  /// Attribute-level changes made (or that would be made in test mode).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub changes: Option<Value>,
}

impl ChunkResult {
  pub fn success(comment: impl Into<String>) -> Self {
    Self {
      result: true,
      comment: comment.into(),
      old_state: None,
      new_state: None,
      changes: None,
    }
  }

  pub fn failure(comment: impl Into<String>) -> Self {
    Self {
      result: false,
      comment: comment.into(),
      old_state: None,
      new_state: None,
      changes: None,
    }
  }

  pub fn with_new_state(mut self, state: Value) -> Self {
    self.new_state = Some(state);
    self
  }

  pub fn with_changes(mut self, changes: Value) -> Self {
    self.changes = Some(changes);
    self
  }

  /// True when the operation reported attribute-level changes.
  pub fn has_changes(&self) -> bool {
    match &self.changes {
      None | Some(Value::Null) => false,
      Some(Value::Object(map)) => !map.is_empty(),
      Some(Value::Array(items)) => !items.is_empty(),
      Some(_) => true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn tag_display_names_all_three_parts() {
    let chunk = Chunk::new("cloud.instance", "present", "web", "infra.web");
    assert_eq!(chunk.tag().to_string(), "cloud.instance.present(web)");
  }

  #[test]
  fn esm_tag_is_stable_across_functions() {
    let present = Chunk::new("cloud.instance", "present", "web", "infra.web");
    let mut absent = Chunk::new("cloud.instance", "absent", "web", "infra.web");
    absent.name = present.name.clone();
    assert_eq!(present.esm_tag(), absent.esm_tag());
  }

  #[test]
  fn name_defaults_to_decl_id() {
    let chunk = Chunk::new("test", "present", "alpha", "init");
    assert_eq!(chunk.name, "alpha");
  }

  #[test]
  fn has_changes_ignores_empty_shapes() {
    let mut result = ChunkResult::success("ok");
    assert!(!result.has_changes());

    result.changes = Some(json!({}));
    assert!(!result.has_changes());

    result.changes = Some(json!({"size": {"old": "s", "new": "l"}}));
    assert!(result.has_changes());
  }

  #[test]
  fn requisites_for_filters_by_keyword() {
    let mut chunk = Chunk::new("test", "present", "a", "init");
    chunk.requisites.push(Requisite {
      keyword: "require".to_string(),
      resource: None,
      decl_id: Some("b".to_string()),
      args: None,
    });
    chunk.requisites.push(Requisite {
      keyword: "arg_bind".to_string(),
      resource: Some("test".to_string()),
      decl_id: Some("c".to_string()),
      args: None,
    });

    let require: Vec<_> = chunk.requisites_for("require").collect();
    assert_eq!(require.len(), 1);
    assert_eq!(require[0].decl_id.as_deref(), Some("b"));
  }
}
