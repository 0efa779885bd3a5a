//! Execution-time requisite plugins.
//!
//! The sequencer only orders chunks; whatever a requisite means beyond
//! ordering happens here, on the ready chunk, immediately before dispatch.
//! Plugins run in registration order and may rewrite the chunk's parameters,
//! halt it, and synthesize replacement chunks into `pending`.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::argbind::{self, ArgBindError, BindRef};
use crate::chunk::{Chunk, JsonMap, Params};
use crate::resource::OpContext;
use crate::run::RunningMap;

#[derive(Debug, Error)]
pub enum RequisiteError {
  #[error(transparent)]
  Bind(#[from] ArgBindError),

  #[error("{0}")]
  Invalid(String),
}

/// Execution-time behavior of one requisite keyword.
pub trait RequisitePlugin: Send + Sync {
  fn keyword(&self) -> &'static str;

  /// Inspect and possibly rewrite a ready chunk. Synthesized chunks go into
  /// `pending`; setting `chunk.halt_current_execution` withdraws the chunk
  /// from the current wave.
  fn check(
    &self,
    ctx: &OpContext,
    chunk: &mut Chunk,
    running: &RunningMap,
    managed_state: &JsonMap,
    low: &[Chunk],
    pending: &mut Vec<Chunk>,
  ) -> Result<(), RequisiteError>;
}

/// `require` is pure ordering; the sequencer already enforced it.
pub struct RequirePlugin;

impl RequisitePlugin for RequirePlugin {
  fn keyword(&self) -> &'static str {
    "require"
  }

  fn check(
    &self,
    _ctx: &OpContext,
    _chunk: &mut Chunk,
    _running: &RunningMap,
    _managed_state: &JsonMap,
    _low: &[Chunk],
    _pending: &mut Vec<Chunk>,
  ) -> Result<(), RequisiteError> {
    Ok(())
  }
}

/// `arg_bind`: late binding of `${resource:decl:path}` references against the
/// `new_state` the referenced chunks recorded, plus explicit source-to-dest
/// path mappings carried in the requisite args.
pub struct ArgBindPlugin;

impl RequisitePlugin for ArgBindPlugin {
  fn keyword(&self) -> &'static str {
    "arg_bind"
  }

  fn check(
    &self,
    ctx: &OpContext,
    chunk: &mut Chunk,
    running: &RunningMap,
    _managed_state: &JsonMap,
    low: &[Chunk],
    pending: &mut Vec<Chunk>,
  ) -> Result<(), RequisiteError> {
    let _ = pending;
    let test = ctx.test;

    // Template substitution over the whole parameter tree.
    let mut params = Value::Object(std::mem::take(&mut chunk.params));
    argbind::substitute_value(&mut params, &mut |refr| bind_lookup(refr, low, running, test))?;

    // Explicit path mappings: [{source_path: dest_path}, ...].
    let mappings: Vec<(BindRef, Vec<argbind::PathSeg>)> = explicit_mappings(chunk)?;
    for (source, dest) in mappings {
      let value = bind_lookup(&source, low, running, test)?;
      argbind::write(&mut params, &dest, value)?;
    }

    chunk.params = match params {
      Value::Object(map) => map,
      _ => Params::new(),
    };
    debug!(tag = %chunk.tag(), "arg_bind parameters resolved");
    Ok(())
  }
}

/// Collect the explicit mappings of every `arg_bind` requisite on the chunk,
/// qualified into full references against the requisite's target.
fn explicit_mappings(chunk: &Chunk) -> Result<Vec<(BindRef, Vec<argbind::PathSeg>)>, RequisiteError> {
  let mut out = Vec::new();

  for req in chunk.requisites_for("arg_bind") {
    let Some(args) = &req.args else {
      continue;
    };
    let (Some(resource), Some(decl_id)) = (&req.resource, &req.decl_id) else {
      return Err(RequisiteError::Invalid(format!(
        "arg_bind mappings on '{}' need a fully-qualified target",
        chunk.tag()
      )));
    };

    let Value::Array(entries) = args else {
      return Err(RequisiteError::Invalid(format!(
        "arg_bind args on '{}' must be a list of source-to-dest mappings",
        chunk.tag()
      )));
    };

    for entry in entries {
      let Value::Object(mapping) = entry else {
        return Err(RequisiteError::Invalid(format!(
          "arg_bind mapping on '{}' must be a single-key mapping",
          chunk.tag()
        )));
      };
      for (source_path, dest_path) in mapping {
        let Value::String(dest_path) = dest_path else {
          return Err(RequisiteError::Invalid(format!(
            "arg_bind destination on '{}' must be a path string",
            chunk.tag()
          )));
        };
        let source = BindRef {
          resource: resource.clone(),
          decl_id: decl_id.clone(),
          path: argbind::parse_path(source_path)?,
        };
        out.push((source, argbind::parse_path(dest_path)?));
      }
    }
  }
  Ok(out)
}

/// Resolve one reference against the referenced chunk's recorded `new_state`.
/// In test mode, anything not yet known resolves to the plan placeholder.
fn bind_lookup(refr: &BindRef, low: &[Chunk], running: &RunningMap, test: bool) -> Result<Value, ArgBindError> {
  let target = low
    .iter()
    .find(|c| c.decl_id == refr.decl_id && c.resource == refr.resource && !c.halt_current_execution)
    .or_else(|| low.iter().find(|c| c.decl_id == refr.decl_id && c.resource == refr.resource));

  let Some(target) = target else {
    if test {
      return Ok(Value::String(argbind::test_placeholder(refr)));
    }
    return Err(ArgBindError::NoTarget { refr: refr.to_string() });
  };

  let state = running.get(&target.tag()).and_then(|r| r.new_state.as_ref());
  let Some(state) = state else {
    if test {
      return Ok(Value::String(argbind::test_placeholder(refr)));
    }
    return Err(ArgBindError::NoState { refr: refr.to_string() });
  };

  match argbind::resolve(refr, state, &refr.path) {
    Ok(value) => Ok(value),
    Err(ArgBindError::MissingKey { .. }) if test => Ok(Value::String(argbind::test_placeholder(refr))),
    Err(e) => Err(e),
  }
}

/// Suffix of the declaration-id given to synthesized delete chunks.
pub const RECREATE_DELETE_SUFFIX: &str = "-recreate-delete";

/// `recreate_on_update`: when watched parameters differ from the enforced
/// state, replace the in-place update with a delete/create pair.
///
/// Default policy deletes the old resource first; `create_before_destroy`
/// inverts it, sequencing the delete after the new resource and after every
/// dependent of this declaration.
pub struct RecreateOnUpdatePlugin;

impl RequisitePlugin for RecreateOnUpdatePlugin {
  fn keyword(&self) -> &'static str {
    "recreate_on_update"
  }

  fn check(
    &self,
    ctx: &OpContext,
    chunk: &mut Chunk,
    _running: &RunningMap,
    managed_state: &JsonMap,
    low: &[Chunk],
    pending: &mut Vec<Chunk>,
  ) -> Result<(), RequisiteError> {
    // Synthesized chunks never re-trigger recreation.
    if chunk.recreation_flow || chunk.func != "present" {
      return Ok(());
    }

    let policy = RecreatePolicy::from_chunk(chunk)?;

    let Some(record) = managed_state.get(&chunk.esm_tag()) else {
      return Ok(());
    };
    chunk.resource_id = record.get("resource_id").cloned();

    let prior = record.get("new_state").cloned().unwrap_or(Value::Null);
    if !policy.differs(&chunk.params, &prior) {
      return Ok(());
    }

    info!(tag = %chunk.tag(), create_before_destroy = policy.create_before_destroy, "watched parameters changed, recreating");
    if ctx.test {
      // Plans report the would-be replacement without synthesizing it.
      return Ok(());
    }

    let mut delete = Chunk::new(
      &chunk.resource,
      "absent",
      &format!("{}{RECREATE_DELETE_SUFFIX}", chunk.decl_id),
      &chunk.sls,
    );
    delete.name = chunk.name.clone();
    delete.resource_id = chunk.resource_id.clone();
    delete.recreation_flow = true;

    if policy.create_before_destroy {
      // The current chunk proceeds as the create of the replacement; the
      // delete waits for it and for everything depending on it.
      chunk.resource_id = None;
      chunk.recreation_flow = true;
      for dependent in dependents_of(low, &chunk.decl_id) {
        delete.requisites.push(crate::chunk::Requisite {
          keyword: "require".to_string(),
          resource: Some(dependent.resource.clone()),
          decl_id: Some(dependent.decl_id.clone()),
          args: None,
        });
      }
      delete.requisites.push(crate::chunk::Requisite {
        keyword: "require".to_string(),
        resource: Some(chunk.resource.clone()),
        decl_id: Some(chunk.decl_id.clone()),
        args: None,
      });
      pending.push(delete);
    } else {
      // Delete first, then a create clone under the original identity so
      // dependents still sequence against the same tag.
      let mut create = chunk.clone();
      create.resource_id = None;
      create.recreation_flow = true;
      create.requisites.push(crate::chunk::Requisite {
        keyword: "require".to_string(),
        resource: Some(delete.resource.clone()),
        decl_id: Some(delete.decl_id.clone()),
        args: None,
      });

      chunk.halt_current_execution = true;
      pending.push(delete);
      pending.push(create);
    }
    Ok(())
  }
}

struct RecreatePolicy {
  watched: Option<Vec<String>>,
  create_before_destroy: bool,
}

impl RecreatePolicy {
  fn from_chunk(chunk: &Chunk) -> Result<Self, RequisiteError> {
    let mut watched = None;
    let mut create_before_destroy = false;

    for req in chunk.requisites_for("recreate_on_update") {
      match &req.args {
        None | Some(Value::Bool(true)) | Some(Value::Null) => {}
        Some(Value::Array(keys)) => watched = Some(string_list(chunk, keys)?),
        Some(Value::Object(options)) => {
          if let Some(Value::Array(keys)) = options.get("params") {
            watched = Some(string_list(chunk, keys)?);
          }
          if let Some(Value::Bool(flag)) = options.get("create_before_destroy") {
            create_before_destroy = *flag;
          }
        }
        Some(other) => {
          return Err(RequisiteError::Invalid(format!(
            "recreate_on_update on '{}' takes a key list or options mapping, got {other}",
            chunk.tag()
          )));
        }
      }
    }

    Ok(Self {
      watched,
      create_before_destroy,
    })
  }

  /// Whether any watched parameter differs from the previously enforced
  /// state. Without an allow-list, every declared parameter is watched.
  fn differs(&self, params: &Params, prior: &Value) -> bool {
    let keys: Vec<&String> = match &self.watched {
      Some(watched) => watched.iter().collect(),
      None => params.keys().collect(),
    };
    keys.into_iter().any(|key| params.get(key) != prior.get(key.as_str()))
  }
}

fn string_list(chunk: &Chunk, keys: &[Value]) -> Result<Vec<String>, RequisiteError> {
  keys
    .iter()
    .map(|k| {
      k.as_str().map(str::to_string).ok_or_else(|| {
        RequisiteError::Invalid(format!(
          "recreate_on_update key list on '{}' must contain strings",
          chunk.tag()
        ))
      })
    })
    .collect()
}

/// Chunks whose requisites target the given declaration.
fn dependents_of<'a>(low: &'a [Chunk], decl_id: &str) -> Vec<&'a Chunk> {
  low
    .iter()
    .filter(|c| {
      c.requisites
        .iter()
        .any(|r| r.decl_id.as_deref() == Some(decl_id))
    })
    .collect()
}
