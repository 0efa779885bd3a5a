//! Post-render resolve chain: document-level rewrites applied after a
//! document renders and before its declarations are normalized.
//!
//! Resolve plugins run in registration order, repeatedly, until a full pass
//! leaves the document untouched. The built-ins handle `include` directives
//! (turning them into further documents to gather) and `params` extraction
//! plus `${params:key}` substitution.

use serde_json::Value;

use crate::chunk::JsonMap;
use crate::run::RunContext;
use crate::source::refpath;

use super::RenderError;

/// Result of one plugin pass over one document.
#[derive(Debug, PartialEq)]
pub enum ResolveOutcome {
  /// Nothing to do.
  Clean,

  /// The document was rewritten in place; the chain runs again.
  Changed,

  /// The document referenced other documents that must be gathered.
  Unresolved(Vec<String>),
}

/// A document-level rewrite pass.
pub trait Resolve: Send + Sync {
  fn name(&self) -> &'static str;

  fn apply(&self, run: &mut RunContext, refr: &str, state: &mut JsonMap) -> Result<ResolveOutcome, RenderError>;
}

/// Handles the top-level `include` key: a list of document refs to pull into
/// the run. Slash-form refs are normalized to the canonical dotted form.
pub struct IncludeResolve;

impl Resolve for IncludeResolve {
  fn name(&self) -> &'static str {
    "include"
  }

  fn apply(&self, run: &mut RunContext, refr: &str, state: &mut JsonMap) -> Result<ResolveOutcome, RenderError> {
    let Some(value) = state.remove("include") else {
      return Ok(ResolveOutcome::Clean);
    };

    let Value::Array(entries) = value else {
      run.error(format!("'{refr}': include must be a list of sls refs"));
      return Ok(ResolveOutcome::Changed);
    };

    let mut refs = Vec::with_capacity(entries.len());
    for entry in entries {
      match entry {
        Value::String(s) => refs.push(refpath::normalize(&s)),
        other => run.error(format!("'{refr}': include entries must be strings, got {other}")),
      }
    }

    if refs.is_empty() {
      Ok(ResolveOutcome::Changed)
    } else {
      Ok(ResolveOutcome::Unresolved(refs))
    }
  }
}

/// Extracts the top-level `params` mapping into the run's layered parameter
/// sources and substitutes `${params:key}` references in string values.
pub struct ParamsResolve;

impl Resolve for ParamsResolve {
  fn name(&self) -> &'static str {
    "params"
  }

  fn apply(&self, run: &mut RunContext, refr: &str, state: &mut JsonMap) -> Result<ResolveOutcome, RenderError> {
    let mut changed = false;

    if let Some(value) = state.remove("params") {
      match value {
        Value::Object(map) => {
          run.set_param_source(refr, map);
          changed = true;
        }
        _ => run.error(format!("'{refr}': params must be a mapping")),
      }
    }

    let mut missing = Vec::new();
    for (_, value) in state.iter_mut() {
      changed |= substitute_params(run, value, &mut missing);
    }
    for key in missing {
      run.error(format!("'{refr}': unknown parameter '{key}'"));
    }

    if changed {
      Ok(ResolveOutcome::Changed)
    } else {
      Ok(ResolveOutcome::Clean)
    }
  }
}

const PARAM_OPEN: &str = "${params:";

/// Rewrite `${params:key}` references in place. A string that is exactly one
/// reference takes the parameter's value with its type preserved; embedded
/// references stringify. Unknown keys are collected and left untouched.
fn substitute_params(run: &RunContext, value: &mut Value, missing: &mut Vec<String>) -> bool {
  match value {
    Value::String(s) => {
      if !s.contains(PARAM_OPEN) {
        return false;
      }

      // Whole-string form: type-preserving.
      if let Some(inner) = s.strip_prefix(PARAM_OPEN).and_then(|r| r.strip_suffix('}'))
        && !inner.contains('}')
      {
        return match run.param(inner) {
          Some(v) => {
            *value = v.clone();
            true
          }
          None => {
            missing.push(inner.to_string());
            false
          }
        };
      }

      let mut out = String::with_capacity(s.len());
      let mut rest = s.as_str();
      let mut changed = false;
      while let Some(at) = rest.find(PARAM_OPEN) {
        out.push_str(&rest[..at]);
        let tail = &rest[at + PARAM_OPEN.len()..];
        let Some(end) = tail.find('}') else {
          out.push_str(&rest[at..]);
          rest = "";
          break;
        };
        let key = &tail[..end];
        match run.param(key) {
          Some(Value::String(v)) => out.push_str(v),
          Some(v) => out.push_str(&v.to_string()),
          None => {
            missing.push(key.to_string());
            out.push_str(&rest[at..at + PARAM_OPEN.len() + end + 1]);
            rest = &tail[end + 1..];
            continue;
          }
        }
        changed = true;
        rest = &tail[end + 1..];
      }
      out.push_str(rest);
      if changed {
        *value = Value::String(out);
      }
      changed
    }
    Value::Array(items) => {
      let mut changed = false;
      for item in items {
        changed |= substitute_params(run, item, missing);
      }
      changed
    }
    Value::Object(map) => {
      let mut changed = false;
      for (_, v) in map.iter_mut() {
        changed |= substitute_params(run, v, missing);
      }
      changed
    }
    _ => false,
  }
}
