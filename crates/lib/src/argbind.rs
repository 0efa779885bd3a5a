//! Parsing and resolution of `${resource:decl:path}` cross-chunk references.
//!
//! The string template form is part of the external document format; it is
//! parsed once into a small typed AST ([`BindRef`]) instead of being re-parsed
//! on every lookup. The attribute path is colon-delimited; list positions are
//! written `[n]`, and `[*]` maps the remaining path over every element.
//! Escaped brackets (`\[`, `\]`) stay literal key characters.
//!
//! # Escaping
//!
//! `$${` produces a literal `${` in the output; single `$` characters pass
//! through unchanged.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::chunk::Params;

/// One step of an attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
  /// Map key lookup.
  Key(String),
  /// List index lookup.
  Index(usize),
  /// Map the remaining path over every list element.
  Wildcard,
}

impl fmt::Display for PathSeg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PathSeg::Key(k) => write!(f, "{k}"),
      PathSeg::Index(i) => write!(f, "[{i}]"),
      PathSeg::Wildcard => write!(f, "[*]"),
    }
  }
}

/// A parsed `${resource:decl:path}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRef {
  pub resource: String,
  pub decl_id: String,
  pub path: Vec<PathSeg>,
}

impl fmt::Display for BindRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "${{{}:{}", self.resource, self.decl_id)?;
    for seg in &self.path {
      match seg {
        PathSeg::Key(k) => write!(f, ":{k}")?,
        PathSeg::Index(_) | PathSeg::Wildcard => write!(f, "{seg}")?,
      }
    }
    write!(f, "}}")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgBindError {
  #[error("malformed arg_bind reference '{0}': expected ${{resource:decl:path}}")]
  Malformed(String),

  #[error("unclosed arg_bind reference starting at '{0}'")]
  Unclosed(String),

  #[error("invalid index '{index}' in arg_bind reference '{refr}'")]
  BadIndex { refr: String, index: String },

  #[error("cannot resolve {refr}: '{key}' is not present in the referenced new_state")]
  MissingKey { refr: String, key: String },

  #[error("cannot resolve {refr}: referenced chunk has not recorded a new_state")]
  NoState { refr: String },

  #[error("cannot resolve {refr}: no chunk matches the referenced declaration")]
  NoTarget { refr: String },

  #[error("cannot resolve {refr}: {detail}")]
  BadShape { refr: String, detail: String },
}

/// Parse the inner content of a reference (`resource:decl:path...`).
pub fn parse(inner: &str) -> Result<BindRef, ArgBindError> {
  let mut parts = inner.splitn(3, ':');
  let resource = parts.next().unwrap_or_default();
  let decl_id = parts.next().ok_or_else(|| ArgBindError::Malformed(inner.to_string()))?;
  let path_str = parts.next().ok_or_else(|| ArgBindError::Malformed(inner.to_string()))?;

  if resource.is_empty() || decl_id.is_empty() || path_str.is_empty() {
    return Err(ArgBindError::Malformed(inner.to_string()));
  }

  Ok(BindRef {
    resource: resource.to_string(),
    decl_id: decl_id.to_string(),
    path: parse_path(path_str)?,
  })
}

/// Parse a colon-delimited attribute path with `[n]`/`[*]` index suffixes.
pub fn parse_path(path: &str) -> Result<Vec<PathSeg>, ArgBindError> {
  let mut segs = Vec::new();

  for part in path.split(':') {
    parse_segment(path, part, &mut segs)?;
  }

  Ok(segs)
}

fn parse_segment(refr: &str, part: &str, out: &mut Vec<PathSeg>) -> Result<(), ArgBindError> {
  let mut key = String::new();
  let mut chars = part.chars().peekable();

  while let Some(ch) = chars.next() {
    match ch {
      '\\' => match chars.next() {
        Some(c @ ('[' | ']')) => key.push(c),
        Some(c) => {
          key.push('\\');
          key.push(c);
        }
        None => key.push('\\'),
      },
      '[' => {
        if !key.is_empty() {
          out.push(PathSeg::Key(std::mem::take(&mut key)));
        }
        let mut index = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
          if c == ']' {
            closed = true;
            break;
          }
          index.push(c);
        }
        if !closed {
          return Err(ArgBindError::Unclosed(refr.to_string()));
        }
        if index == "*" {
          out.push(PathSeg::Wildcard);
        } else {
          let idx = index.parse::<usize>().map_err(|_| ArgBindError::BadIndex {
            refr: refr.to_string(),
            index,
          })?;
          out.push(PathSeg::Index(idx));
        }
      }
      _ => key.push(ch),
    }
  }

  if !key.is_empty() {
    out.push(PathSeg::Key(key));
  }
  Ok(())
}

/// Walk an attribute path through a state value. Wildcards map the remaining
/// path over every list element, producing an array of results.
pub fn resolve(refr: &BindRef, state: &Value, path: &[PathSeg]) -> Result<Value, ArgBindError> {
  let Some((seg, rest)) = path.split_first() else {
    return Ok(state.clone());
  };

  match seg {
    PathSeg::Key(key) => {
      let inner = state.get(key.as_str()).ok_or_else(|| ArgBindError::MissingKey {
        refr: refr.to_string(),
        key: key.clone(),
      })?;
      resolve(refr, inner, rest)
    }
    PathSeg::Index(idx) => {
      let inner = state.get(idx).ok_or_else(|| ArgBindError::MissingKey {
        refr: refr.to_string(),
        key: format!("[{idx}]"),
      })?;
      resolve(refr, inner, rest)
    }
    PathSeg::Wildcard => {
      let items = state.as_array().ok_or_else(|| ArgBindError::BadShape {
        refr: refr.to_string(),
        detail: "wildcard index applied to a non-list value".to_string(),
      })?;
      let mut mapped = Vec::with_capacity(items.len());
      for item in items {
        mapped.push(resolve(refr, item, rest)?);
      }
      Ok(Value::Array(mapped))
    }
  }
}

/// Write a value into `target` at the given path, creating intermediate maps
/// and extending lists as needed. A wildcard writes to every existing element.
pub fn write(target: &mut Value, path: &[PathSeg], value: Value) -> Result<(), ArgBindError> {
  let Some((seg, rest)) = path.split_first() else {
    *target = value;
    return Ok(());
  };

  match seg {
    PathSeg::Key(key) => {
      if !target.is_object() {
        *target = Value::Object(Params::new());
      }
      match target.as_object_mut() {
        Some(map) => write(map.entry(key.clone()).or_insert(Value::Null), rest, value),
        None => Ok(()),
      }
    }
    PathSeg::Index(idx) => {
      if !target.is_array() {
        *target = Value::Array(Vec::new());
      }
      match target.as_array_mut() {
        Some(list) => {
          while list.len() <= *idx {
            list.push(Value::Null);
          }
          write(&mut list[*idx], rest, value)
        }
        None => Ok(()),
      }
    }
    PathSeg::Wildcard => {
      let list = target.as_array_mut().ok_or(ArgBindError::BadShape {
        refr: "<write path>".to_string(),
        detail: "wildcard write applied to a non-list value".to_string(),
      })?;
      for item in list {
        write(item, rest, value.clone())?;
      }
      Ok(())
    }
  }
}

/// Placeholder substituted for missing data when planning in test mode.
pub fn test_placeholder(refr: &BindRef) -> String {
  let key = refr
    .path
    .iter()
    .rev()
    .find_map(|seg| match seg {
      PathSeg::Key(k) => Some(k.clone()),
      _ => None,
    })
    .unwrap_or_else(|| refr.decl_id.clone());
  format!("{key}_value_known_after_applying")
}

/// Substitute every `${...}` reference in `input` using the provided lookup.
///
/// When the whole string is a single reference, the resolved value is returned
/// verbatim (type-preserving); otherwise resolved values are stringified
/// inline. `$${` escapes to a literal `${`.
pub fn substitute_str<F>(input: &str, lookup: &mut F) -> Result<Value, ArgBindError>
where
  F: FnMut(&BindRef) -> Result<Value, ArgBindError>,
{
  let mut out = String::new();
  let mut rest = input;
  let mut single: Option<Value> = None;
  let mut pieces = 0usize;

  while let Some(start) = rest.find('$') {
    let (before, from_dollar) = rest.split_at(start);
    out.push_str(before);
    if !before.is_empty() {
      pieces += 1;
    }

    if let Some(stripped) = from_dollar.strip_prefix("$${") {
      // Escaped literal "${".
      out.push_str("${");
      pieces += 1;
      rest = stripped;
      continue;
    }

    if let Some(stripped) = from_dollar.strip_prefix("${") {
      let end = stripped.find('}').ok_or_else(|| ArgBindError::Unclosed(input.to_string()))?;
      let inner = &stripped[..end];
      let bind_ref = parse(inner)?;
      let value = lookup(&bind_ref)?;

      if pieces == 0 && stripped[end + 1..].is_empty() {
        single = Some(value.clone());
      }
      match &value {
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
      }
      pieces += 1;
      rest = &stripped[end + 1..];
      continue;
    }

    // Lone '$' passes through.
    out.push('$');
    pieces += 1;
    rest = &from_dollar[1..];
  }
  out.push_str(rest);

  if let Some(value) = single
    && rest.is_empty()
  {
    return Ok(value);
  }
  Ok(Value::String(out))
}

/// Recursively substitute references in every string of a JSON value.
pub fn substitute_value<F>(value: &mut Value, lookup: &mut F) -> Result<(), ArgBindError>
where
  F: FnMut(&BindRef) -> Result<Value, ArgBindError>,
{
  match value {
    Value::String(s) if s.contains("${") => {
      *value = substitute_str(s, lookup)?;
      Ok(())
    }
    Value::Array(items) => {
      for item in items {
        substitute_value(item, lookup)?;
      }
      Ok(())
    }
    Value::Object(map) => {
      for (_, item) in map.iter_mut() {
        substitute_value(item, lookup)?;
      }
      Ok(())
    }
    _ => Ok(()),
  }
}
