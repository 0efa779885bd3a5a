//! High-to-low compilation: flattening the declarative tree into the
//! executable chunk list.
//!
//! Compilation never aborts the run; malformed declarations are reported as
//! collection errors and skipped, so one bad declaration does not mask
//! diagnostics for the rest of the tree.

use serde_json::Value;
use tracing::debug;

use crate::chunk::{Chunk, REQUISITE_KEYWORDS, Requisite};
use crate::render::decls::SLS_KEY;
use crate::run::HighData;

/// Compile the declarative tree into chunks, preserving declaration order.
pub fn compile_high(high: &HighData) -> (Vec<Chunk>, Vec<String>) {
  let mut low = Vec::new();
  let mut errors = Vec::new();

  for (decl_id, body) in high {
    if decl_id.starts_with("__") {
      continue;
    }
    match compile_decl(decl_id, body) {
      Ok(chunk) => low.push(chunk),
      Err(e) => errors.push(e),
    }
  }

  debug!(chunks = low.len(), errors = errors.len(), "compiled high data");
  (low, errors)
}

/// Compile one declaration. Exactly one resource entry and exactly one
/// function fragment are required.
fn compile_decl(decl_id: &str, body: &Value) -> Result<Chunk, String> {
  let Value::Object(map) = body else {
    return Err(format!("declaration '{decl_id}' is not a mapping"));
  };

  let sls = map.get(SLS_KEY).and_then(Value::as_str).unwrap_or("<unknown>");

  let mut entries = map.iter().filter(|(k, _)| !k.starts_with("__"));
  let Some((resource, frags)) = entries.next() else {
    return Err(format!("declaration '{decl_id}' names no resource"));
  };
  if let Some((extra, _)) = entries.next() {
    return Err(format!(
      "declaration '{decl_id}' names multiple resources ('{resource}', '{extra}'); split it into one declaration per resource"
    ));
  }

  let Value::Array(frags) = frags else {
    return Err(format!("declaration '{decl_id}' resource '{resource}' body is not a fragment list"));
  };

  let mut func = None;
  let mut chunk = Chunk::new(resource, "", decl_id, sls);

  for frag in frags {
    match frag {
      Value::String(candidate) => {
        if let Some(prev) = &func {
          return Err(format!(
            "declaration '{decl_id}' has multiple functions ('{prev}', '{candidate}')"
          ));
        }
        func = Some(candidate.clone());
      }
      Value::Object(entry) if entry.len() == 1 => {
        let (key, value) = entry.iter().next().ok_or_else(|| {
          format!("declaration '{decl_id}' has an empty fragment")
        })?;
        if REQUISITE_KEYWORDS.contains(&key.as_str()) {
          parse_requisites(decl_id, key, value, &mut chunk.requisites)?;
        } else {
          chunk.params.insert(key.clone(), value.clone());
        }
      }
      other => {
        return Err(format!(
          "declaration '{decl_id}' fragment must be a function name or single-key mapping, got {other}"
        ));
      }
    }
  }

  let Some(func) = func else {
    return Err(format!("declaration '{decl_id}' resource '{resource}' names no function"));
  };
  chunk.func = func;

  match chunk.params.remove("name") {
    Some(Value::String(name)) => chunk.name = name,
    Some(other) => return Err(format!("declaration '{decl_id}': name must be a string, got {other}")),
    None => {}
  }

  Ok(chunk)
}

/// Parse one requisite fragment into directives.
///
/// Cross-declaration keywords take a list of targets, each either a bare
/// declaration-id, `{resource: decl_id}`, or `{resource: {decl_id: args}}`.
/// `recreate_on_update` is self-directed: its payload becomes the args of a
/// single target-less directive.
fn parse_requisites(decl_id: &str, keyword: &str, value: &Value, out: &mut Vec<Requisite>) -> Result<(), String> {
  if keyword == "recreate_on_update" {
    out.push(Requisite {
      keyword: keyword.to_string(),
      resource: None,
      decl_id: None,
      args: Some(value.clone()),
    });
    return Ok(());
  }

  let Value::Array(targets) = value else {
    return Err(format!("declaration '{decl_id}': {keyword} must be a list of targets"));
  };

  for target in targets {
    match target {
      Value::String(target_id) => out.push(Requisite {
        keyword: keyword.to_string(),
        resource: None,
        decl_id: Some(target_id.clone()),
        args: None,
      }),
      Value::Object(entry) if entry.len() == 1 => {
        let (resource, inner) = entry
          .iter()
          .next()
          .ok_or_else(|| format!("declaration '{decl_id}': empty {keyword} target"))?;
        match inner {
          Value::String(target_id) => out.push(Requisite {
            keyword: keyword.to_string(),
            resource: Some(resource.clone()),
            decl_id: Some(target_id.clone()),
            args: None,
          }),
          Value::Object(qualified) if qualified.len() == 1 => {
            let (target_id, args) = qualified
              .iter()
              .next()
              .ok_or_else(|| format!("declaration '{decl_id}': empty {keyword} target"))?;
            out.push(Requisite {
              keyword: keyword.to_string(),
              resource: Some(resource.clone()),
              decl_id: Some(target_id.clone()),
              args: Some(args.clone()),
            });
          }
          other => {
            return Err(format!(
              "declaration '{decl_id}': {keyword} target under '{resource}' must be a declaration-id or {{decl: args}}, got {other}"
            ));
          }
        }
      }
      other => {
        return Err(format!(
          "declaration '{decl_id}': {keyword} target must be a declaration-id or single-key mapping, got {other}"
        ));
      }
    }
  }
  Ok(())
}
