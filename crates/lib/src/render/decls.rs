//! Declaration normalization: canonicalizing the shorthand forms a rendered
//! document allows into the one shape compilation consumes.
//!
//! After normalization every declaration body is a mapping from resource-type
//! to a fragment list, annotated with the originating document ref under
//! `__sls__`. Keys starting with `__` are engine-reserved and skipped.

use serde_json::{Value, json};

use crate::chunk::JsonMap;

/// Reserved declaration key recording the originating document ref.
pub const SLS_KEY: &str = "__sls__";

/// Normalize every declaration in a rendered document, in place. Returns the
/// collection errors encountered; offending declarations are left out of the
/// normalized result.
pub fn normalize_decls(refr: &str, state: &mut JsonMap) -> Vec<String> {
  let mut errors = Vec::new();
  let mut drop = Vec::new();

  for (decl_id, body) in state.iter_mut() {
    if decl_id.starts_with("__") {
      continue;
    }
    if let Err(e) = normalize_one(refr, decl_id, body) {
      errors.push(e);
      drop.push(decl_id.clone());
    }
  }

  for decl_id in drop {
    state.remove(&decl_id);
  }
  errors
}

/// Canonicalize one declaration body.
///
/// Accepted input shapes:
///   - string shorthand: `id: sub.func` -> `{sub: [func]}`
///   - dotted keys: `sub.func: [frags]` -> `sub: [frags..., func]`
///   - canonical: `sub: [frags..., func]`
fn normalize_one(refr: &str, decl_id: &str, body: &mut Value) -> Result<(), String> {
  if let Value::String(shorthand) = body {
    let Some((resource, func)) = shorthand.rsplit_once('.') else {
      return Err(format!(
        "'{refr}': declaration '{decl_id}' shorthand '{shorthand}' is not of the form resource.func"
      ));
    };
    *body = json!({resource: [func]});
  }

  let Value::Object(map) = body else {
    return Err(format!("'{refr}': declaration '{decl_id}' must be a mapping or string shorthand"));
  };

  let mut normalized = JsonMap::new();
  for (key, value) in std::mem::take(map) {
    if key.starts_with("__") {
      normalized.insert(key, value);
      continue;
    }

    let (resource, func) = match key.rsplit_once('.') {
      Some((resource, func)) => (resource.to_string(), Some(func.to_string())),
      None => (key, None),
    };

    let mut frags = match value {
      Value::Array(items) => items,
      Value::Null => Vec::new(),
      other => {
        return Err(format!(
          "'{refr}': declaration '{decl_id}' resource '{resource}' body must be a fragment list, got {other}"
        ));
      }
    };
    if let Some(func) = func {
      frags.push(Value::String(func));
    }

    if normalized.contains_key(&resource) {
      return Err(format!(
        "'{refr}': declaration '{decl_id}' names resource '{resource}' more than once"
      ));
    }
    normalized.insert(resource, Value::Array(frags));
  }

  normalized.insert(SLS_KEY.to_string(), json!(refr));
  *body = Value::Object(normalized);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn state_from(value: Value) -> JsonMap {
    match value {
      Value::Object(map) => map,
      _ => panic!("not a mapping"),
    }
  }

  #[test]
  fn dotted_key_moves_func_into_fragment_list() {
    let mut state = state_from(json!({
      "web": {"test.present": [{"size": "small"}]},
    }));
    let errors = normalize_decls("site", &mut state);
    assert!(errors.is_empty());
    assert_eq!(
      state["web"],
      json!({"test": [{"size": "small"}, "present"], "__sls__": "site"})
    );
  }

  #[test]
  fn string_shorthand_expands() {
    let mut state = state_from(json!({"web": "test.present"}));
    let errors = normalize_decls("site", &mut state);
    assert!(errors.is_empty());
    assert_eq!(state["web"], json!({"test": ["present"], "__sls__": "site"}));
  }

  #[test]
  fn duplicate_resource_within_declaration_is_an_error() {
    let mut state = state_from(json!({
      "web": {"test.present": [], "test": ["absent"]},
    }));
    let errors = normalize_decls("site", &mut state);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("more than once"));
    assert!(!state.contains_key("web"));
  }

  #[test]
  fn reserved_keys_are_skipped() {
    let mut state = state_from(json!({
      "__extends__": {"anything": true},
      "web": {"test.present": []},
    }));
    let errors = normalize_decls("site", &mut state);
    assert!(errors.is_empty());
    assert_eq!(state["__extends__"], json!({"anything": true}));
  }

  #[test]
  fn malformed_shorthand_is_reported() {
    let mut state = state_from(json!({"web": "present"}));
    let errors = normalize_decls("site", &mut state);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("resource.func"));
  }
}
