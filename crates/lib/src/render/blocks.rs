//! Render units ("blocks") and the renderer collaborator surface.
//!
//! A document renders into one or more blocks. The first block is the
//! implicit main block and is always rendered; later blocks carry a
//! `__check__` mapping whose keywords select [`RenderCheck`] plugins. A block
//! is rendered only if ALL of its checks pass; a named block with no checks,
//! or one naming a keyword with no registered plugin, is rejected.

use serde::Deserialize;
use serde_json::Value;

use crate::run::RunContext;

use super::RenderError;

/// Reserved block key holding the render-time check mapping.
pub const CHECK_KEY: &str = "__check__";

/// Reserved block key holding an optional block name.
pub const BLOCK_NAME_KEY: &str = "__block__";

/// One named render unit inside a document.
#[derive(Debug, Clone)]
pub struct Block {
  pub name: Option<String>,

  /// The implicit first block of a document; always clear.
  pub main: bool,

  /// (keyword, condition) pairs gating this block.
  pub checks: Vec<(String, Value)>,

  /// Declaration tree contributed by this block.
  pub body: Value,
}

/// Renderer collaborator: raw document bytes -> blocks.
pub trait Render: Send + Sync {
  fn name(&self) -> &'static str;

  /// Returns an empty vec when the document is empty after rendering.
  fn render(&self, refr: &str, content: &[u8]) -> Result<Vec<Block>, RenderError>;
}

/// Render-time requisite check, keyed by the keyword it owns.
pub trait RenderCheck: Send + Sync {
  fn keyword(&self) -> &'static str;

  fn clear(&self, run: &RunContext, condition: &Value) -> Result<bool, RenderError>;
}

/// Default renderer: multi-document YAML.
///
/// The first YAML document is the main block. Subsequent documents must be
/// mappings and may carry `__check__` and `__block__` keys; the remaining
/// keys form the block body.
pub struct YamlRenderer;

impl Render for YamlRenderer {
  fn name(&self) -> &'static str {
    "yaml"
  }

  fn render(&self, refr: &str, content: &[u8]) -> Result<Vec<Block>, RenderError> {
    let mut blocks = Vec::new();

    for document in serde_yaml::Deserializer::from_slice(content) {
      let value = Value::deserialize(document).map_err(|e| RenderError::Parse {
        refr: refr.to_string(),
        detail: e.to_string(),
      })?;

      if value.is_null() {
        continue;
      }

      if blocks.is_empty() {
        blocks.push(Block {
          name: None,
          main: true,
          checks: Vec::new(),
          body: value,
        });
        continue;
      }

      let Value::Object(mut body) = value else {
        return Err(RenderError::Parse {
          refr: refr.to_string(),
          detail: "secondary block did not render to a mapping".to_string(),
        });
      };

      let name = body
        .remove(BLOCK_NAME_KEY)
        .and_then(|v| v.as_str().map(str::to_string));
      let checks = match body.remove(CHECK_KEY) {
        Some(Value::Object(map)) => map.into_iter().collect(),
        Some(_) => {
          return Err(RenderError::Parse {
            refr: refr.to_string(),
            detail: format!("{CHECK_KEY} must be a mapping of keyword to condition"),
          });
        }
        None => Vec::new(),
      };

      blocks.push(Block {
        name,
        main: false,
        checks,
        body: Value::Object(body),
      });
    }

    Ok(blocks)
  }
}

/// Built-in check: every key of the condition mapping must equal the
/// corresponding layered parameter value.
pub struct ParamsCheck;

impl RenderCheck for ParamsCheck {
  fn keyword(&self) -> &'static str {
    "params"
  }

  fn clear(&self, run: &RunContext, condition: &Value) -> Result<bool, RenderError> {
    let Value::Object(wanted) = condition else {
      return Ok(false);
    };
    Ok(wanted.iter().all(|(key, expected)| run.param(key) == Some(expected)))
  }
}

/// Decide whether a block should be rendered. A block with no matching checks
/// is not-clear; check failures are recorded as collection errors.
pub fn block_clear(run: &mut RunContext, lookup: impl Fn(&str) -> Option<std::sync::Arc<dyn RenderCheck>>, block: &Block) -> bool {
  if block.main {
    return true;
  }
  if block.checks.is_empty() {
    return false;
  }

  let mut clear = true;
  for (keyword, condition) in &block.checks {
    let Some(check) = lookup(keyword) else {
      clear = false;
      continue;
    };
    match check.clear(run, condition) {
      Ok(true) => {}
      Ok(false) => clear = false,
      Err(e) => {
        run.error(format!("render check '{keyword}' failed: {e}"));
        clear = false;
      }
    }
  }
  clear
}
