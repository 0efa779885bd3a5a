//! Resource plugin surface: the polymorphic unit the runtime dispatches into.
//!
//! Concrete provider plugins (cloud APIs, SSH-managed hosts) live outside the
//! engine; they are injected through the [`crate::registry::Registry`]
//! capability table. The engine ships one built-in plugin, [`TestResource`],
//! which succeeds without side effects and is useful for exercising the
//! pipeline and for plans that only validate ordering.

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::chunk::{ChunkResult, JsonMap, Params};

/// Per-operation execution context supplied to every plugin invocation.
#[derive(Debug, Clone)]
pub struct OpContext {
  /// Name of the owning run.
  pub run_name: String,

  /// Dry-run flag: plugins must not mutate anything when set, and report
  /// would-be changes instead.
  pub test: bool,
}

impl OpContext {
  pub fn new(run_name: impl Into<String>, test: bool) -> Self {
    Self {
      run_name: run_name.into(),
      test,
    }
  }
}

#[derive(Debug, Error)]
pub enum PluginError {
  #[error("resource '{resource}' has no function '{func}'")]
  UnsupportedFunction { resource: String, func: String },

  #[error("{0}")]
  Other(String),
}

/// A resource plugin: create/read/update/delete wrapper around one
/// resource-type. Internal failures should be returned as `Err`; the runtime
/// converts them into `{result: false, comment}` records so the run can
/// continue past partial failure.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
  /// The resource-type this plugin owns, e.g. `cloud.instance`.
  fn resource_type(&self) -> &str;

  /// Ensure the named resource exists with the given parameters.
  async fn present(&self, ctx: &OpContext, name: &str, params: &Params) -> Result<ChunkResult, PluginError>;

  /// Ensure the named resource does not exist.
  async fn absent(&self, ctx: &OpContext, name: &str, params: &Params) -> Result<ChunkResult, PluginError>;

  /// Enumerate existing resources as present-style declarations keyed by a
  /// stable resource identifier, suitable for round-tripping into future
  /// applies.
  async fn describe(&self, _ctx: &OpContext) -> Result<JsonMap, PluginError> {
    Ok(JsonMap::new())
  }

  /// Dispatch by function name. Plugins with extra verbs can override this.
  async fn call(&self, ctx: &OpContext, func: &str, name: &str, params: &Params) -> Result<ChunkResult, PluginError> {
    match func {
      "present" => self.present(ctx, name, params).await,
      "absent" => self.absent(ctx, name, params).await,
      _ => Err(PluginError::UnsupportedFunction {
        resource: self.resource_type().to_string(),
        func: func.to_string(),
      }),
    }
  }
}

/// Built-in no-op resource for pipeline exercises and plans.
///
/// `present` succeeds and records the parameters as `new_state`; `absent`
/// succeeds with no state; the extra `fail` verb always fails, which makes
/// failure-propagation paths testable from documents.
pub struct TestResource;

#[async_trait]
impl ResourcePlugin for TestResource {
  fn resource_type(&self) -> &str {
    "test"
  }

  async fn present(&self, ctx: &OpContext, name: &str, params: &Params) -> Result<ChunkResult, PluginError> {
    let mut state = params.clone();
    state.insert("name".to_string(), json!(name));
    state.entry("resource_id".to_string()).or_insert(json!(name));

    let result = if ctx.test {
      ChunkResult::success(format!("test resource '{name}' would be created"))
        .with_changes(json!({"new": Value::Object(state.clone())}))
    } else {
      ChunkResult::success(format!("test resource '{name}' is present"))
        .with_changes(json!({"new": Value::Object(state.clone())}))
    };
    Ok(result.with_new_state(Value::Object(state)))
  }

  async fn absent(&self, _ctx: &OpContext, name: &str, _params: &Params) -> Result<ChunkResult, PluginError> {
    Ok(ChunkResult::success(format!("test resource '{name}' is absent")))
  }

  async fn call(&self, ctx: &OpContext, func: &str, name: &str, params: &Params) -> Result<ChunkResult, PluginError> {
    match func {
      "present" => self.present(ctx, name, params).await,
      "absent" => self.absent(ctx, name, params).await,
      "nop" => Ok(ChunkResult::success(format!("test resource '{name}' untouched"))),
      "fail" => Ok(ChunkResult::failure(format!("test resource '{name}' failed on request"))),
      _ => Err(PluginError::UnsupportedFunction {
        resource: "test".to_string(),
        func: func.to_string(),
      }),
    }
  }
}
