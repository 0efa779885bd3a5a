//! Document gathering: resolve refs to content, render blocks, run the
//! resolve chain, normalize declarations and merge everything into the run's
//! declarative tree.
//!
//! Gathering is a queue-driven loop because documents discover further
//! documents (`include`). A ref requested twice is consumed once, with the
//! later request winning the resolution-order slot. Collection errors are
//! aggregated on the run by default; hard-fail mode aborts on the first one.

pub mod blocks;
pub mod decls;
pub mod resolve;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::chunk::JsonMap;
use crate::registry::Registry;
use crate::run::RunContext;
use crate::source::{SourceError, SourceResolver};

use self::resolve::ResolveOutcome;

/// Upper bound on resolve-chain passes over one document. The built-in
/// plugins converge in two; this only guards misbehaving externals.
const RESOLVE_PASS_LIMIT: usize = 8;

#[derive(Debug, Error)]
pub enum RenderError {
  #[error(transparent)]
  Source(#[from] SourceError),

  #[error("failed to render '{refr}': {detail}")]
  Parse { refr: String, detail: String },

  #[error("no renderer registered for pipeline '{0}'")]
  NoRenderer(String),

  #[error("{0}")]
  Collection(String),
}

/// Gathering options.
#[derive(Debug, Clone)]
pub struct GatherOpts {
  /// Abort on the first collection error instead of aggregating.
  pub hard_fail: bool,

  /// Render pipeline name.
  pub pipeline: String,
}

impl Default for GatherOpts {
  fn default() -> Self {
    Self {
      hard_fail: false,
      pipeline: "yaml".to_string(),
    }
  }
}

/// Gather the given refs (and everything they include) into `run.high`.
pub fn gather(
  run: &mut RunContext,
  resolver: &mut SourceResolver,
  registry: &Registry,
  refs: &[String],
  opts: &GatherOpts,
) -> Result<(), RenderError> {
  let renderer = registry
    .renderer(&opts.pipeline)
    .ok_or_else(|| RenderError::NoRenderer(opts.pipeline.clone()))?;

  let mut queue: std::collections::VecDeque<String> = refs.iter().cloned().collect();

  while let Some(refr) = queue.pop_front() {
    run.touch_order(&refr);
    if !run.resolved.insert(refr.clone()) {
      debug!(refr, "sls ref already gathered");
      continue;
    }

    let source = match resolver.resolve(&refr) {
      Ok(source) => source,
      Err(e) => {
        let message = e.to_string();
        run.error(message.clone());
        if opts.hard_fail {
          return Err(RenderError::Collection(message));
        }
        continue;
      }
    };
    run.sls_refs.insert(refr.clone(), source.path.clone());

    let rendered = match renderer.render(&refr, &source.content) {
      Ok(rendered) => rendered,
      Err(e) => {
        run.error(e.to_string());
        if opts.hard_fail {
          return Err(e);
        }
        continue;
      }
    };

    // Process blocks in document order so a block's params are layered
    // before later blocks' checks are evaluated. Later blocks override
    // earlier ones key-by-key.
    let mut state = JsonMap::new();
    let mut discovered = Vec::new();
    for block in rendered {
      if !blocks::block_clear(run, |kw| registry.render_check(kw), &block) {
        debug!(refr, block = block.name.as_deref().unwrap_or("<unnamed>"), "block not clear, skipped");
        continue;
      }
      let Value::Object(mut body) = block.body else {
        run.error(format!("'{refr}': block did not render to a mapping"));
        continue;
      };

      // Resolve chain: rerun every plugin until a full pass changes nothing.
      for _ in 0..RESOLVE_PASS_LIMIT {
        let mut dirty = false;
        for plugin in registry.resolvers() {
          match plugin.apply(run, &refr, &mut body)? {
            ResolveOutcome::Clean => {}
            ResolveOutcome::Changed => dirty = true,
            ResolveOutcome::Unresolved(refs) => discovered.extend(refs),
          }
        }
        if !dirty {
          break;
        }
      }

      for (key, value) in body {
        state.insert(key, value);
      }
    }

    // Discovered refs are queued even when the document contributed no
    // declarations of its own (the include-only aggregator form).
    for next in discovered {
      queue.push_back(next);
    }

    if state.is_empty() {
      debug!(refr, "document empty after rendering");
      continue;
    }

    for error in decls::normalize_decls(&refr, &mut state) {
      run.error(error.clone());
      if opts.hard_fail {
        return Err(RenderError::Collection(error));
      }
    }

    run.rendered.insert(refr.clone(), Value::Object(state.clone()));
    merge_high(run, &refr, state, opts)?;
  }

  info!(
    run = %run.run_name,
    documents = run.resolved.len(),
    declarations = run.high.len(),
    errors = run.errors.len(),
    "gather complete"
  );
  Ok(())
}

/// Merge one normalized document into the run's declarative tree. A
/// declaration id claimed by two different documents is an error: the
/// existing declaration is removed and the new one is not merged, so neither
/// half-applies.
fn merge_high(run: &mut RunContext, refr: &str, state: JsonMap, opts: &GatherOpts) -> Result<(), RenderError> {
  for (decl_id, body) in state {
    if decl_id.starts_with("__") {
      continue;
    }

    if let Some(existing) = run.high.get(&decl_id) {
      let existing_sls = existing
        .get(decls::SLS_KEY)
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();
      let message =
        format!("declaration id '{decl_id}' is claimed by both '{existing_sls}' and '{refr}'");
      run.high.remove(&decl_id);
      run.error(message.clone());
      if opts.hard_fail {
        return Err(RenderError::Collection(message));
      }
      continue;
    }

    run.high.insert(decl_id, body);
  }
  Ok(())
}
