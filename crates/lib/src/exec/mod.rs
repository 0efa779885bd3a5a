//! The execution runtime: wave-by-wave dispatch of ready chunks.
//!
//! Each iteration computes the pending view, runs requisite plugins on the
//! ready chunks, and dispatches what survives onto a bounded task set. Chunks
//! inside one wave have no ordering between them and run concurrently;
//! everything cross-wave is carried by the requisite rules. The loop ends
//! when the pending view drains, and the post-low addendum is absorbed
//! exactly once at that point.

pub mod apply;
pub mod report;
pub mod requisites;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkResult, ChunkTag};
use crate::compile;
use crate::esm::EsmContext;
use crate::registry::Registry;
use crate::render::{self, GatherOpts};
use crate::resource::OpContext;
use crate::run::RunContext;
use crate::seq::{self, Seq, SeqError};
use crate::source::SourceResolver;
use crate::tunnel::ConnectionPool;

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("run cancelled")]
  Cancelled,

  #[error(transparent)]
  Stalled(#[from] SeqError),
}

/// Cooperative cancellation handle, checked between waves.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Runtime options.
#[derive(Debug, Clone)]
pub struct ExecOpts {
  /// Maximum chunks in flight at once.
  pub parallelism: usize,

  pub cancel: CancelToken,
}

impl Default for ExecOpts {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
      cancel: CancelToken::new(),
    }
  }
}

/// Mid-run document gathering: refs queued on the run's `pending_refs` are
/// gathered and compiled between waves, so work discovered during execution
/// joins the pending list.
pub struct Reconcile<'a> {
  pub resolver: &'a mut SourceResolver,
  pub opts: GatherOpts,
}

/// Executes one run's chunk list to completion.
pub struct Runtime {
  registry: Arc<Registry>,
  pool: Arc<ConnectionPool>,
  opts: ExecOpts,
}

impl Runtime {
  pub fn new(registry: Arc<Registry>, opts: ExecOpts) -> Self {
    Self {
      registry,
      pool: Arc::new(ConnectionPool::new()),
      opts,
    }
  }

  /// The run-scoped tunnel pool, for plugins that hold connections.
  pub fn pool(&self) -> Arc<ConnectionPool> {
    self.pool.clone()
  }

  /// Drive the run until its pending view drains. Tunnels are torn down on
  /// every exit path, including cancellation and stalls.
  ///
  /// With an `esm` sink, every enforced-state update is written through to
  /// the scratch cache as it lands; with a `reconcile` environment, refs
  /// queued mid-run are gathered between waves.
  pub async fn run(
    &self,
    run: &mut RunContext,
    ctx: &OpContext,
    mut esm: Option<&mut EsmContext>,
    mut reconcile: Option<Reconcile<'_>>,
  ) -> Result<(), ExecError> {
    let mut prev_seq: Option<Seq> = None;
    let mut post_low_absorbed = false;

    loop {
      if self.opts.cancel.is_cancelled() {
        warn!(run = %run.run_name, "run cancelled, shutting down");
        self.pool.shutdown().await;
        return Err(ExecError::Cancelled);
      }

      if let Some(rec) = reconcile.as_mut() {
        self.reconcile(run, rec);
      }

      let seq = seq::compute(&run.low, &run.running, |kw| self.registry.has_requisite(kw));
      if seq.is_empty() {
        if !post_low_absorbed && !run.post_low.is_empty() {
          post_low_absorbed = true;
          let addendum = std::mem::take(&mut run.post_low);
          debug!(chunks = addendum.len(), "absorbing post-low addendum");
          run.low.extend(addendum);
          prev_seq = None;
          continue;
        }
        break;
      }

      if let Some(stall) = seq::detect_stall(prev_seq.as_ref(), &seq) {
        self.pool.shutdown().await;
        return Err(ExecError::Stalled(stall));
      }

      // Nothing ready: either everything left is behind a failure (finish,
      // report skipped) or the live entries are stuck on each other.
      if !seq.values().any(|e| e.ready()) {
        match seq::analyze_blocked(&seq) {
          seq::Blocked::AllDoomed => {
            if !post_low_absorbed && !run.post_low.is_empty() {
              post_low_absorbed = true;
              let addendum = std::mem::take(&mut run.post_low);
              run.low.extend(addendum);
              prev_seq = None;
              continue;
            }
            break;
          }
          seq::Blocked::Stuck(err) => {
            self.pool.shutdown().await;
            return Err(ExecError::Stalled(err));
          }
        }
      }

      // Requisite plugins run on each ready chunk in registration order; a
      // failing check records a failure result without dispatching.
      let mut pending: Vec<Chunk> = Vec::new();
      let mut wave: Vec<Chunk> = Vec::new();
      for (index, entry) in &seq {
        if !entry.ready() {
          continue;
        }
        let mut chunk = entry.chunk.clone();

        let mut check_error = None;
        for plugin in self.registry.requisites() {
          if chunk.requisites_for(plugin.keyword()).next().is_none() {
            continue;
          }
          if let Err(e) = plugin.check(ctx, &mut chunk, &run.running, &run.managed_state, &run.low, &mut pending) {
            check_error = Some(e);
            break;
          }
        }

        if let Some(e) = check_error {
          run
            .running
            .insert(chunk.tag(), ChunkResult::failure(format!("requisite check failed: {e}")));
          continue;
        }
        if chunk.halt_current_execution {
          run.low[*index].halt_current_execution = true;
          continue;
        }
        wave.push(chunk);
      }

      if !wave.is_empty() {
        self.dispatch_wave(run, ctx, wave, esm.as_deref_mut()).await;
      }
      run.low.append(&mut pending);
      prev_seq = Some(seq);
    }

    info!(run = %run.run_name, executed = run.running.len(), "execution drained");
    self.pool.shutdown().await;
    Ok(())
  }

  /// Absorb refs queued mid-run: gather them, re-compile the tree, and
  /// append the chunks not already in the low list.
  fn reconcile(&self, run: &mut RunContext, rec: &mut Reconcile<'_>) {
    let refs = std::mem::take(&mut run.pending_refs);
    if refs.is_empty() {
      return;
    }

    debug!(refs = refs.len(), "gathering refs queued mid-run");
    if let Err(e) = render::gather(run, rec.resolver, &self.registry, &refs, &rec.opts) {
      run.error(e.to_string());
      return;
    }

    let (chunks, errors) = compile::compile_high(&run.high);
    for error in errors {
      if !run.errors.contains(&error) {
        run.error(error);
      }
    }

    let known: HashSet<ChunkTag> = run.low.iter().map(Chunk::tag).collect();
    for chunk in chunks {
      if !known.contains(&chunk.tag()) {
        run.low.push(chunk);
      }
    }
  }

  /// Run one wave concurrently, bounded by the parallelism limit, and fold
  /// results into the run.
  async fn dispatch_wave(
    &self,
    run: &mut RunContext,
    ctx: &OpContext,
    wave: Vec<Chunk>,
    mut esm: Option<&mut EsmContext>,
  ) {
    let semaphore = Arc::new(Semaphore::new(self.opts.parallelism.max(1)));
    let mut tasks = JoinSet::new();

    for chunk in wave {
      let registry = self.registry.clone();
      let ctx = ctx.clone();
      let semaphore = semaphore.clone();
      tasks.spawn(async move {
        let _permit = semaphore.acquire_owned().await;
        let result = dispatch_chunk(&registry, &ctx, &chunk).await;
        (chunk, result)
      });
    }

    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((chunk, result)) => {
          if result.result && !ctx.test {
            apply_managed_delta(run, esm.as_deref_mut(), &chunk, &result);
          }
          run.running.insert(chunk.tag(), result);
        }
        Err(e) => run.error(format!("execution task failed: {e}")),
      }
    }
  }
}

/// Invoke the resource plugin for one chunk. Plugin errors become failure
/// results so the run can continue and report them.
async fn dispatch_chunk(registry: &Registry, ctx: &OpContext, chunk: &Chunk) -> ChunkResult {
  let Some(plugin) = registry.resource(&chunk.resource) else {
    return ChunkResult::failure(format!("no resource plugin registered for '{}'", chunk.resource));
  };

  let mut params = chunk.params.clone();
  if let Some(id) = &chunk.resource_id {
    params.insert("resource_id".to_string(), id.clone());
  }

  info!(tag = %chunk.tag(), func = %chunk.func, test = ctx.test, "executing chunk");
  match plugin.call(ctx, &chunk.func, &chunk.name, &params).await {
    Ok(result) => result,
    Err(e) => ChunkResult::failure(e.to_string()),
  }
}

/// Fold one successful operation into the run's managed state and write it
/// through the ESM scratch cache: `absent` retires the record, anything else
/// refreshes it. A scratch write failure does not fail the chunk; the final
/// commit still covers it.
fn apply_managed_delta(run: &mut RunContext, esm: Option<&mut EsmContext>, chunk: &Chunk, result: &ChunkResult) {
  let esm_tag = chunk.esm_tag();
  if chunk.func == "absent" {
    run.managed_state.remove(&esm_tag);
    if let Some(esm) = esm
      && let Err(e) = esm.remove(&esm_tag)
    {
      warn!(tag = %esm_tag, error = %e, "failed to write through enforced-state removal");
    }
    return;
  }

  let resource_id = result
    .new_state
    .as_ref()
    .and_then(|s| s.get("resource_id").cloned())
    .or_else(|| chunk.resource_id.clone())
    .unwrap_or(Value::Null);

  let record = json!({
    "resource_id": resource_id,
    "new_state": result.new_state.clone().unwrap_or(Value::Null),
  });
  run.managed_state.insert(esm_tag.clone(), record.clone());
  if let Some(esm) = esm
    && let Err(e) = esm.insert(esm_tag.clone(), record)
  {
    warn!(tag = %esm_tag, error = %e, "failed to write through enforced-state update");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chunk::{JsonMap, Requisite};
  use crate::esm::local::LocalBackend;
  use crate::esm::{self, EsmConfig};
  use crate::registry::Registry;
  use serde_json::json;
  use tempfile::TempDir;

  fn runtime() -> Runtime {
    Runtime::new(Arc::new(Registry::with_defaults()), ExecOpts::default())
  }

  fn chunk(decl_id: &str, func: &str) -> Chunk {
    Chunk::new("test", func, decl_id, "init")
  }

  fn requiring(decl_id: &str, target: &str) -> Chunk {
    let mut c = chunk(decl_id, "present");
    c.requisites.push(Requisite {
      keyword: "require".to_string(),
      resource: None,
      decl_id: Some(target.to_string()),
      args: None,
    });
    c
  }

  #[tokio::test]
  async fn executes_chunks_in_requisite_order() {
    let mut run = RunContext::new("t");
    run.low = vec![requiring("b", "a"), chunk("a", "present")];

    runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap();
    assert_eq!(run.running.len(), 2);
    assert!(run.running.values().all(|r| r.result));
    assert_eq!(run.managed_state.len(), 2);
  }

  #[tokio::test]
  async fn failed_dependency_leaves_dependent_pending() {
    let mut run = RunContext::new("t");
    run.low = vec![chunk("a", "fail"), requiring("b", "a")];

    runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap();
    assert_eq!(run.running.len(), 1);
    assert!(run.has_failures());
    assert!(!run.running.contains_key(&run.low[1].tag()));
  }

  #[tokio::test]
  async fn circular_requisites_stall_the_run() {
    let mut run = RunContext::new("t");
    run.low = vec![requiring("a", "b"), requiring("b", "a")];

    let err = runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap_err();
    assert!(matches!(err, ExecError::Stalled(SeqError::Circular { .. })));
  }

  #[tokio::test]
  async fn cancellation_stops_before_the_next_wave() {
    let opts = ExecOpts::default();
    opts.cancel.cancel();
    let runtime = Runtime::new(Arc::new(Registry::with_defaults()), opts);

    let mut run = RunContext::new("t");
    run.low = vec![chunk("a", "present")];

    let err = runtime.run(&mut run, &OpContext::new("t", false), None, None).await.unwrap_err();
    assert!(matches!(err, ExecError::Cancelled));
    assert!(run.running.is_empty());
  }

  #[tokio::test]
  async fn post_low_runs_after_the_main_body() {
    let mut run = RunContext::new("t");
    run.low = vec![chunk("a", "present")];
    run.post_low = vec![chunk("cleanup", "absent")];

    runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap();
    assert_eq!(run.running.len(), 2);
    assert!(run.post_low.is_empty());
  }

  #[tokio::test]
  async fn test_mode_leaves_managed_state_untouched() {
    let mut run = RunContext::new("t");
    run.low = vec![chunk("a", "present")];

    runtime().run(&mut run, &OpContext::new("t", true), None, None).await.unwrap();
    assert!(run.managed_state.is_empty());
    assert_eq!(run.running.len(), 1);
  }

  #[tokio::test]
  async fn absent_retires_the_managed_record() {
    let mut run = RunContext::new("t");
    run
      .managed_state
      .insert("test|a|a".to_string(), json!({"resource_id": "x"}));
    run.low = vec![chunk("a", "absent")];

    runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap();
    assert!(run.managed_state.is_empty());
  }

  #[tokio::test]
  async fn successful_chunks_write_through_to_the_scratch_cache() {
    let tmp = TempDir::new().unwrap();
    let config = EsmConfig {
      backend: "local".to_string(),
      run_name: "t".to_string(),
      cache_dir: tmp.path().to_path_buf(),
      upgrade: false,
      keep_cache: false,
    };
    let mut esm = esm::context(&LocalBackend, &[], &config).await.unwrap();

    let mut run = RunContext::new("t");
    run.managed_state = esm.records().clone();
    run.low = vec![chunk("a", "present")];

    runtime()
      .run(&mut run, &OpContext::new("t", false), Some(&mut esm), None)
      .await
      .unwrap();

    // The record landed on disk before the session exits.
    assert!(esm.get("test|a|a").is_some());
    let scratch: JsonMap =
      serde_json::from_slice(&std::fs::read(tmp.path().join("t.scratch.json")).unwrap()).unwrap();
    assert!(scratch.contains_key("test|a|a"));
    esm.exit(false).await.unwrap();
  }

  #[tokio::test]
  async fn queued_refs_are_gathered_mid_run() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("extra.sls"), "late:\n  test.present: []\n").unwrap();
    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);

    let mut run = RunContext::new("t");
    run.low = vec![chunk("a", "present")];
    run.pending_refs.push("extra".to_string());

    let reconcile = Reconcile {
      resolver: &mut resolver,
      opts: GatherOpts::default(),
    };
    runtime()
      .run(&mut run, &OpContext::new("t", false), None, Some(reconcile))
      .await
      .unwrap();

    assert!(run.errors.is_empty(), "errors: {:?}", run.errors);
    assert!(run.high.contains_key("late"));
    assert_eq!(run.running.len(), 2);
    assert!(run.pending_refs.is_empty());
  }

  #[tokio::test]
  async fn recreate_synthesizes_and_executes_replacement_pair() {
    let mut run = RunContext::new("t");
    run.managed_state.insert(
      "test|web|web".to_string(),
      json!({"resource_id": "i-old", "new_state": {"size": "small"}}),
    );

    let mut web = chunk("web", "present");
    web.params.insert("size".to_string(), json!("large"));
    web.requisites.push(Requisite {
      keyword: "recreate_on_update".to_string(),
      resource: None,
      decl_id: None,
      args: Some(json!({"params": ["size"]})),
    });
    run.low = vec![web];

    runtime().run(&mut run, &OpContext::new("t", false), None, None).await.unwrap();

    // Original halted, delete + create executed.
    assert!(run.low[0].halt_current_execution);
    assert_eq!(run.running.len(), 2);
    assert!(run.running.values().all(|r| r.result));

    // The record now reflects the replacement, and the delete's record (if
    // any) was retired.
    let record = run.managed_state.get("test|web|web").unwrap();
    assert_eq!(record["new_state"]["size"], json!("large"));
  }
}
