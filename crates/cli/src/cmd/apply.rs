//! Implementation of the `idem apply` and `idem plan` commands.
//!
//! Plan is apply in test mode: the same pipeline runs end to end, but
//! resource plugins report would-be changes instead of making them and the
//! enforced state is left untouched.

use anyhow::{Context, Result};
use console::{Term, style};
use std::sync::Arc;
use tracing::info;

use idem_lib::Registry;
use idem_lib::exec::CancelToken;
use idem_lib::exec::apply::{ApplyOptions, apply};
use idem_lib::exec::report::{Outcome, RunReport};

use super::RunArgs;

/// Execute the apply (or plan) command and print the per-chunk report.
/// Exits non-zero when anything failed, was skipped, or was cancelled.
pub fn cmd_apply(args: &RunArgs, test: bool) -> Result<()> {
  let term = Term::stderr();
  let registry = Arc::new(Registry::with_defaults());
  let cancel = CancelToken::new();

  let options = ApplyOptions {
    run_name: args.run_name.clone(),
    sources: args.sources.clone(),
    refs: args.refs.clone(),
    esm_backend: "local".to_string(),
    cache_dir: args.cache_dir.clone(),
    test,
    hard_fail: args.hard_fail,
    upgrade_esm: args.upgrade_esm,
    keep_cache: args.keep_cache,
    parallelism: args
      .parallelism
      .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
    cancel: cancel.clone(),
  };

  info!(run = %args.run_name, refs = ?args.refs, test, "starting run");
  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let report = rt
    .block_on(async {
      let handler_cancel = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          handler_cancel.cancel();
        }
      });
      apply(registry, options).await
    })
    .context(if test { "plan failed" } else { "apply failed" })?;

  print_report(&term, &report)?;
  if !report.succeeded() {
    std::process::exit(1);
  }
  Ok(())
}

fn print_report(term: &Term, report: &RunReport) -> Result<()> {
  for entry in &report.entries {
    let (symbol, label) = match entry.outcome {
      Outcome::Changed => (style("+").green().bold(), style("changed").green()),
      Outcome::WouldChange => (style("~").yellow().bold(), style("would change").yellow()),
      Outcome::NoChange => (style("=").dim(), style("no change").dim()),
      Outcome::Failed => (style("x").red().bold(), style("failed").red().bold()),
      Outcome::Skipped => (style("-").yellow(), style("skipped").yellow()),
    };
    term.write_line(&format!("{symbol} {} [{label}] {}", entry.tag, entry.comment))?;
  }

  for error in &report.errors {
    term.write_line(&format!("{} {error}", style("error:").red().bold()))?;
  }

  let (changed, unchanged, failed) = report.counts();
  let verb = if report.test { "would change" } else { "changed" };
  term.write_line("")?;
  term.write_line(&format!(
    "{} {changed} {verb}, {unchanged} unchanged, {failed} failed or skipped",
    style("::").cyan().bold()
  ))?;
  if report.cancelled {
    term.write_line(&format!("{} run cancelled", style("warning:").yellow().bold()))?;
  }
  Ok(())
}
