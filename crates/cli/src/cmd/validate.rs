//! Implementation of the `idem validate` command.
//!
//! Gathers and compiles the given refs without entering the enforced state
//! or executing anything, so document problems surface without a lock.

use anyhow::{Context, Result};
use console::{Term, style};

use idem_lib::compile;
use idem_lib::registry::Registry;
use idem_lib::render::{GatherOpts, gather};
use idem_lib::run::RunContext;
use idem_lib::source::SourceResolver;

use super::RunArgs;

pub fn cmd_validate(args: &RunArgs) -> Result<()> {
  let term = Term::stderr();
  let registry = Registry::with_defaults();

  let mut run = RunContext::new(&args.run_name);
  let mut resolver = SourceResolver::new(args.sources.clone());
  let opts = GatherOpts {
    hard_fail: args.hard_fail,
    ..GatherOpts::default()
  };

  gather(&mut run, &mut resolver, &registry, &args.refs, &opts).context("gathering failed")?;

  let (low, compile_errors) = compile::compile_high(&run.high);
  for error in compile_errors {
    run.error(error);
  }

  if !run.errors.is_empty() {
    for error in &run.errors {
      term.write_line(&format!("{} {error}", style("error:").red().bold()))?;
    }
    std::process::exit(1);
  }

  term.write_line(&format!(
    "{} {} document(s), {} declaration(s), {} chunk(s) ok",
    style("✓").green().bold(),
    run.resolved.len(),
    run.high.len(),
    low.len()
  ))?;
  Ok(())
}
