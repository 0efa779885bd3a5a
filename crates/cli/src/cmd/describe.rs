//! Implementation of the `idem describe` command.
//!
//! Asks a resource plugin to enumerate what already exists, printed as
//! present-style declarations ready to paste into a document.

use anyhow::{Context, Result};
use console::{Term, style};
use std::sync::Arc;

use idem_lib::Registry;
use idem_lib::resource::OpContext;

pub fn cmd_describe(resource: &str, run_name: &str) -> Result<()> {
  let term = Term::stderr();
  let registry = Arc::new(Registry::with_defaults());

  let Some(plugin) = registry.resource(resource) else {
    term.write_line(&format!(
      "{} no resource plugin registered for '{resource}' (known: {})",
      style("error:").red().bold(),
      registry.resource_types().join(", ")
    ))?;
    std::process::exit(1);
  };

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let ctx = OpContext::new(run_name, false);
  let existing = rt
    .block_on(plugin.describe(&ctx))
    .with_context(|| format!("describe failed for '{resource}'"))?;

  println!("{}", serde_json::to_string_pretty(&existing)?);
  Ok(())
}
