mod apply;
mod describe;
mod validate;

use std::path::PathBuf;

pub use apply::cmd_apply;
pub use describe::cmd_describe;
pub use validate::cmd_validate;

/// Arguments shared by the run-driving commands.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
  /// Top-level sls refs to gather (dotted form, e.g. `infra.network`)
  #[arg(required = true)]
  pub refs: Vec<String>,

  /// Document source directory, in priority order (repeatable)
  #[arg(short, long = "source", default_value = ".")]
  pub sources: Vec<PathBuf>,

  /// Run name; partitions enforced state
  #[arg(long, default_value = "default")]
  pub run_name: String,

  /// Cache directory for enforced state
  #[arg(long, default_value = ".idem")]
  pub cache_dir: PathBuf,

  /// Abort on the first collection error
  #[arg(long)]
  pub hard_fail: bool,

  /// Migrate an older enforced-state cache instead of refusing it
  #[arg(long)]
  pub upgrade_esm: bool,

  /// Keep the scratch cache after a clean exit
  #[arg(long)]
  pub keep_cache: bool,

  /// Maximum chunks in flight at once (defaults to the CPU count)
  #[arg(long)]
  pub parallelism: Option<usize>,
}
