use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;

/// idem - Idempotent infrastructure state engine
#[derive(Parser)]
#[command(name = "idem")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Apply the declared state
  Apply(cmd::RunArgs),

  /// Show what changes would be made (dry-run)
  Plan(cmd::RunArgs),

  /// Gather and compile documents, reporting collection errors
  Validate(cmd::RunArgs),

  /// Enumerate existing resources of a registered resource-type
  Describe {
    /// Resource-type to enumerate, e.g. `test`
    resource: String,

    /// Run name passed to the plugin
    #[arg(long, default_value = "default")]
    run_name: String,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_filter = if cli.verbose { "debug" } else { "warn" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
    .without_time()
    .init();

  match cli.command {
    Commands::Apply(args) => cmd::cmd_apply(&args, false),
    Commands::Plan(args) => cmd::cmd_apply(&args, true),
    Commands::Validate(args) => cmd::cmd_validate(&args),
    Commands::Describe { resource, run_name } => cmd::cmd_describe(&resource, &run_name),
  }
}
