pub mod delete_namespace;
pub mod fix;
pub mod fix_one;
pub mod scan;
pub mod util;

use std::path::PathBuf;

use clap::Args;
use tracing::Level;

use self::util::{ColorMode, OutputFormat};

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
	/// Kubeconfig context to use instead of the current one
	#[arg(long, global = true)]
	pub context: Option<String>,

	/// Path to the kubeconfig file (defaults to $KUBECONFIG or ~/.kube/config)
	#[arg(long, global = true)]
	pub kubeconfig: Option<PathBuf>,

	/// Path to a TOML file with escalation and proxy settings
	#[arg(long, global = true, env = crate::config::CONFIG_ENV)]
	pub config: Option<PathBuf>,

	/// Log level (overrides RUST_LOG)
	#[arg(long, global = true)]
	pub log_level: Option<Level>,

	/// Report format
	#[arg(long, global = true, value_enum, default_value_t)]
	pub output: OutputFormat,

	/// Colorize table output
	#[arg(long, global = true, value_enum, default_value_t)]
	pub color: ColorMode,
}
