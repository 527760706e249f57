use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kube_reclaim::{
	commands::{self, util::BrokenPipeGuard, GlobalArgs},
	telemetry,
};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

#[derive(Parser)]
#[command(name = "kube-reclaim")]
#[command(about = "Reclaim resources and namespaces stuck in termination", long_about = None)]
#[command(version)]
struct Cli {
	#[command(flatten)]
	global: GlobalArgs,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Show every resource in a namespace and whether it is terminating
	Scan(commands::scan::ScanArgs),

	/// Reclaim every resource in a namespace, then the namespace if it is terminating
	Fix(commands::fix::FixArgs),

	/// Reclaim a single resource
	FixOne(commands::fix_one::FixOneArgs),

	/// Delete a namespace, finalizing it if it gets stuck
	DeleteNamespace(commands::delete_namespace::DeleteNamespaceArgs),
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	let _telemetry = match telemetry::init(cli.global.log_level) {
		Ok(guard) => guard,
		Err(err) => {
			eprintln!("Error: {err:?}");
			return ExitCode::FAILURE;
		}
	};

	let stdout = BrokenPipeGuard::new(std::io::stdout());
	let global = &cli.global;

	let result = match cli.command {
		Commands::Scan(args) => commands::scan::run(args, global, stdout),
		Commands::Fix(args) => commands::fix::run(args, global, stdout),
		Commands::FixOne(args) => commands::fix_one::run(args, global, stdout),
		Commands::DeleteNamespace(args) => commands::delete_namespace::run(args, global, stdout),
	};

	match result {
		Ok(outcome) => ExitCode::from(outcome.code()),
		Err(err) => {
			tracing::error!(error = %format!("{err:#}"), "command failed");
			eprintln!("Error: {err:?}");
			ExitCode::FAILURE
		}
	}
}
