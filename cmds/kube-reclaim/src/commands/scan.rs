//! Scan command handler.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;
use tracing::instrument;

use super::{
	util::{create_tokio_runtime, emit, Cluster, CommandOutcome},
	GlobalArgs,
};
use crate::{k8s::ResourceState, reclaim::session::NamespaceReclamationSession};

#[derive(Args, Debug)]
pub struct ScanArgs {
	/// Namespace to inspect
	pub namespace: String,
}

/// Run the scan command.
///
/// Exits non-zero when the namespace or anything in it is terminating.
pub fn run<W: Write>(args: ScanArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let runtime = create_tokio_runtime()?;
	runtime.block_on(run_async(args, global, writer))
}

#[instrument(skip_all, fields(namespace = %args.namespace))]
async fn run_async<W: Write>(args: ScanArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let cluster = Cluster::connect(global).await?;
	let report = NamespaceReclamationSession::builder()
		.api(&cluster.api)
		.launcher(cluster.launcher(global)?)
		.build()
		.scan(&args.namespace)
		.await
		.with_context(|| format!("failed to scan namespace {}", args.namespace))?;

	emit(writer, global, &report)?;
	let stuck = report.terminating() > 0 || report.namespace_state == ResourceState::Terminating;
	Ok(if !stuck {
		CommandOutcome::Clean
	} else {
		CommandOutcome::Stuck
	})
}
