//! Fix-one command handler.

use std::{io::Write, time::Duration};

use anyhow::Result;
use clap::Args;
use tracing::instrument;

use super::{
	util::{create_tokio_runtime, finish_session, shutdown_signal, Cluster, CommandOutcome},
	GlobalArgs,
};
use crate::reclaim::session::NamespaceReclamationSession;

#[derive(Args, Debug)]
pub struct FixOneArgs {
	/// Resource kind, as `plural`, `Kind` or `plural.group` (e.g. `replicasets.apps`)
	pub kind: String,

	/// Resource name
	pub name: String,

	/// Namespace of the resource
	#[arg(short, long)]
	pub namespace: String,

	/// Seconds to wait for normal and forced delete calls
	#[arg(long, value_name = "SECS")]
	pub timeout: Option<u64>,
}

/// Run the fix-one command.
pub fn run<W: Write>(args: FixOneArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let runtime = create_tokio_runtime()?;
	runtime.block_on(run_async(args, global, writer))
}

#[instrument(skip_all, fields(kind = %args.kind, name = %args.name, namespace = %args.namespace))]
async fn run_async<W: Write>(args: FixOneArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let cluster = Cluster::connect(global).await?;
	let result = NamespaceReclamationSession::builder()
		.api(&cluster.api)
		.launcher(cluster.launcher(global)?)
		.escalation(cluster.config.escalation_settings(args.timeout.map(Duration::from_secs)))
		.proxy(cluster.config.proxy_settings())
		.build()
		.fix_one(&args.namespace, &args.kind, &args.name, shutdown_signal())
		.await;

	finish_session(
		result,
		global,
		writer,
		&format!("reclaim {} {} in {}", args.kind, args.name, args.namespace),
	)
}
