//! Fix command handler.
//!
//! Escalates every resource in a namespace until it is gone, then finalizes
//! the namespace itself when it is stuck terminating.

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
pub struct FixArgs {
	/// Namespace to reclaim
	pub namespace: String,

	/// Seconds to wait for normal and forced delete calls
	#[arg(long, value_name = "SECS")]
	pub timeout: Option<u64>,

	/// Only report what would be attempted
	#[arg(long)]
	pub dry_run: bool,
}

/// Run the fix command.
pub fn run<W: Write>(args: FixArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let runtime = create_tokio_runtime()?;
	runtime.block_on(run_async(args, global, writer))
}

#[instrument(skip_all, fields(namespace = %args.namespace, dry_run = args.dry_run))]
async fn run_async<W: Write>(args: FixArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let cluster = Cluster::connect(global).await?;
	let result = NamespaceReclamationSession::builder()
		.api(&cluster.api)
		.launcher(cluster.launcher(global)?)
		.escalation(cluster.config.escalation_settings(args.timeout.map(Duration::from_secs)))
		.proxy(cluster.config.proxy_settings())
		.build()
		.fix(&args.namespace, args.dry_run, shutdown_signal())
		.await;

	finish_session(result, global, writer, &format!("reclaim namespace {}", args.namespace))
}
