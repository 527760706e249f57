//! Delete-namespace command handler.
//!
//! Deletes the namespace object and, if it stays terminating, strips its
//! finalizers through the proxy. Child resources are not touched.

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
pub struct DeleteNamespaceArgs {
	/// Namespace to delete
	pub namespace: String,

	/// Seconds to wait for the delete call
	#[arg(long, value_name = "SECS")]
	pub timeout: Option<u64>,
}

/// Run the delete-namespace command.
pub fn run<W: Write>(args: DeleteNamespaceArgs, global: &GlobalArgs, writer: W) -> Result<CommandOutcome> {
	let runtime = create_tokio_runtime()?;
	runtime.block_on(run_async(args, global, writer))
}

#[instrument(skip_all, fields(namespace = %args.namespace))]
async fn run_async<W: Write>(
	args: DeleteNamespaceArgs,
	global: &GlobalArgs,
	writer: W,
) -> Result<CommandOutcome> {
	let cluster = Cluster::connect(global).await?;
	let result = NamespaceReclamationSession::builder()
		.api(&cluster.api)
		.launcher(cluster.launcher(global)?)
		.escalation(cluster.config.escalation_settings(args.timeout.map(Duration::from_secs)))
		.proxy(cluster.config.proxy_settings())
		.build()
		.delete_namespace(&args.namespace, shutdown_signal())
		.await;

	finish_session(result, global, writer, &format!("delete namespace {}", args.namespace))
}
