//! Utilities for command handlers.

use std::io::{self, ErrorKind, IsTerminal, Write};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};

use super::GlobalArgs;
use crate::{
	config::ReclaimConfig,
	k8s::client::{ClusterConnection, KubeClusterApi},
	reclaim::{
		proxy::KubectlProxyLauncher,
		report::{ScanReport, SessionReport, Verdict},
		session::SessionError,
	},
};

/// Report format on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
	#[default]
	Table,
	Json,
}

/// When to colorize table output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorMode {
	#[default]
	Auto,
	Always,
	Never,
}

impl ColorMode {
	pub fn enabled(self) -> bool {
		match self {
			Self::Always => true,
			Self::Never => false,
			Self::Auto => io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
		}
	}
}

/// How a command ended, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
	Clean,
	Stuck,
	Interrupted,
}

impl CommandOutcome {
	pub fn code(self) -> u8 {
		match self {
			Self::Clean => 0,
			Self::Stuck => 1,
			Self::Interrupted => 130,
		}
	}
}

impl From<Verdict> for CommandOutcome {
	fn from(verdict: Verdict) -> Self {
		match verdict {
			Verdict::Clean => Self::Clean,
			Verdict::PartiallyStuck => Self::Stuck,
		}
	}
}

/// A report that can be printed as a table or as JSON.
pub trait Render: Serialize {
	fn write_table<W: Write>(&self, writer: W, colored: bool) -> io::Result<()>;
}

impl Render for ScanReport {
	fn write_table<W: Write>(&self, writer: W, colored: bool) -> io::Result<()> {
		ScanReport::write_table(self, writer, colored)
	}
}

impl Render for SessionReport {
	fn write_table<W: Write>(&self, writer: W, colored: bool) -> io::Result<()> {
		SessionReport::write_table(self, writer, colored)
	}
}

/// Print `report` in the format selected by the global flags.
pub fn emit<W: Write, R: Render>(mut writer: W, global: &GlobalArgs, report: &R) -> Result<()> {
	match global.output {
		OutputFormat::Table => Render::write_table(report, &mut writer, global.color.enabled())
			.context("writing report")?,
		OutputFormat::Json => {
			serde_json::to_writer_pretty(&mut writer, report).context("serializing report")?;
			writeln!(writer)?;
		}
	}
	writer.flush()?;
	Ok(())
}

/// Print the report of a mutating session and map it to an outcome.
pub fn finish_session<W: Write>(
	result: Result<SessionReport, SessionError>,
	global: &GlobalArgs,
	writer: W,
	what: &str,
) -> Result<CommandOutcome> {
	match result {
		Ok(report) => {
			emit(writer, global, &report)?;
			Ok(report.verdict.into())
		}
		Err(SessionError::Interrupted) => {
			tracing::warn!("interrupted, proxy released; resources keep their current state");
			Ok(CommandOutcome::Interrupted)
		}
		Err(err) => Err(err).with_context(|| format!("failed to {what}")),
	}
}

/// Cluster access for one command.
pub struct Cluster {
	pub config: ReclaimConfig,
	pub connection: ClusterConnection,
	pub api: KubeClusterApi,
}

impl Cluster {
	pub async fn connect(global: &GlobalArgs) -> Result<Self> {
		let config = ReclaimConfig::load(global.config.as_deref())?;
		let connection = ClusterConnection::connect(global.kubeconfig.as_deref(), global.context.as_deref())
			.await
			.context("connecting to cluster")?;
		tracing::info!(
			cluster = connection.cluster_identifier(),
			version = %connection.server_version().git_version,
			"connected"
		);
		let api = KubeClusterApi::new(&connection)?;
		Ok(Self {
			config,
			connection,
			api,
		})
	}

	/// Launcher for `oc proxy` / `kubectl proxy` against the same kubeconfig context.
	pub fn launcher(&self, global: &GlobalArgs) -> Result<KubectlProxyLauncher> {
		KubectlProxyLauncher::new(
			self.config.proxy_binary(),
			global.kubeconfig.clone(),
			global.context.clone(),
		)
		.context("preparing API proxy launcher")
	}
}

pub fn create_tokio_runtime() -> Result<tokio::runtime::Runtime> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("creating tokio runtime")
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
	let mut terminate = match signal(SignalKind::terminate()) {
		Ok(stream) => Some(stream),
		Err(err) => {
			tracing::warn!(error = %err, "cannot listen for SIGTERM");
			None
		}
	};
	let sigterm = async {
		match terminate.as_mut() {
			Some(stream) => {
				stream.recv().await;
			}
			None => std::future::pending().await,
		}
	};

	tokio::select! {
		result = tokio::signal::ctrl_c() => {
			if let Err(err) = result {
				tracing::warn!(error = %err, "cannot listen for Ctrl-C");
				std::future::pending::<()>().await;
			}
		}
		() = sigterm => {}
	}
	tracing::warn!("shutdown requested");
}

/// A writer wrapper that silently handles broken pipe errors.
///
/// Writes to a closed pipe succeed without output, so that
/// `kube-reclaim scan ns | head -1` exits cleanly.
pub struct BrokenPipeGuard<W> {
	inner: W,
}

impl<W> BrokenPipeGuard<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: Write> Write for BrokenPipeGuard<W> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self.inner.write(buf) {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(buf.len()),
			other => other,
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self.inner.flush() {
			Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
			other => other,
		}
	}
}
