//! Local API proxy tunnel management.
//!
//! The `finalize` subresource is reached through `oc proxy` / `kubectl proxy`,
//! which forwards the caller's credentials. A session starts at most one tunnel,
//! lazily, and always shuts it down before returning.

use std::{
	net::TcpListener,
	ops::RangeInclusive,
	path::PathBuf,
	process::{ExitStatus, Stdio},
	time::Duration,
};

use nix::{
	sys::signal::{kill, Signal},
	unistd::Pid,
};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::instrument;

/// Timeout for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("no free local port in {start}..={end}")]
	NoFreePort { start: u16, end: u16 },

	#[error("failed to launch proxy tunnel `{binary}`")]
	Launch {
		binary: String,
		#[source]
		source: std::io::Error,
	},

	#[error("proxy tunnel exited before becoming healthy: {0}")]
	ExitedEarly(String),

	#[error("proxy tunnel on port {port} not healthy after {attempts} probes")]
	Unhealthy { port: u16, attempts: u32 },

	#[error("failed to build HTTP client for proxy health checks")]
	HttpClient(#[source] reqwest::Error),
}

/// Tunnel tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
	pub ports: RangeInclusive<u16>,
	pub health_interval: Duration,
	pub health_attempts: u32,
	pub shutdown_grace: Duration,
}

impl Default for ProxySettings {
	fn default() -> Self {
		Self {
			ports: 8001..=8010,
			health_interval: Duration::from_millis(500),
			health_attempts: 10,
			shutdown_grace: Duration::from_secs(2),
		}
	}
}

/// A running tunnel subprocess.
#[allow(async_fn_in_trait)]
pub trait TunnelProcess {
	/// `Some(description)` once the process has exited.
	fn exited(&mut self) -> Option<String>;

	/// Whether the tunnel answers on `endpoint`.
	async fn healthy(&self, endpoint: &str) -> bool;

	/// Ask the process to stop, killing it if it outlives `grace`.
	async fn terminate(&mut self, grace: Duration);

	/// Stop the process immediately.
	async fn kill(&mut self);
}

/// Starts tunnel processes.
pub trait TunnelLauncher {
	type Process: TunnelProcess;

	fn launch(&self, port: u16) -> Result<Self::Process, ProxyError>;

	/// Base URL of a tunnel listening on `port`.
	fn endpoint(&self, port: u16) -> String {
		format!("http://127.0.0.1:{port}")
	}
}

/// A tunnel owned by a session. Not `ready` until its health check passed.
#[derive(Debug)]
pub struct ProxyChannel<P> {
	pub local_port: u16,
	pub endpoint: String,
	pub ready: bool,
	process: P,
}

/// Owns the session's tunnel, starting it on first use.
///
/// A tunnel is tracked from the moment it is launched, so [`ProxyManager::release`]
/// also stops one whose start was abandoned half way.
pub struct ProxyManager<L: TunnelLauncher> {
	launcher: L,
	settings: ProxySettings,
	channel: Option<ProxyChannel<L::Process>>,
}

impl<L: TunnelLauncher> ProxyManager<L> {
	pub fn new(launcher: L, settings: ProxySettings) -> Self {
		Self {
			launcher,
			settings,
			channel: None,
		}
	}

	pub fn is_active(&self) -> bool {
		self.channel.as_ref().is_some_and(|channel| channel.ready)
	}

	/// Endpoint of the running tunnel, starting one if needed.
	#[instrument(skip(self))]
	pub async fn acquire(&mut self) -> Result<String, ProxyError> {
		if let Some(channel) = self.channel.as_ref().filter(|channel| channel.ready) {
			return Ok(channel.endpoint.clone());
		}
		self.release().await;
		self.start().await
	}

	async fn start(&mut self) -> Result<String, ProxyError> {
		let port = first_free_port(self.settings.ports.clone()).ok_or_else(|| {
			ProxyError::NoFreePort {
				start: *self.settings.ports.start(),
				end: *self.settings.ports.end(),
			}
		})?;
		let endpoint = self.launcher.endpoint(port);

		tracing::info!(port, "starting API proxy");
		let process = self.launcher.launch(port)?;
		let channel = self.channel.insert(ProxyChannel {
			local_port: port,
			endpoint,
			ready: false,
			process,
		});

		for attempt in 1..=self.settings.health_attempts {
			if let Some(status) = channel.process.exited() {
				channel.process.kill().await;
				self.channel = None;
				return Err(ProxyError::ExitedEarly(status));
			}
			if channel.process.healthy(&channel.endpoint).await {
				tracing::debug!(port, attempt, "API proxy healthy");
				channel.ready = true;
				return Ok(channel.endpoint.clone());
			}
			tokio::time::sleep(self.settings.health_interval).await;
		}

		channel.process.kill().await;
		self.channel = None;
		Err(ProxyError::Unhealthy {
			port,
			attempts: self.settings.health_attempts,
		})
	}

	/// Stop the tunnel if one was launched. Safe to call repeatedly.
	#[instrument(skip(self))]
	pub async fn release(&mut self) {
		if let Some(channel) = self.channel.take() {
			self.stop(channel).await;
		}
	}

	async fn stop(&self, mut channel: ProxyChannel<L::Process>) {
		tracing::info!(port = channel.local_port, ready = channel.ready, "stopping API proxy");
		channel.process.terminate(self.settings.shutdown_grace).await;
	}
}

/// First port in `ports` that can currently be bound on the loopback interface.
///
/// The port is released again before returning, so another process may take it
/// before the tunnel binds.
pub fn first_free_port(ports: RangeInclusive<u16>) -> Option<u16> {
	ports.into_iter().find(|&port| TcpListener::bind(("127.0.0.1", port)).is_ok())
}

/// Launches `<binary> proxy --port=<port> --address=127.0.0.1`.
#[derive(Debug, Clone)]
pub struct KubectlProxyLauncher {
	binary: String,
	kubeconfig: Option<PathBuf>,
	context: Option<String>,
	http: reqwest::Client,
}

impl KubectlProxyLauncher {
	pub fn new(
		binary: impl Into<String>,
		kubeconfig: Option<PathBuf>,
		context: Option<String>,
	) -> Result<Self, ProxyError> {
		let http = reqwest::Client::builder()
			.timeout(PROBE_TIMEOUT)
			.build()
			.map_err(ProxyError::HttpClient)?;
		Ok(Self {
			binary: binary.into(),
			kubeconfig,
			context,
			http,
		})
	}

	fn args(&self, port: u16) -> Vec<String> {
		let mut args = vec![
			"proxy".to_string(),
			format!("--port={port}"),
			"--address=127.0.0.1".to_string(),
		];
		if let Some(kubeconfig) = &self.kubeconfig {
			args.push(format!("--kubeconfig={}", kubeconfig.display()));
		}
		if let Some(context) = &self.context {
			args.push(format!("--context={context}"));
		}
		args
	}
}

impl TunnelLauncher for KubectlProxyLauncher {
	type Process = KubectlProxy;

	fn launch(&self, port: u16) -> Result<KubectlProxy, ProxyError> {
		let child = Command::new(&self.binary)
			.args(self.args(port))
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.kill_on_drop(true)
			.spawn()
			.map_err(|source| ProxyError::Launch {
				binary: self.binary.clone(),
				source,
			})?;
		Ok(KubectlProxy {
			child,
			http: self.http.clone(),
		})
	}
}

/// A running `proxy` subprocess.
#[derive(Debug)]
pub struct KubectlProxy {
	child: Child,
	http: reqwest::Client,
}

impl TunnelProcess for KubectlProxy {
	fn exited(&mut self) -> Option<String> {
		match self.child.try_wait() {
			Ok(Some(status)) => Some(describe_exit(status)),
			Ok(None) => None,
			Err(e) => Some(e.to_string()),
		}
	}

	async fn healthy(&self, endpoint: &str) -> bool {
		match self.http.get(format!("{endpoint}/healthz")).send().await {
			Ok(resp) => resp.status().is_success(),
			Err(_) => false,
		}
	}

	async fn terminate(&mut self, grace: Duration) {
		if let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) {
			if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
				tracing::debug!(error = %e, "failed to signal proxy");
			}
		}
		match tokio::time::timeout(grace, self.child.wait()).await {
			Ok(Ok(status)) => tracing::debug!(status = %describe_exit(status), "proxy exited"),
			Ok(Err(e)) => tracing::warn!(error = %e, "failed to wait for proxy"),
			Err(_) => {
				tracing::warn!("proxy ignored SIGTERM, killing");
				self.kill().await;
			}
		}
	}

	async fn kill(&mut self) {
		if let Err(e) = self.child.kill().await {
			tracing::debug!(error = %e, "failed to kill proxy");
		}
	}
}

fn describe_exit(status: ExitStatus) -> String {
	match status.code() {
		Some(code) => format!("exit code {code}"),
		None => status.to_string(),
	}
}
