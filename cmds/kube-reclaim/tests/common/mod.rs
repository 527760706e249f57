//! Shared setup for tests against the mock API server.

#![allow(dead_code)]

use std::{
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use k8s_mock::RunningHttpMockK8sServer;
use kube_reclaim::{
	k8s::client::{ClusterConnection, KubeClusterApi},
	reclaim::{
		engine::EscalationSettings,
		proxy::{ProxyError, ProxySettings, TunnelLauncher, TunnelProcess},
		session::NamespaceReclamationSession,
	},
};
use serde::Deserialize;
use serde_json::Value;

/// Load every document of a multi-document YAML fixture.
pub fn fixture(name: &str) -> Vec<Value> {
	let path = Path::new(env!("CARGO_MANIFEST_DIR"))
		.join("tests/testdata")
		.join(name);
	let content = std::fs::read_to_string(&path).unwrap();
	serde_yaml::Deserializer::from_str(&content)
		.map(|doc| Value::deserialize(doc).unwrap())
		.collect()
}

pub async fn connect(server: &RunningHttpMockK8sServer) -> KubeClusterApi {
	let connection = ClusterConnection::from_kubeconfig(server.kubeconfig(), None)
		.await
		.unwrap();
	KubeClusterApi::new(&connection).unwrap()
}

/// Stands in for `oc proxy`: the mock server already answers `/healthz` and
/// `finalize`, so the "tunnel" just points at it.
#[derive(Clone)]
pub struct MockProxy {
	endpoint: String,
	launches: Arc<AtomicUsize>,
	stops: Arc<AtomicUsize>,
}

impl MockProxy {
	pub fn new(server: &RunningHttpMockK8sServer) -> Self {
		Self {
			endpoint: server.uri(),
			launches: Arc::default(),
			stops: Arc::default(),
		}
	}

	pub fn launches(&self) -> usize {
		self.launches.load(Ordering::SeqCst)
	}

	pub fn stops(&self) -> usize {
		self.stops.load(Ordering::SeqCst)
	}
}

impl TunnelLauncher for MockProxy {
	type Process = MockTunnel;

	fn launch(&self, _port: u16) -> Result<MockTunnel, ProxyError> {
		self.launches.fetch_add(1, Ordering::SeqCst);
		Ok(MockTunnel {
			stops: self.stops.clone(),
		})
	}

	fn endpoint(&self, _port: u16) -> String {
		self.endpoint.clone()
	}
}

pub struct MockTunnel {
	stops: Arc<AtomicUsize>,
}

impl TunnelProcess for MockTunnel {
	fn exited(&mut self) -> Option<String> {
		None
	}

	async fn healthy(&self, endpoint: &str) -> bool {
		reqwest::get(format!("{endpoint}/healthz"))
			.await
			.is_ok_and(|r| r.status().is_success())
	}

	async fn terminate(&mut self, _grace: Duration) {
		self.stops.fetch_add(1, Ordering::SeqCst);
	}

	async fn kill(&mut self) {
		self.stops.fetch_add(1, Ordering::SeqCst);
	}
}

pub fn session<'a>(
	api: &'a KubeClusterApi,
	proxy: &MockProxy,
) -> NamespaceReclamationSession<'a, KubeClusterApi, MockProxy> {
	NamespaceReclamationSession::builder()
		.api(api)
		.launcher(proxy.clone())
		.escalation(EscalationSettings {
			delete_timeout: Duration::from_millis(500),
			settle: Duration::from_millis(10),
		})
		.proxy(ProxySettings {
			ports: 21000..=21100,
			health_interval: Duration::from_millis(10),
			health_attempts: 5,
			shutdown_grace: Duration::from_millis(10),
		})
		.build()
}
