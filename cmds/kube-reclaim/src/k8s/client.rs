//! Kubernetes cluster connection management.

use std::{path::Path, time::Duration};

use k8s_openapi::apimachinery::pkg::version::Info;
use kube::{
	api::{DeleteParams, DynamicObject, ListParams, PatchParams},
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Api, Client, Config,
};
use thiserror::Error;
use tracing::instrument;

use super::{
	api::{ApiError, ClusterApi, FinalizeResponse, FinalizerPatch},
	discovery, Observed, ResourceKind, ResourceRef, ResourceScope,
};

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for requests sent through the local proxy.
const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("no context named `{0}` was found. Please check your $KUBECONFIG")]
	ContextNotFound(String),

	#[error("failed to build HTTP client for the API proxy")]
	ProxyClient(#[source] reqwest::Error),

	#[error(transparent)]
	Kubeconfig(#[from] KubeconfigError),

	#[error(transparent)]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
///
/// This type encapsulates the kube client and server metadata,
/// providing a high-level interface for cluster operations.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	server_version: Info,
	/// Human-readable identifier for the cluster (context name or API server URL).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.field("server_version", &self.server_version)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the kubeconfig at `kubeconfig_path` (or `$KUBECONFIG` / `~/.kube/config`)
	/// and the given context, falling back to the current context.
	#[instrument(skip_all)]
	pub async fn connect(
		kubeconfig_path: Option<&Path>,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		let kubeconfig = match kubeconfig_path {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_kubeconfig(kubeconfig, context).await
	}

	/// Connect using a provided kubeconfig.
	#[instrument(skip_all)]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		let context_name = match context {
			Some(name) => {
				if !kubeconfig.contexts.iter().any(|c| c.name == name) {
					return Err(ConnectionError::ContextNotFound(name.to_string()));
				}
				name.to_string()
			}
			None => kubeconfig.current_context.clone().unwrap_or_default(),
		};

		tracing::debug!(context = %context_name, "using kubeconfig context");

		let mut config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: context.map(str::to_string),
				..Default::default()
			},
		)
		.await?;

		let cluster_identifier = format!("{}  (context:{})", config.cluster_url, context_name);

		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;

		let server_version = client.apiserver_version().await?;

		Ok(Self {
			client,
			server_version,
			cluster_identifier,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Get the server version.
	pub fn server_version(&self) -> &Info {
		&self.server_version
	}

	/// Get the cluster identifier (context name and API server URL).
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}

/// [`ClusterApi`] backed by kube-rs, with `finalize` calls going through the local proxy.
#[derive(Clone)]
pub struct KubeClusterApi {
	client: Client,
	proxy_http: reqwest::Client,
}

impl KubeClusterApi {
	pub fn new(connection: &ClusterConnection) -> Result<Self, ConnectionError> {
		let proxy_http = reqwest::Client::builder()
			.timeout(PROXY_REQUEST_TIMEOUT)
			.build()
			.map_err(ConnectionError::ProxyClient)?;
		Ok(Self {
			client: connection.client().clone(),
			proxy_http,
		})
	}

	fn dynamic_api(&self, target: &ResourceRef) -> Api<DynamicObject> {
		let ar = target.api_resource();
		match &target.namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
			None => Api::all_with(self.client.clone(), &ar),
		}
	}
}

impl ClusterApi for KubeClusterApi {
	#[instrument(skip(self))]
	async fn discover_kinds(&self) -> Result<Vec<ResourceKind>, ApiError> {
		discovery::run_discovery(&self.client)
			.await
			.map_err(|e| ApiError::Transient(e.to_string()))
	}

	#[instrument(skip(self, kind), fields(kind = %kind.qualified_name()))]
	async fn list(&self, namespace: &str, kind: &ResourceKind) -> Result<Vec<ResourceRef>, ApiError> {
		if kind.scope != ResourceScope::Namespaced || !kind.supports("list") {
			return Err(ApiError::Discovery {
				kind: kind.qualified_name(),
				reason: "no namespaced list verb".to_string(),
			});
		}

		let api: Api<DynamicObject> =
			Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource());
		let list = api
			.list(&ListParams::default())
			.await
			.map_err(|e| match ApiError::from_kube(e) {
				ApiError::NotFound(reason) | ApiError::Forbidden(reason) => ApiError::Discovery {
					kind: kind.qualified_name(),
					reason,
				},
				ApiError::Rejected { status: 405, reason } => ApiError::Discovery {
					kind: kind.qualified_name(),
					reason,
				},
				other => other,
			})?;

		Ok(list
			.items
			.into_iter()
			.filter_map(|obj| {
				let name = obj.metadata.name?;
				Some(ResourceRef::namespaced(kind, namespace, &name).with_uid(obj.metadata.uid))
			})
			.collect())
	}

	#[instrument(skip(self), fields(target = %target))]
	async fn get(&self, target: &ResourceRef) -> Result<Observed, ApiError> {
		let obj = self
			.dynamic_api(target)
			.get(&target.name)
			.await
			.map_err(ApiError::from_kube)?;
		let object = serde_json::to_value(&obj).map_err(|e| ApiError::Transient(e.to_string()))?;
		Ok(Observed::from_object(object))
	}

	#[instrument(skip(self), fields(target = %target))]
	async fn delete(&self, target: &ResourceRef, grace_period_seconds: Option<u32>) -> Result<(), ApiError> {
		let params = DeleteParams {
			grace_period_seconds,
			..Default::default()
		};
		self.dynamic_api(target)
			.delete(&target.name, &params)
			.await
			.map_err(ApiError::from_kube)?;
		Ok(())
	}

	#[instrument(skip(self), fields(target = %target))]
	async fn patch(&self, target: &ResourceRef, patch: FinalizerPatch) -> Result<(), ApiError> {
		self.dynamic_api(target)
			.patch(&target.name, &PatchParams::default(), &patch.to_patch())
			.await
			.map_err(ApiError::from_kube)?;
		Ok(())
	}

	#[instrument(skip(self, payload), fields(target = %target))]
	async fn finalize(
		&self,
		target: &ResourceRef,
		endpoint: &str,
		payload: &Path,
	) -> Result<FinalizeResponse, ApiError> {
		let body = tokio::fs::read(payload).await.map_err(|e| {
			ApiError::Transient(format!("reading staged payload {}: {e}", payload.display()))
		})?;
		let url = format!("{}{}/finalize", endpoint.trim_end_matches('/'), target.url_path());

		let response = self
			.proxy_http
			.put(&url)
			.header(reqwest::header::CONTENT_TYPE, "application/json")
			.body(body)
			.send()
			.await
			.map_err(|e| ApiError::Transient(e.to_string()))?;

		let status = response.status().as_u16();
		let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
		if matches!(status, 401 | 429) || status >= 500 {
			return Err(ApiError::from_status(status, body.to_string()));
		}
		Ok(FinalizeResponse::from_response(status, &body))
	}
}
