//! Namespace reclamation sessions.
//!
//! A session wires discovery, the escalation engine, the proxy tunnel and
//! payload staging together. The tunnel is released before any session
//! operation returns, including when it is interrupted.

use std::future::Future;

use bon::Builder;
use thiserror::Error;
use tracing::instrument;

use super::{
	engine::{EscalationEngine, EscalationSettings, ResourceHistory},
	namespace::{self, finalize_namespace},
	payload::{PayloadError, PayloadStage},
	proxy::{ProxyManager, ProxySettings, TunnelLauncher},
	report::{ScanEntry, ScanReport, SessionReport},
};
use crate::k8s::{
	api::{fetch, ApiError, ClusterApi},
	discovery::{discover_namespace, list_kinds, resolve_kind, KindFilter},
	ResourceRef, ResourceState,
};

/// Errors that end a session before any resource is touched.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("namespace `{0}` does not exist")]
	NamespaceNotFound(String),

	#[error("no listable resource kinds found")]
	NoListableKinds,

	#[error("unknown resource kind `{0}`")]
	UnknownKind(String),

	#[error("{0} does not exist")]
	ResourceNotFound(String),

	#[error(transparent)]
	Payload(#[from] PayloadError),

	#[error(transparent)]
	Api(#[from] ApiError),

	#[error("interrupted")]
	Interrupted,
}

/// One operator-invoked remediation run.
#[derive(Builder)]
pub struct NamespaceReclamationSession<'a, A, L> {
	api: &'a A,
	launcher: L,
	#[builder(default)]
	escalation: EscalationSettings,
	#[builder(default)]
	proxy: ProxySettings,
}

impl<'a, A: ClusterApi, L: TunnelLauncher> NamespaceReclamationSession<'a, A, L> {
	/// Report every instance in `namespace` and its state without changing anything.
	#[instrument(skip(self))]
	pub async fn scan(&self, namespace: &str) -> Result<ScanReport, SessionError> {
		let namespace_state = require_namespace(self.api, namespace).await?;
		let inventory = discover_namespace(self.api, namespace, KindFilter::ScanOnly).await?;
		if inventory.kinds.is_empty() {
			return Err(SessionError::NoListableKinds);
		}

		let mut resources = Vec::with_capacity(inventory.instances.len());
		for resource in inventory.instances {
			let entry = match fetch(self.api, &resource).await {
				Ok(Some(observed)) => ScanEntry {
					state: observed.state,
					finalizers: observed.finalizers(),
					resource,
				},
				Ok(None) => ScanEntry {
					resource,
					state: ResourceState::Gone,
					finalizers: Vec::new(),
				},
				Err(err) => {
					tracing::warn!(error = %err, resource = %resource, "could not read resource");
					ScanEntry {
						resource,
						state: ResourceState::Unknown,
						finalizers: Vec::new(),
					}
				}
			};
			resources.push(entry);
		}

		Ok(ScanReport {
			namespace: namespace.to_string(),
			namespace_state,
			kinds_scanned: inventory.kinds.len(),
			resources,
			skipped: inventory.skipped,
		})
	}

	/// Escalate every instance in `namespace`, then finalize the namespace
	/// itself if it is terminating and nothing is left in it.
	///
	/// With `dry_run` only discovery runs.
	#[instrument(skip(self, shutdown))]
	pub async fn fix<F>(self, namespace: &str, dry_run: bool, shutdown: F) -> Result<SessionReport, SessionError>
	where
		F: Future<Output = ()>,
	{
		let api = self.api;
		let settings = self.escalation;
		let mut proxy = ProxyManager::new(self.launcher, self.proxy);

		let result = tokio::select! {
			result = fix_namespace(api, &mut proxy, namespace, dry_run, settings) => result,
			() = shutdown => Err(SessionError::Interrupted),
		};
		proxy.release().await;
		result
	}

	/// Escalate a single resource.
	#[instrument(skip(self, shutdown))]
	pub async fn fix_one<F>(
		self,
		namespace: &str,
		kind: &str,
		name: &str,
		shutdown: F,
	) -> Result<SessionReport, SessionError>
	where
		F: Future<Output = ()>,
	{
		let api = self.api;
		let settings = self.escalation;
		let mut proxy = ProxyManager::new(self.launcher, self.proxy);

		let result = tokio::select! {
			result = fix_resource(api, &mut proxy, namespace, kind, name, settings) => result,
			() = shutdown => Err(SessionError::Interrupted),
		};
		proxy.release().await;
		result
	}

	/// Delete `namespace`, finalizing it through the proxy if it does not go away.
	#[instrument(skip(self, shutdown))]
	pub async fn delete_namespace<F>(self, namespace: &str, shutdown: F) -> Result<SessionReport, SessionError>
	where
		F: Future<Output = ()>,
	{
		let api = self.api;
		let settings = self.escalation;
		let mut proxy = ProxyManager::new(self.launcher, self.proxy);

		let result = tokio::select! {
			result = remove_namespace(api, &mut proxy, namespace, settings) => result,
			() = shutdown => Err(SessionError::Interrupted),
		};
		proxy.release().await;
		result
	}
}

async fn require_namespace<A: ClusterApi>(api: &A, namespace: &str) -> Result<ResourceState, SessionError> {
	match fetch(api, &ResourceRef::namespace_object(namespace)).await? {
		Some(observed) => Ok(observed.state),
		None => Err(SessionError::NamespaceNotFound(namespace.to_string())),
	}
}

async fn fix_namespace<A: ClusterApi, L: TunnelLauncher>(
	api: &A,
	proxy: &mut ProxyManager<L>,
	namespace: &str,
	dry_run: bool,
	settings: EscalationSettings,
) -> Result<SessionReport, SessionError> {
	require_namespace(api, namespace).await?;
	let inventory = discover_namespace(api, namespace, KindFilter::FixCapable).await?;
	if inventory.kinds.is_empty() {
		return Err(SessionError::NoListableKinds);
	}

	let mut report = SessionReport::new(namespace, dry_run);
	report.skipped = inventory.skipped;

	if dry_run {
		tracing::info!(count = inventory.instances.len(), "dry run, no changes made");
		report.planned = inventory.instances;
		return Ok(report.conclude());
	}

	tracing::info!(count = inventory.instances.len(), "reclaiming resources");
	let stage = PayloadStage::new()?;
	let engine = EscalationEngine::new(api, settings);
	for target in &inventory.instances {
		let history = engine.reclaim(target, proxy, &stage).await;
		tracing::info!(resource = %target, state = %history.final_state, "resource processed");
		report.resources.push(history);
	}

	if report.resources.iter().all(ResourceHistory::reclaimed) {
		match namespace::namespace_state(api, namespace).await {
			Ok(ResourceState::Terminating) => {
				report.namespace_outcome =
					Some(finalize_namespace(api, proxy, &stage, namespace, settings.settle).await);
			}
			Ok(state) => tracing::debug!(%state, "namespace not terminating, leaving it alone"),
			Err(err) => tracing::warn!(error = %err, "could not read namespace"),
		}
	}

	Ok(report.conclude())
}

async fn fix_resource<A: ClusterApi, L: TunnelLauncher>(
	api: &A,
	proxy: &mut ProxyManager<L>,
	namespace: &str,
	kind: &str,
	name: &str,
	settings: EscalationSettings,
) -> Result<SessionReport, SessionError> {
	require_namespace(api, namespace).await?;
	let kinds = list_kinds(api, KindFilter::FixCapable).await?;
	if kinds.is_empty() {
		return Err(SessionError::NoListableKinds);
	}
	let resolved =
		resolve_kind(&kinds, kind).ok_or_else(|| SessionError::UnknownKind(kind.to_string()))?;

	let target = ResourceRef::namespaced(resolved, namespace, name);
	let observed = fetch(api, &target)
		.await?
		.ok_or_else(|| SessionError::ResourceNotFound(target.to_string()))?;
	let target = target.with_uid(
		observed
			.object
			.pointer("/metadata/uid")
			.and_then(serde_json::Value::as_str)
			.map(str::to_string),
	);

	let stage = PayloadStage::new()?;
	let engine = EscalationEngine::new(api, settings);
	let mut report = SessionReport::new(namespace, false);
	report.resources.push(engine.reclaim(&target, proxy, &stage).await);
	Ok(report.conclude())
}

async fn remove_namespace<A: ClusterApi, L: TunnelLauncher>(
	api: &A,
	proxy: &mut ProxyManager<L>,
	namespace: &str,
	settings: EscalationSettings,
) -> Result<SessionReport, SessionError> {
	require_namespace(api, namespace).await?;

	let stage = PayloadStage::new()?;
	let mut report = SessionReport::new(namespace, false);
	report.namespace_outcome = Some(
		namespace::delete_namespace(
			api,
			proxy,
			&stage,
			namespace,
			settings.delete_timeout,
			settings.settle,
		)
		.await,
	);
	Ok(report.conclude())
}
