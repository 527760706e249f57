//! Finalization of the namespace object itself.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::instrument;

use super::{
	payload::{FinalizerField, PayloadStage},
	proxy::{ProxyManager, TunnelLauncher},
};
use crate::k8s::{
	api::{fetch, retry_transient, ApiError, ClusterApi, FinalizeResponse},
	ResourceRef, ResourceState,
};

/// What happened to the namespace object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOutcome {
	pub name: String,
	/// Whether any mutating call was made against the namespace.
	pub attempted: bool,
	pub final_state: ResourceState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
}

impl NamespaceOutcome {
	pub fn reclaimed(&self) -> bool {
		self.final_state == ResourceState::Gone
	}
}

/// Current state of the namespace object.
pub async fn namespace_state<A: ClusterApi>(api: &A, namespace: &str) -> Result<ResourceState, ApiError> {
	let target = ResourceRef::namespace_object(namespace);
	Ok(match fetch(api, &target).await? {
		Some(observed) => observed.state,
		None => ResourceState::Gone,
	})
}

/// Strip `spec.finalizers` from the namespace and PUT it to `/finalize`
/// through the proxy, then verify it is gone. Never escalates further.
#[instrument(skip(api, proxy, stage, settle))]
pub async fn finalize_namespace<A: ClusterApi, L: TunnelLauncher>(
	api: &A,
	proxy: &mut ProxyManager<L>,
	stage: &PayloadStage,
	namespace: &str,
	settle: Duration,
) -> NamespaceOutcome {
	let target = ResourceRef::namespace_object(namespace);
	let outcome = |attempted, final_state, detail: Option<String>| NamespaceOutcome {
		name: namespace.to_string(),
		attempted,
		final_state,
		detail,
	};

	let observed = match fetch(api, &target).await {
		Ok(Some(observed)) => observed,
		Ok(None) => return outcome(false, ResourceState::Gone, None),
		Err(err) => return outcome(false, ResourceState::Unknown, Some(err.to_string())),
	};

	let endpoint = match proxy.acquire().await {
		Ok(endpoint) => endpoint,
		Err(err) => {
			tracing::warn!(error = %err, "API proxy unavailable");
			return outcome(false, observed.state, Some(err.to_string()));
		}
	};

	let payload = match stage.stage(&target, observed.object, FinalizerField::Spec) {
		Ok(path) => path,
		Err(err) => return outcome(false, observed.state, Some(err.to_string())),
	};

	let detail = match retry_transient(|| api.finalize(&target, &endpoint, &payload)).await {
		Ok(FinalizeResponse::Rejected { status, reason }) => {
			Some(format!("finalize rejected ({status}): {reason}"))
		}
		Ok(response) if !response.confirms("Namespace") => {
			Some("finalize did not echo the namespace".to_string())
		}
		Ok(_) | Err(ApiError::NotFound(_)) => None,
		Err(err) => Some(err.to_string()),
	};

	sleep(settle).await;
	let final_state = verify(api, &target).await;
	if final_state != ResourceState::Gone {
		tracing::warn!(namespace, state = %final_state, "namespace not reclaimed");
	}
	outcome(true, final_state, detail)
}

/// Delete the namespace normally, finalizing it through the proxy if it lingers.
#[instrument(skip(api, proxy, stage, delete_timeout, settle))]
pub async fn delete_namespace<A: ClusterApi, L: TunnelLauncher>(
	api: &A,
	proxy: &mut ProxyManager<L>,
	stage: &PayloadStage,
	namespace: &str,
	delete_timeout: Duration,
	settle: Duration,
) -> NamespaceOutcome {
	let target = ResourceRef::namespace_object(namespace);

	let call = retry_transient(|| api.delete(&target, None));
	let detail = match timeout(delete_timeout, call).await {
		Ok(Ok(()) | Err(ApiError::NotFound(_))) => None,
		Ok(Err(err)) => Some(err.to_string()),
		Err(_) => Some(format!("delete did not return within {delete_timeout:?}")),
	};

	sleep(settle).await;
	let state = verify(api, &target).await;
	if state == ResourceState::Gone {
		return NamespaceOutcome {
			name: namespace.to_string(),
			attempted: true,
			final_state: state,
			detail,
		};
	}

	tracing::info!(namespace, %state, "namespace still present, finalizing");
	let mut outcome = finalize_namespace(api, proxy, stage, namespace, settle).await;
	outcome.attempted = true;
	outcome
}

async fn verify<A: ClusterApi>(api: &A, target: &ResourceRef) -> ResourceState {
	match fetch(api, target).await {
		Ok(None) => ResourceState::Gone,
		Ok(Some(observed)) => observed.state,
		Err(_) => ResourceState::Unknown,
	}
}
