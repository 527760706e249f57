//! Kubernetes API resource discovery.
//!
//! Enumerates the namespaced resource types a session can act on, then the
//! instances of each type within a namespace. Kinds that cannot be listed are
//! recorded as skipped rather than dropped.

use std::collections::HashSet;

use kube::{discovery::Scope, Client, Discovery};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use super::{
	api::{retry_transient, ApiError, ClusterApi},
	ResourceKind, ResourceRef, ResourceScope,
};

/// Errors that can occur during API resource discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("full API discovery failed")]
	FullDiscovery(#[source] kube::Error),
}

/// Which verbs a kind must support to be considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
	/// Namespaced kinds with `list`.
	ScanOnly,
	/// Namespaced kinds with `list` and `patch`.
	FixCapable,
}

impl KindFilter {
	pub fn accepts(self, kind: &ResourceKind) -> bool {
		if kind.scope != ResourceScope::Namespaced || !kind.supports("list") {
			return false;
		}
		match self {
			Self::ScanOnly => true,
			Self::FixCapable => kind.supports("patch"),
		}
	}
}

/// A kind whose instances could not be enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedKind {
	pub kind: String,
	pub reason: String,
}

/// Everything discovered in one namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceInventory {
	pub kinds: Vec<ResourceKind>,
	pub instances: Vec<ResourceRef>,
	pub skipped: Vec<SkippedKind>,
}

/// Query the cluster's discovery API.
///
/// Uses the Aggregated Discovery API (K8s 1.26+) which requires only 2 API calls,
/// falling back to full discovery on older clusters. Only the recommended
/// version of each group is returned.
#[instrument(skip(client))]
pub async fn run_discovery(client: &Client) -> Result<Vec<ResourceKind>, DiscoveryError> {
	let discovery = match Discovery::new(client.clone()).run_aggregated().await {
		Ok(discovery) => {
			tracing::debug!("using aggregated discovery");
			discovery
		}
		Err(e) => {
			tracing::debug!(error = %e, "aggregated discovery not available, using full discovery");
			Discovery::new(client.clone())
				.run()
				.await
				.map_err(DiscoveryError::FullDiscovery)?
		}
	};

	let mut kinds = Vec::new();
	for group in discovery.groups() {
		for (ar, caps) in group.recommended_resources() {
			let scope = match caps.scope {
				Scope::Namespaced => ResourceScope::Namespaced,
				Scope::Cluster => ResourceScope::ClusterWide,
			};
			kinds.push(ResourceKind {
				group: ar.group,
				version: ar.version,
				kind: ar.kind,
				plural: ar.plural,
				scope,
				verbs: caps.operations,
			});
		}
	}
	Ok(kinds)
}

/// Namespaced kinds accepted by `filter`, sorted by group then plural.
#[instrument(skip(api))]
pub async fn list_kinds<A: ClusterApi>(
	api: &A,
	filter: KindFilter,
) -> Result<Vec<ResourceKind>, ApiError> {
	let mut kinds: Vec<_> = retry_transient(|| api.discover_kinds())
		.await?
		.into_iter()
		.filter(|k| filter.accepts(k))
		.collect();
	kinds.sort_by(|a, b| (&a.group, &a.plural).cmp(&(&b.group, &b.plural)));
	kinds.dedup_by(|a, b| a.group == b.group && a.plural == b.plural);

	tracing::debug!(count = kinds.len(), "discovered kinds");
	Ok(kinds)
}

/// Instances of `kind` in `namespace`, or the reason the kind was skipped.
#[instrument(skip(api, kind), fields(kind = %kind.qualified_name()))]
pub async fn list_instances<A: ClusterApi>(
	api: &A,
	namespace: &str,
	kind: &ResourceKind,
) -> Result<Vec<ResourceRef>, SkippedKind> {
	match retry_transient(|| api.list(namespace, kind)).await {
		Ok(mut refs) => {
			refs.sort_by(|a, b| a.name.cmp(&b.name));
			Ok(refs)
		}
		Err(err) => {
			tracing::warn!(error = %err, "skipping kind");
			Err(SkippedKind {
				kind: kind.qualified_name(),
				reason: err.to_string(),
			})
		}
	}
}

/// Discover every instance in `namespace`, de-duplicating objects served
/// through more than one API group by uid.
#[instrument(skip(api))]
pub async fn discover_namespace<A: ClusterApi>(
	api: &A,
	namespace: &str,
	filter: KindFilter,
) -> Result<NamespaceInventory, ApiError> {
	let kinds = list_kinds(api, filter).await?;

	let mut seen = HashSet::new();
	let mut inventory = NamespaceInventory::default();

	for kind in &kinds {
		match list_instances(api, namespace, kind).await {
			Ok(refs) => {
				for r in refs {
					if let Some(uid) = &r.uid {
						if !seen.insert(uid.clone()) {
							tracing::debug!(resource = %r, "skipping duplicate");
							continue;
						}
					}
					inventory.instances.push(r);
				}
			}
			Err(skipped) => inventory.skipped.push(skipped),
		}
	}

	inventory.kinds = kinds;
	Ok(inventory)
}

/// Resolve a user-supplied kind such as `pods`, `pod`, `Pod` or `deployments.apps`.
pub fn resolve_kind<'a>(kinds: &'a [ResourceKind], spec: &str) -> Option<&'a ResourceKind> {
	let (name, group) = match spec.split_once('.') {
		Some((name, group)) => (name, Some(group)),
		None => (spec, None),
	};

	kinds.iter().find(|k| {
		let name_matches = k.plural.eq_ignore_ascii_case(name) || k.kind.eq_ignore_ascii_case(name);
		name_matches && group.is_none_or(|g| k.group == g)
	})
}
