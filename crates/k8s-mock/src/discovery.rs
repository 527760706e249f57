//! Mock Kubernetes API discovery types.

use std::collections::HashMap;

/// Discovery mode for the mock server.
#[derive(Clone, Copy, Default)]
pub enum DiscoveryMode {
	/// Support aggregated discovery (APIGroupDiscoveryList).
	#[default]
	Aggregated,
	/// Return 406 for aggregated discovery, forcing fallback to legacy endpoints.
	Legacy,
}

/// Pre-configured discovery responses.
pub struct MockDiscovery {
	pub core_resources: Vec<MockApiResource>,
	pub group_resources: HashMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		Self {
			core_resources: vec![
				MockApiResource::namespaced("configmaps", "ConfigMap"),
				MockApiResource::namespaced("secrets", "Secret"),
				MockApiResource::namespaced("services", "Service"),
				MockApiResource::namespaced("pods", "Pod"),
				MockApiResource::namespaced("events", "Event")
					.with_verbs(&["create", "get", "list", "watch"]),
				MockApiResource::cluster_scoped("namespaces", "Namespace"),
			],
			group_resources: HashMap::from([
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("replicasets", "ReplicaSet"),
						MockApiResource::namespaced("statefulsets", "StatefulSet"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
					],
				),
				(
					"example.io/v1".to_string(),
					vec![MockApiResource::namespaced("widgets", "Widget")],
				),
			]),
		}
	}
}

impl MockDiscovery {
	/// Find a resource by group version (`v1`, `apps/v1`) and plural name.
	pub fn find(&self, group_version: &str, plural: &str) -> Option<&MockApiResource> {
		self.resources_for(group_version)?
			.iter()
			.find(|r| r.name == plural)
	}

	/// Find a resource by group version and kind.
	pub fn find_kind(&self, group_version: &str, kind: &str) -> Option<&MockApiResource> {
		self.resources_for(group_version)?
			.iter()
			.find(|r| r.kind == kind)
	}

	fn resources_for(&self, group_version: &str) -> Option<&Vec<MockApiResource>> {
		if group_version.contains('/') {
			self.group_resources.get(group_version)
		} else if group_version == "v1" {
			Some(&self.core_resources)
		} else {
			None
		}
	}
}

const ALL_VERBS: &[&str] = &[
	"create", "delete", "get", "list", "patch", "update", "watch",
];

/// A mock API resource definition.
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
	pub verbs: Vec<String>,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: true,
			verbs: ALL_VERBS.iter().map(|v| (*v).to_string()).collect(),
		}
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self {
			namespaced: false,
			..Self::namespaced(name, kind)
		}
	}

	/// Replace the advertised verbs.
	pub fn with_verbs(mut self, verbs: &[&str]) -> Self {
		self.verbs = verbs.iter().map(|v| (*v).to_string()).collect();
		self
	}
}
