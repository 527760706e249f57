//! Kubernetes API access for the reclamation engine.
//!
//! This module provides native Kubernetes API access using kube-rs,
//! avoiding the need to shell out to kubectl or oc.

use std::fmt;

use kube::{core::GroupVersionKind, discovery::ApiResource};
use serde::Serialize;

pub mod api;
pub mod client;
pub mod discovery;

/// Kubernetes API resource scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceScope {
	/// Resource is namespaced (e.g., Deployment, ConfigMap).
	Namespaced,

	/// Resource is cluster-wide (e.g., Namespace, ClusterRole).
	ClusterWide,
}

/// A resource type discovered on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceKind {
	/// API group, empty for the core group.
	pub group: String,
	pub version: String,
	/// CamelCase kind, e.g. `ReplicaSet`.
	pub kind: String,
	/// Plural resource name, e.g. `replicasets`.
	pub plural: String,
	pub scope: ResourceScope,
	pub verbs: Vec<String>,
}

impl ResourceKind {
	/// Whether the API advertises `verb` for this resource.
	pub fn supports(&self, verb: &str) -> bool {
		self.verbs.iter().any(|v| v == verb)
	}

	/// `v1` or `apps/v1`.
	pub fn group_version(&self) -> String {
		group_version(&self.group, &self.version)
	}

	/// `pods` or `replicasets.apps`, as printed by `oc api-resources -o name`.
	pub fn qualified_name(&self) -> String {
		if self.group.is_empty() {
			self.plural.clone()
		} else {
			format!("{}.{}", self.plural, self.group)
		}
	}

	pub fn api_resource(&self) -> ApiResource {
		let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
		ApiResource::from_gvk_with_plural(&gvk, &self.plural)
	}
}

/// Identifies a single API object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
	/// Plural resource name, e.g. `pods`.
	pub kind: String,
	pub api_group: String,
	pub api_version: String,
	pub name: String,
	/// Absent for cluster-scoped objects such as the namespace itself.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
	/// Server-assigned uid, when known.
	#[serde(skip)]
	pub uid: Option<String>,
}

impl ResourceRef {
	/// Reference a namespaced instance of `kind`.
	pub fn namespaced(kind: &ResourceKind, namespace: &str, name: &str) -> Self {
		Self {
			kind: kind.plural.clone(),
			api_group: kind.group.clone(),
			api_version: kind.version.clone(),
			name: name.to_string(),
			namespace: Some(namespace.to_string()),
			uid: None,
		}
	}

	/// Reference the namespace object itself.
	pub fn namespace_object(name: &str) -> Self {
		Self {
			kind: "namespaces".to_string(),
			api_group: String::new(),
			api_version: "v1".to_string(),
			name: name.to_string(),
			namespace: None,
			uid: None,
		}
	}

	pub fn with_uid(mut self, uid: Option<String>) -> Self {
		self.uid = uid;
		self
	}

	/// `v1` or `apps/v1`.
	pub fn group_version(&self) -> String {
		group_version(&self.api_group, &self.api_version)
	}

	pub fn is_namespace(&self) -> bool {
		self.kind == "namespaces" && self.api_group.is_empty()
	}

	/// kube-rs resource description used to build dynamic APIs.
	///
	/// Only the plural is known here, which is all URL construction needs.
	pub fn api_resource(&self) -> ApiResource {
		let gvk = GroupVersionKind::gvk(&self.api_group, &self.api_version, &self.kind);
		ApiResource::from_gvk_with_plural(&gvk, &self.kind)
	}

	/// REST path of the object, e.g. `/apis/apps/v1/namespaces/ns1/replicasets/web`.
	pub fn url_path(&self) -> String {
		let prefix = if self.api_group.is_empty() {
			format!("/api/{}", self.api_version)
		} else {
			format!("/apis/{}/{}", self.api_group, self.api_version)
		};
		match &self.namespace {
			Some(ns) => format!("{}/namespaces/{}/{}/{}", prefix, ns, self.kind, self.name),
			None => format!("{}/{}/{}", prefix, self.kind, self.name),
		}
	}
}

impl fmt::Display for ResourceRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.api_group.is_empty() {
			write!(f, "{}/{}", self.kind, self.name)
		} else {
			write!(f, "{}.{}/{}", self.kind, self.api_group, self.name)
		}
	}
}

/// State of an object as seen by the most recent API read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceState {
	Present,
	/// `metadata.deletionTimestamp` is set but the object still exists.
	Terminating,
	Gone,
	/// The read failed with a transient error.
	Unknown,
}

impl fmt::Display for ResourceState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Present => "Present",
			Self::Terminating => "Terminating",
			Self::Gone => "Gone",
			Self::Unknown => "Unknown",
		};
		f.write_str(s)
	}
}

/// An object returned by a successful `get`.
#[derive(Debug, Clone)]
pub struct Observed {
	pub state: ResourceState,
	pub object: serde_json::Value,
}

impl Observed {
	/// Build from a raw object, deriving the state from its deletion timestamp.
	pub fn from_object(object: serde_json::Value) -> Self {
		let state = if object.pointer("/metadata/deletionTimestamp").is_some() {
			ResourceState::Terminating
		} else {
			ResourceState::Present
		};
		Self { state, object }
	}

	/// `metadata.finalizers`, empty when absent.
	pub fn finalizers(&self) -> Vec<String> {
		self.object
			.pointer("/metadata/finalizers")
			.and_then(serde_json::Value::as_array)
			.map(|list| {
				list.iter()
					.filter_map(|f| f.as_str().map(str::to_string))
					.collect()
			})
			.unwrap_or_default()
	}

	/// The object's `kind` field.
	pub fn kind(&self) -> Option<&str> {
		self.object.get("kind").and_then(serde_json::Value::as_str)
	}
}

fn group_version(group: &str, version: &str) -> String {
	if group.is_empty() {
		version.to_string()
	} else {
		format!("{group}/{version}")
	}
}
