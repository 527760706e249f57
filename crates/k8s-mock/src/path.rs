//! Kubernetes REST path parsing.

/// Subresources the mock understands. Anything else after a resource name is
/// treated as an unknown subresource.
const SUBRESOURCES: &[&str] = &["finalize", "status"];

/// A parsed API request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
	/// Collection path the object lives under, e.g.
	/// `/api/v1/namespaces/default/configmaps` or `/api/v1/namespaces`.
	pub collection: String,
	/// `v1` or `apps/v1`.
	pub group_version: String,
	/// Plural resource name.
	pub plural: String,
	pub namespace: Option<String>,
	pub name: Option<String>,
	pub subresource: Option<String>,
}

impl ResourcePath {
	/// Parse a request path.
	///
	/// Examples:
	/// - `/api/v1/namespaces/default/configmaps` -> collection, namespaced
	/// - `/apis/apps/v1/namespaces/default/deployments/web` -> single object
	/// - `/api/v1/namespaces/ns1` -> the namespace object itself
	/// - `/api/v1/namespaces/ns1/finalize` -> namespace finalize subresource
	pub fn parse(path: &str) -> Option<Self> {
		let segments: Vec<&str> = path
			.trim_matches('/')
			.split('/')
			.filter(|s| !s.is_empty())
			.collect();

		let (prefix_len, group_version) = match segments.as_slice() {
			["api", version, ..] => (2, (*version).to_string()),
			["apis", group, version, ..] => (3, format!("{group}/{version}")),
			_ => return None,
		};
		let prefix = format!("/{}", segments[..prefix_len].join("/"));
		let rest = &segments[prefix_len..];

		let namespaced_collection =
			rest.len() >= 3 && rest[0] == "namespaces" && !SUBRESOURCES.contains(&rest[2]);

		let (namespace, rest) = if namespaced_collection {
			(Some(rest[1].to_string()), &rest[2..])
		} else {
			(None, rest)
		};

		let (plural, name, subresource) = match rest {
			[plural] => (*plural, None, None),
			[plural, name] => (*plural, Some((*name).to_string()), None),
			[plural, name, sub] => (
				*plural,
				Some((*name).to_string()),
				Some((*sub).to_string()),
			),
			_ => return None,
		};

		let collection = match &namespace {
			Some(ns) => format!("{prefix}/namespaces/{ns}/{plural}"),
			None => format!("{prefix}/{plural}"),
		};

		Some(Self {
			collection,
			group_version,
			plural: plural.to_string(),
			namespace,
			name,
			subresource,
		})
	}

	/// The storage key of a single object.
	pub fn key(&self) -> Option<(String, String)> {
		self.name
			.as_ref()
			.map(|name| (self.collection.clone(), name.clone()))
	}
}

/// Extract a cluster-wide path from a namespaced API path.
///
/// Examples:
/// - `/api/v1/namespaces/default/configmaps` -> Some(`/api/v1/configmaps`)
/// - `/apis/apps/v1/namespaces/default/deployments` -> Some(`/apis/apps/v1/deployments`)
/// - `/api/v1/namespaces` -> None (already cluster-wide for namespaces)
pub fn extract_cluster_wide_path(path: &str) -> Option<String> {
	let ns_idx = path.find("/namespaces/")?;
	let before_ns = &path[..ns_idx];
	let after_ns = &path[ns_idx + "/namespaces/".len()..];

	let slash_idx = after_ns.find('/')?;
	Some(format!("{}{}", before_ns, &after_ns[slash_idx..]))
}
