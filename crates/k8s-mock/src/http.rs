//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects are kept in shared state and follow the deletion rules
//! of a real API server: a DELETE of an object that still carries finalizers
//! only sets `metadata.deletionTimestamp`, and the object disappears once a
//! later PATCH or `finalize` PUT leaves it without finalizers.

use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
	time::Duration,
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace};
use wiremock::{
	matchers::{header_regex, method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::{DiscoveryMode, MockApiResource, MockDiscovery},
	helpers::{
		has_blocking_finalizers, is_terminating, mark_terminating, merge_json,
		strip_strategic_merge_directives,
	},
	path::{extract_cluster_wide_path, ResourcePath},
};

/// Type alias for the shared mutable resources map.
pub type SharedResources = Arc<RwLock<HashMap<(String, String), Value>>>;

/// How long a "hung" request takes to answer. Far longer than any client-side
/// timeout used in tests.
const HUNG_REQUEST_DELAY: Duration = Duration::from_secs(60);

const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	#[builder(default)]
	discovery_mode: DiscoveryMode,
	/// Resource types served by discovery and used to derive API paths.
	#[builder(default)]
	discovery: MockDiscovery,
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind using the discovery data.
	#[builder(default)]
	resources: Vec<Value>,
	/// Object names whose DELETE is accepted but never answered in time.
	#[builder(default)]
	hang_deletes: Vec<String>,
	/// Plural resource names for which every PATCH is forbidden.
	#[builder(default)]
	forbid_patch: Vec<String>,
	/// Answer every `finalize` PUT with 409 Conflict.
	#[builder(default)]
	reject_finalize: bool,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	/// Shared mutable resources state.
	resources: SharedResources,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;

		debug!(uri = %server.uri(), "Started mock K8s server");

		// Build resources map with API paths derived from discovery
		let mut resources: HashMap<(String, String), Value> = HashMap::new();

		for manifest in self.resources {
			if let Some((api_path, name)) = api_path_for_manifest(&manifest, &self.discovery) {
				trace!(api_path = %api_path, name = %name, "Registered resource");
				resources.insert((api_path, name), manifest);
			}
		}

		// Add default namespace if not present
		let ns_key = ("/api/v1/namespaces".to_string(), "default".to_string());
		resources.entry(ns_key).or_insert_with(|| {
			json!({
				"apiVersion": "v1",
				"kind": "Namespace",
				"metadata": {
					"name": "default"
				}
			})
		});

		let shared_resources = Arc::new(RwLock::new(resources));
		let faults = Arc::new(Faults {
			hang_deletes: self.hang_deletes,
			forbid_patch: self.forbid_patch,
			reject_finalize: self.reject_finalize,
		});
		let discovery = Arc::new(self.discovery);

		mount_version(&server).await;
		mount_health(&server).await;
		mount_discovery(&server, &discovery, self.discovery_mode).await;
		mount_resources(&server, &shared_resources, &discovery, &faults).await;

		RunningHttpMockK8sServer {
			server,
			resources: shared_resources,
		}
	}
}

/// Fault injection switches shared with the request handlers.
struct Faults {
	hang_deletes: Vec<String>,
	forbid_patch: Vec<String>,
	reject_finalize: bool,
}

/// Derive the API path for a manifest using discovery data.
fn api_path_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<(String, String)> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let name = manifest.pointer("/metadata/name")?.as_str()?.to_string();
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str);

	let resource = discovery.find_kind(api_version, kind)?;
	let prefix = if api_version.contains('/') {
		format!("/apis/{api_version}")
	} else {
		format!("/api/{api_version}")
	};

	let path = if resource.namespaced {
		let ns = namespace.unwrap_or("default");
		format!("{}/namespaces/{}/{}", prefix, ns, resource.name)
	} else {
		format!("{}/{}", prefix, resource.name)
	};

	Some((path, name))
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// Current stored state of an object, if it still exists.
	///
	/// `collection` is the API collection path, e.g. `/api/v1/namespaces/ns1/pods`.
	pub fn object(&self, collection: &str, name: &str) -> Option<Value> {
		self.resources
			.read()
			.expect("resources lock poisoned")
			.get(&(collection.to_string(), name.to_string()))
			.cloned()
	}

	/// Whether an object still exists.
	pub fn contains(&self, collection: &str, name: &str) -> bool {
		self.object(collection, name).is_some()
	}

	/// All requests received so far as `(method, path)` pairs.
	pub async fn requests(&self) -> Vec<(String, String)> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.iter()
			.map(|r| (r.method.to_string(), r.url.path().to_string()))
			.collect()
	}

	/// Number of requests that could have changed cluster state.
	pub async fn mutating_requests(&self) -> usize {
		self.requests()
			.await
			.iter()
			.filter(|(m, _)| matches!(m.as_str(), "DELETE" | "PATCH" | "PUT" | "POST"))
			.count()
	}
}

fn status_response(code: u16, reason: &str, message: &str) -> ResponseTemplate {
	ResponseTemplate::new(code).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code
	}))
}

fn list_response(items: Vec<Value>) -> ResponseTemplate {
	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "List",
		"apiVersion": "v1",
		"metadata": {"resourceVersion": "1"},
		"items": items
	}))
}

/// Remove the object if it is being deleted and nothing holds it anymore.
///
/// Returns the object as it was last seen.
fn reap_if_released(
	resources: &mut HashMap<(String, String), Value>,
	key: &(String, String),
) -> Option<Value> {
	let object = resources.get(key)?;
	if is_terminating(object) && !has_blocking_finalizers(object) {
		debug!(collection = %key.0, name = %key.1, "object released, removing");
		return resources.remove(key);
	}
	Some(object.clone())
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "28",
			"gitVersion": "v1.28.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-01-01T00:00:00Z",
			"goVersion": "go1.21.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

/// `/healthz`, so the server can also stand in for a local API proxy.
async fn mount_health(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/healthz"))
		.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
		.mount(server)
		.await;
}

fn aggregated_resource(r: &MockApiResource, group: &str, version: &str) -> Value {
	json!({
		"resource": r.name,
		"responseKind": {
			"group": group,
			"version": version,
			"kind": r.kind
		},
		"scope": if r.namespaced { "Namespaced" } else { "Cluster" },
		"verbs": r.verbs,
	})
}

fn legacy_resource(r: &MockApiResource) -> Value {
	json!({
		"name": r.name,
		"singularName": "",
		"namespaced": r.namespaced,
		"kind": r.kind,
		"verbs": r.verbs,
	})
}

async fn mount_discovery(server: &MockServer, discovery: &MockDiscovery, mode: DiscoveryMode) {
	let aggregated_core_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": [{
			"metadata": {
				"name": ""
			},
			"versions": [{
				"version": "v1",
				"resources": discovery
					.core_resources
					.iter()
					.map(|r| aggregated_resource(r, "", "v1"))
					.collect::<Vec<_>>(),
				"freshness": "Current"
			}]
		}]
	});

	let aggregated_groups: Vec<_> = discovery
		.group_resources
		.iter()
		.map(|(gv, rs)| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"metadata": {
					"name": group
				},
				"versions": [{
					"version": version,
					"resources": rs
						.iter()
						.map(|r| aggregated_resource(r, group, version))
						.collect::<Vec<_>>(),
					"freshness": "Current"
				}]
			})
		})
		.collect();

	let aggregated_apis_body = json!({
		"kind": "APIGroupDiscoveryList",
		"apiVersion": "apidiscovery.k8s.io/v2",
		"items": aggregated_groups
	});

	// The Content-Type must indicate aggregated discovery format for clients to parse it
	const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
		"application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

	match mode {
		DiscoveryMode::Aggregated => {
			// set_body_json would overwrite the Content-Type
			let core_body = serde_json::to_vec(&aggregated_core_body)
				.expect("serializing discovery JSON should never fail");
			let apis_body = serde_json::to_vec(&aggregated_apis_body)
				.expect("serializing discovery JSON should never fail");

			Mock::given(method("GET"))
				.and(path("/api"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(
					ResponseTemplate::new(200)
						.set_body_raw(core_body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
				)
				.mount(server)
				.await;

			Mock::given(method("GET"))
				.and(path("/apis"))
				.and(header_regex("accept", "apidiscovery"))
				.respond_with(
					ResponseTemplate::new(200)
						.set_body_raw(apis_body, AGGREGATED_DISCOVERY_CONTENT_TYPE),
				)
				.mount(server)
				.await;
		}
		DiscoveryMode::Legacy => {
			for endpoint in ["/api", "/apis"] {
				Mock::given(method("GET"))
					.and(path(endpoint))
					.and(header_regex("accept", "apidiscovery"))
					.respond_with(ResponseTemplate::new(406))
					.mount(server)
					.await;
			}
		}
	}

	// Legacy discovery endpoints (fallback)
	Mock::given(method("GET"))
		.and(path("/api"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIVersions",
			"versions": ["v1"],
			"serverAddressByClientCIDRs": []
		})))
		.mount(server)
		.await;

	let groups: Vec<_> = discovery
		.group_resources
		.keys()
		.map(|gv| {
			let (group, version) = gv.split_once('/').unwrap_or(("", gv));
			json!({
				"name": group,
				"versions": [{"groupVersion": gv, "version": version}],
				"preferredVersion": {"groupVersion": gv, "version": version}
			})
		})
		.collect();

	Mock::given(method("GET"))
		.and(path("/apis"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIGroupList",
			"apiVersion": "v1",
			"groups": groups
		})))
		.mount(server)
		.await;

	Mock::given(method("GET"))
		.and(path("/api/v1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"kind": "APIResourceList",
			"apiVersion": "v1",
			"groupVersion": "v1",
			"resources": discovery.core_resources.iter().map(legacy_resource).collect::<Vec<_>>()
		})))
		.mount(server)
		.await;

	for (gv, rs) in &discovery.group_resources {
		Mock::given(method("GET"))
			.and(path(format!("/apis/{}", gv)))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"kind": "APIResourceList",
				"apiVersion": "v1",
				"groupVersion": gv,
				"resources": rs.iter().map(legacy_resource).collect::<Vec<_>>()
			})))
			.mount(server)
			.await;
	}
}

async fn mount_resources(
	server: &MockServer,
	resources: &SharedResources,
	discovery: &Arc<MockDiscovery>,
	faults: &Arc<Faults>,
) {
	mount_delete(server, Arc::clone(resources), Arc::clone(faults)).await;
	mount_patch(server, Arc::clone(resources), Arc::clone(faults)).await;
	mount_put(server, Arc::clone(resources), Arc::clone(faults)).await;
	mount_post(server, Arc::clone(resources)).await;
	mount_get(server, Arc::clone(resources), Arc::clone(discovery)).await;
}

/// DELETE: objects holding finalizers are only marked as terminating.
async fn mount_delete(server: &MockServer, resources: SharedResources, faults: Arc<Faults>) {
	Mock::given(method("DELETE"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(key) = ResourcePath::parse(req.url.path()).and_then(|p| p.key()) else {
				return status_response(405, "MethodNotAllowed", "collection delete not supported");
			};

			let mut resources = resources.write().expect("resources lock poisoned");
			let Some(object) = resources.get_mut(&key) else {
				return status_response(404, "NotFound", &format!("{} not found", key.1));
			};

			let body = if has_blocking_finalizers(object) {
				mark_terminating(object);
				object.clone()
			} else {
				resources.remove(&key);
				json!({"kind": "Status", "apiVersion": "v1", "status": "Success"})
			};

			let response = ResponseTemplate::new(200).set_body_json(body);
			if faults.hang_deletes.contains(&key.1) {
				debug!(name = %key.1, "delete accepted, response hung");
				response.set_delay(HUNG_REQUEST_DELAY)
			} else {
				response
			}
		})
		.mount(server)
		.await;
}

/// PATCH: merge (and strategic) patches or JSON patches, persisted unless
/// `dryRun` is set.
async fn mount_patch(server: &MockServer, resources: SharedResources, faults: Arc<Faults>) {
	Mock::given(method("PATCH"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(target) = ResourcePath::parse(req.url.path()) else {
				return status_response(404, "NotFound", "unknown path");
			};
			let Some(key) = target.key() else {
				return status_response(405, "MethodNotAllowed", "collection patch not supported");
			};

			if faults.forbid_patch.contains(&target.plural) {
				return status_response(
					403,
					"Forbidden",
					&format!("cannot patch resource \"{}\"", target.plural),
				);
			}

			let is_dry_run = req.url.query().unwrap_or("").contains("dryRun");
			let is_json_patch = req
				.headers
				.get("content-type")
				.and_then(|v| v.to_str().ok())
				.is_some_and(|ct| ct.starts_with(JSON_PATCH_CONTENT_TYPE));
			let mut resources = resources.write().expect("resources lock poisoned");
			let Some(existing) = resources.get(&key).cloned() else {
				return status_response(404, "NotFound", &format!("{} not found", key.1));
			};

			let patched = if is_json_patch {
				let ops: json_patch::Patch = match serde_json::from_slice(&req.body) {
					Ok(ops) => ops,
					Err(e) => return status_response(400, "BadRequest", &e.to_string()),
				};
				let mut patched = existing;
				if let Err(e) = json_patch::patch(&mut patched, &ops.0) {
					return status_response(422, "Invalid", &e.to_string());
				}
				patched
			} else {
				let patch: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);
				strip_strategic_merge_directives(merge_json(existing, patch))
			};

			if is_dry_run {
				return ResponseTemplate::new(200).set_body_json(patched);
			}

			resources.insert(key.clone(), patched.clone());
			reap_if_released(&mut resources, &key);
			ResponseTemplate::new(200).set_body_json(patched)
		})
		.mount(server)
		.await;
}

/// PUT: full replacement, or the `finalize` subresource which only takes the
/// finalizer lists from the request body.
async fn mount_put(server: &MockServer, resources: SharedResources, faults: Arc<Faults>) {
	Mock::given(method("PUT"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(target) = ResourcePath::parse(req.url.path()) else {
				return status_response(404, "NotFound", "unknown path");
			};
			let Some(key) = target.key() else {
				return status_response(405, "MethodNotAllowed", "collection put not supported");
			};
			let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);

			let mut resources = resources.write().expect("resources lock poisoned");
			let Some(existing) = resources.get_mut(&key) else {
				return status_response(404, "NotFound", &format!("{} not found", key.1));
			};

			match target.subresource.as_deref() {
				Some("finalize") => {
					if faults.reject_finalize {
						return status_response(
							409,
							"Conflict",
							"the object has been modified; please apply your changes",
						);
					}
					for (section, field) in [("metadata", "finalizers"), ("spec", "finalizers")] {
						let requested = body.get(section).and_then(|s| s.get(field)).cloned();
						if let Some(section) = existing.get_mut(section).and_then(Value::as_object_mut)
						{
							match requested {
								Some(list) => section.insert(field.to_string(), list),
								None => section.remove(field),
							};
						}
					}
				}
				Some(other) => {
					return status_response(
						404,
						"NotFound",
						&format!("subresource {other} not supported"),
					);
				}
				None => *existing = body,
			}

			let result = existing.clone();
			reap_if_released(&mut resources, &key);
			ResponseTemplate::new(200).set_body_json(result)
		})
		.mount(server)
		.await;
}

/// POST for create - echo back the request body and optionally persist.
async fn mount_post(server: &MockServer, resources: SharedResources) {
	Mock::given(method("POST"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let is_dry_run = req.url.query().unwrap_or("").contains("dryRun");
			let body: Value = serde_json::from_slice(&req.body).unwrap_or(Value::Null);

			let name = body
				.pointer("/metadata/name")
				.and_then(Value::as_str)
				.unwrap_or("")
				.to_string();

			if !is_dry_run && !name.is_empty() {
				let mut resources = resources.write().expect("resources lock poisoned");
				resources.insert((req.url.path().to_string(), name), body.clone());
			}

			ResponseTemplate::new(200).set_body_json(body)
		})
		.mount(server)
		.await;
}

/// GET for single objects and collections.
async fn mount_get(server: &MockServer, resources: SharedResources, discovery: Arc<MockDiscovery>) {
	Mock::given(method("GET"))
		.and(path_regex(r"^/api(s)?/.*"))
		.respond_with(move |req: &Request| {
			let Some(target) = ResourcePath::parse(req.url.path()) else {
				return status_response(404, "NotFound", "unknown path");
			};
			if discovery
				.find(&target.group_version, &target.plural)
				.is_none()
			{
				return status_response(
					404,
					"NotFound",
					&format!("the server could not find the requested resource ({})", target.plural),
				);
			}

			let resources = resources.read().expect("resources lock poisoned");

			if let Some(key) = target.key() {
				return match resources.get(&key) {
					Some(object) => ResponseTemplate::new(200).set_body_json(object.clone()),
					None => status_response(404, "NotFound", &format!("{} not found", key.1)),
				};
			}

			let items: Vec<_> = resources
				.iter()
				.filter(|((collection, _), _)| {
					*collection == target.collection
						|| (target.namespace.is_none()
							&& extract_cluster_wide_path(collection).as_deref()
								== Some(target.collection.as_str()))
				})
				.map(|(_, v)| v.clone())
				.collect();

			list_response(items)
		})
		.mount(server)
		.await;
}
