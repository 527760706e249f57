//! Shared test utilities for kube-reclaim.
//!
//! [`FakeCluster`] is an in-memory [`ClusterApi`] with finalizer semantics and
//! per-object fault injection. [`FakeLauncher`] stands in for the proxy tunnel.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	path::Path,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, MutexGuard,
	},
	time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::{
	k8s::{
		api::{ApiError, ClusterApi, FinalizeResponse, FinalizerPatch},
		Observed, ResourceKind, ResourceRef, ResourceScope,
	},
	reclaim::{
		engine::EscalationSettings,
		proxy::{ProxyError, ProxySettings, TunnelLauncher, TunnelProcess},
	},
};

/// A namespaced kind supporting every verb the engine uses.
pub fn kind(group: &str, version: &str, kind: &str, plural: &str) -> ResourceKind {
	ResourceKind {
		group: group.to_string(),
		version: version.to_string(),
		kind: kind.to_string(),
		plural: plural.to_string(),
		scope: ResourceScope::Namespaced,
		verbs: ["create", "delete", "get", "list", "patch", "update"]
			.map(String::from)
			.to_vec(),
	}
}

pub fn pods() -> ResourceKind {
	kind("", "v1", "Pod", "pods")
}

pub fn fast_escalation() -> EscalationSettings {
	EscalationSettings {
		delete_timeout: Duration::from_millis(50),
		settle: Duration::from_millis(1),
	}
}

pub fn fast_proxy() -> ProxySettings {
	ProxySettings {
		ports: 20100..=20200,
		health_interval: Duration::from_millis(1),
		health_attempts: 3,
		shutdown_grace: Duration::from_millis(10),
	}
}

/// Calls the fake records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
	List,
	Get,
	Delete,
	ForceDelete,
	MergePatch,
	JsonPatch,
	Finalize,
}

impl FakeOp {
	fn is_mutating(self) -> bool {
		!matches!(self, Self::List | Self::Get)
	}
}

/// How a mutating call behaves for a given object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
	/// API server semantics: finalizers block removal.
	Natural,
	/// Accepted but changes nothing.
	Ineffective,
	/// Accepted and the object disappears.
	Remove,
	/// Rejected with 403.
	Forbidden,
	/// Applied naturally, but the call never returns.
	Hang,
}

type Key = (String, String, Option<String>, String);

struct Stored {
	object: Value,
	/// Reads that still return the object after it was removed.
	stale_reads: Option<usize>,
}

#[derive(Default)]
struct State {
	kinds: Vec<ResourceKind>,
	objects: BTreeMap<Key, Stored>,
	effects: HashMap<(String, FakeOp), Effect>,
	removal_lag: HashMap<String, usize>,
	forbidden_lists: HashSet<String>,
	aliases: HashMap<(String, String), String>,
	calls: Vec<(FakeOp, String)>,
	failing_gets: usize,
	payloads: Vec<Value>,
	interrupt: Option<(FakeOp, String, Arc<Notify>)>,
	next_uid: usize,
}

impl State {
	fn key(&self, target: &ResourceRef) -> Key {
		let group = self
			.aliases
			.get(&(target.api_group.clone(), target.kind.clone()))
			.cloned()
			.unwrap_or_else(|| target.api_group.clone());
		(group, target.kind.clone(), target.namespace.clone(), target.name.clone())
	}

	fn effect(&self, name: &str, op: FakeOp) -> Effect {
		self.effects
			.get(&(name.to_string(), op))
			.copied()
			.unwrap_or(Effect::Natural)
	}

	fn live(&mut self, key: &Key) -> Option<&mut Value> {
		self.objects
			.get_mut(key)
			.filter(|s| s.stale_reads.is_none())
			.map(|s| &mut s.object)
	}

	fn remove(&mut self, key: &Key) {
		let lag = self.removal_lag.get(&key.3).copied().unwrap_or(0);
		if lag == 0 {
			self.objects.remove(key);
			return;
		}
		if let Some(stored) = self.objects.get_mut(key) {
			mark_terminating(&mut stored.object);
			if let Some(metadata) = stored.object.get_mut("metadata").and_then(Value::as_object_mut) {
				metadata.remove("finalizers");
			}
			stored.stale_reads = Some(lag);
		}
	}

	/// Remove the object if it is terminating and nothing holds it.
	fn reap(&mut self, key: &Key) {
		let done = self
			.objects
			.get(key)
			.is_some_and(|s| is_terminating(&s.object) && !has_blocking_finalizers(&s.object));
		if done {
			self.remove(key);
		}
	}

	fn natural_delete(&mut self, key: &Key) {
		if let Some(object) = self.live(key) {
			if has_blocking_finalizers(object) {
				mark_terminating(object);
				return;
			}
		}
		self.remove(key);
	}
}

/// In-memory cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
	state: Arc<Mutex<State>>,
}

impl FakeCluster {
	pub fn new(kinds: Vec<ResourceKind>) -> Self {
		let fake = Self::default();
		fake.lock().kinds = kinds;
		fake
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap()
	}

	/// Insert a namespaced object with the given `metadata.finalizers`.
	pub fn insert(&self, plural: &str, namespace: &str, name: &str, finalizers: &[&str]) {
		let uid = {
			let mut state = self.lock();
			state.next_uid += 1;
			format!("uid-{}", state.next_uid)
		};
		self.insert_object(plural, namespace, name, &uid, finalizers);
	}

	pub fn insert_with_uid(&self, plural: &str, namespace: &str, name: &str, uid: &str) {
		self.insert_object(plural, namespace, name, uid, &[]);
	}

	fn insert_object(&self, plural: &str, namespace: &str, name: &str, uid: &str, finalizers: &[&str]) {
		let mut state = self.lock();
		let kind = state
			.kinds
			.iter()
			.find(|k| k.plural == plural)
			.cloned()
			.unwrap_or_else(|| panic!("unknown plural {plural}"));
		let mut object = json!({
			"apiVersion": kind.group_version(),
			"kind": kind.kind,
			"metadata": {"name": name, "namespace": namespace, "uid": uid},
		});
		if !finalizers.is_empty() {
			object["metadata"]["finalizers"] = json!(finalizers);
		}
		state.objects.insert(
			(kind.group, plural.to_string(), Some(namespace.to_string()), name.to_string()),
			Stored {
				object,
				stale_reads: None,
			},
		);
	}

	/// Insert a namespace, optionally already terminating, held by `spec.finalizers`.
	pub fn insert_namespace(&self, name: &str, terminating: bool, spec_finalizers: &[&str]) {
		let mut object = json!({
			"apiVersion": "v1",
			"kind": "Namespace",
			"metadata": {"name": name, "uid": format!("ns-{name}")},
			"spec": {"finalizers": spec_finalizers},
		});
		if terminating {
			mark_terminating(&mut object);
		}
		self.lock().objects.insert(
			(String::new(), "namespaces".to_string(), None, name.to_string()),
			Stored {
				object,
				stale_reads: None,
			},
		);
	}

	/// Set `deletionTimestamp` on every object called `name`.
	pub fn mark_terminating(&self, name: &str) {
		for stored in self.lock().objects.values_mut() {
			if stored.object["metadata"]["name"] == name {
				mark_terminating(&mut stored.object);
			}
		}
	}

	pub fn set_effect(&self, name: &str, op: FakeOp, effect: Effect) {
		self.lock().effects.insert((name.to_string(), op), effect);
	}

	/// Keep returning a removed object called `name` for `reads` more reads.
	pub fn set_removal_lag(&self, name: &str, reads: usize) {
		self.lock().removal_lag.insert(name.to_string(), reads);
	}

	pub fn forbid_list(&self, plural: &str) {
		self.lock().forbidden_lists.insert(plural.to_string());
	}

	/// Serve core-group `plural` objects under `group` as well.
	pub fn alias(&self, plural: &str, group: &str) {
		self.lock()
			.aliases
			.insert((group.to_string(), plural.to_string()), String::new());
	}

	/// Fail the next `count` reads with a transient error.
	pub fn fail_gets(&self, count: usize) {
		self.lock().failing_gets = count;
	}

	/// When `op` is called on `name`, notify the returned handle and never return.
	pub fn interrupt_on(&self, op: FakeOp, name: &str) -> Arc<Notify> {
		let notify = Arc::new(Notify::new());
		self.lock().interrupt = Some((op, name.to_string(), notify.clone()));
		notify
	}

	pub fn calls(&self, op: FakeOp) -> usize {
		self.lock().calls.iter().filter(|(o, _)| *o == op).count()
	}

	pub fn mutating_calls(&self) -> usize {
		self.lock()
			.calls
			.iter()
			.filter(|(o, _)| o.is_mutating())
			.count()
	}

	pub fn finalize_payloads(&self) -> Vec<Value> {
		self.lock().payloads.clone()
	}

	pub fn contains(&self, plural: &str, namespace: &str, name: &str) -> bool {
		self.lock().objects.iter().any(|((_, p, ns, n), s)| {
			p == plural && ns.as_deref() == Some(namespace) && n == name && s.stale_reads.is_none()
		})
	}

	pub fn pod_ref(&self, namespace: &str, name: &str) -> ResourceRef {
		ResourceRef::namespaced(&pods(), namespace, name)
	}

	/// Record the call, then stall forever if it is the interruption point.
	async fn checkpoint(&self, op: FakeOp, name: &str) {
		let notify = {
			let mut state = self.lock();
			state.calls.push((op, name.to_string()));
			state
				.interrupt
				.as_ref()
				.filter(|(o, n, _)| *o == op && n == name)
				.map(|(_, _, notify)| notify.clone())
		};
		if let Some(notify) = notify {
			notify.notify_one();
			std::future::pending::<()>().await;
		}
	}

	/// Apply the configured effect for a mutating call. `natural` performs
	/// the API server behavior and returns the call's result.
	async fn mutate<T>(
		&self,
		op: FakeOp,
		target: &ResourceRef,
		forbidden: T,
		natural: impl FnOnce(&mut State, &Key) -> Result<T, ApiError>,
		accepted: T,
	) -> Result<T, ApiError> {
		self.checkpoint(op, &target.name).await;

		let (result, hang) = {
			let mut state = self.lock();
			let key = state.key(target);
			if state.live(&key).is_none() {
				return Err(ApiError::NotFound(target.to_string()));
			}
			match state.effect(&target.name, op) {
				Effect::Forbidden => (Ok(forbidden), false),
				Effect::Ineffective => (Ok(accepted), false),
				Effect::Remove => {
					state.remove(&key);
					(Ok(accepted), false)
				}
				Effect::Natural => (natural(&mut state, &key), false),
				Effect::Hang => (natural(&mut state, &key), true),
			}
		};

		if hang {
			std::future::pending::<()>().await;
		}
		result
	}
}

impl ClusterApi for FakeCluster {
	async fn discover_kinds(&self) -> Result<Vec<ResourceKind>, ApiError> {
		Ok(self.lock().kinds.clone())
	}

	async fn list(&self, namespace: &str, kind: &ResourceKind) -> Result<Vec<ResourceRef>, ApiError> {
		self.checkpoint(FakeOp::List, &kind.plural).await;
		let state = self.lock();
		if state.forbidden_lists.contains(&kind.plural) {
			return Err(ApiError::Discovery {
				kind: kind.qualified_name(),
				reason: "forbidden".to_string(),
			});
		}
		let group = state
			.aliases
			.get(&(kind.group.clone(), kind.plural.clone()))
			.cloned()
			.unwrap_or_else(|| kind.group.clone());

		Ok(state
			.objects
			.iter()
			.filter(|((g, p, ns, _), s)| {
				*g == group
					&& *p == kind.plural
					&& ns.as_deref() == Some(namespace)
					&& s.stale_reads.is_none()
			})
			.map(|((_, _, _, name), s)| {
				let uid = s.object["metadata"]["uid"].as_str().map(str::to_string);
				ResourceRef::namespaced(kind, namespace, name).with_uid(uid)
			})
			.collect())
	}

	async fn get(&self, target: &ResourceRef) -> Result<Observed, ApiError> {
		self.checkpoint(FakeOp::Get, &target.name).await;
		let mut state = self.lock();
		if state.failing_gets > 0 {
			state.failing_gets -= 1;
			return Err(ApiError::Transient("connection reset".to_string()));
		}

		let key = state.key(target);
		let Some(stale_reads) = state.objects.get(&key).map(|s| s.stale_reads) else {
			return Err(ApiError::NotFound(target.to_string()));
		};
		if stale_reads == Some(0) {
			state.objects.remove(&key);
			return Err(ApiError::NotFound(target.to_string()));
		}
		let stored = state
			.objects
			.get_mut(&key)
			.ok_or_else(|| ApiError::NotFound(target.to_string()))?;
		stored.stale_reads = stale_reads.map(|n| n - 1);
		Ok(Observed::from_object(stored.object.clone()))
	}

	async fn delete(&self, target: &ResourceRef, grace_period_seconds: Option<u32>) -> Result<(), ApiError> {
		let op = if grace_period_seconds == Some(0) {
			FakeOp::ForceDelete
		} else {
			FakeOp::Delete
		};
		self.mutate(
			op,
			target,
			(),
			|state, key| {
				state.natural_delete(key);
				Ok(())
			},
			(),
		)
		.await
		.and_then(|()| {
			if self.lock().effect(&target.name, op) == Effect::Forbidden {
				Err(ApiError::Forbidden(target.to_string()))
			} else {
				Ok(())
			}
		})
	}

	async fn patch(&self, target: &ResourceRef, patch: FinalizerPatch) -> Result<(), ApiError> {
		let op = match patch {
			FinalizerPatch::MergeNull => FakeOp::MergePatch,
			FinalizerPatch::JsonRemove => FakeOp::JsonPatch,
		};
		self.mutate(
			op,
			target,
			(),
			|state, key| {
				let object = state
					.live(key)
					.ok_or_else(|| ApiError::NotFound(key.3.clone()))?;
				let removed = object
					.get_mut("metadata")
					.and_then(Value::as_object_mut)
					.and_then(|m| m.remove("finalizers"));
				if patch == FinalizerPatch::JsonRemove && removed.is_none() {
					return Err(ApiError::Rejected {
						status: 422,
						reason: "path /metadata/finalizers does not exist".to_string(),
					});
				}
				state.reap(key);
				Ok(())
			},
			(),
		)
		.await
		.and_then(|()| {
			if self.lock().effect(&target.name, op) == Effect::Forbidden {
				Err(ApiError::Forbidden(target.to_string()))
			} else {
				Ok(())
			}
		})
	}

	async fn finalize(
		&self,
		target: &ResourceRef,
		_endpoint: &str,
		payload: &Path,
	) -> Result<FinalizeResponse, ApiError> {
		let staged: Value = std::fs::read(payload)
			.ok()
			.and_then(|bytes| serde_json::from_slice(&bytes).ok())
			.unwrap_or(Value::Null);
		self.lock().payloads.push(staged.clone());
		let kind = staged.get("kind").and_then(Value::as_str).map(str::to_string);

		self.mutate(
			FakeOp::Finalize,
			target,
			FinalizeResponse::Rejected {
				status: 403,
				reason: "forbidden".to_string(),
			},
			|state, key| {
				let object = state
					.live(key)
					.ok_or_else(|| ApiError::NotFound(key.3.clone()))?;
				for parent in ["metadata", "spec"] {
					let incoming = staged.get(parent).and_then(|p| p.get("finalizers")).cloned();
					if let Some(map) = object.get_mut(parent).and_then(Value::as_object_mut) {
						match incoming {
							Some(list) => {
								map.insert("finalizers".to_string(), list);
							}
							None => {
								map.remove("finalizers");
							}
						}
					}
				}
				state.reap(key);
				Ok(FinalizeResponse::Accepted { kind: kind.clone() })
			},
			FinalizeResponse::Accepted { kind: kind.clone() },
		)
		.await
	}
}

fn is_terminating(object: &Value) -> bool {
	object.pointer("/metadata/deletionTimestamp").is_some()
}

fn mark_terminating(object: &mut Value) {
	if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
		metadata
			.entry("deletionTimestamp")
			.or_insert_with(|| json!("2024-01-01T00:00:00Z"));
	}
}

fn has_blocking_finalizers(object: &Value) -> bool {
	let non_empty = |pointer: &str| {
		object
			.pointer(pointer)
			.and_then(Value::as_array)
			.is_some_and(|list| !list.is_empty())
	};
	non_empty("/metadata/finalizers")
		|| (object["kind"] == "Namespace" && non_empty("/spec/finalizers"))
}

#[derive(Debug, Default)]
struct LauncherCounters {
	launches: AtomicUsize,
	terminations: AtomicUsize,
	kills: AtomicUsize,
}

/// Tunnel launcher that never spawns anything.
#[derive(Debug, Clone)]
pub struct FakeLauncher {
	healthy: bool,
	exits_early: bool,
	on_probe: Option<Arc<Notify>>,
	counters: Arc<LauncherCounters>,
}

impl FakeLauncher {
	fn with(healthy: bool, exits_early: bool) -> Self {
		Self {
			healthy,
			exits_early,
			on_probe: None,
			counters: Arc::default(),
		}
	}

	pub fn healthy() -> Self {
		Self::with(true, false)
	}

	pub fn unhealthy() -> Self {
		Self::with(false, false)
	}

	pub fn exits_early() -> Self {
		Self::with(false, true)
	}

	/// Never becomes healthy; every health probe notifies the returned handle.
	pub fn probe_notifying() -> (Self, Arc<Notify>) {
		let notify = Arc::new(Notify::new());
		let launcher = Self {
			on_probe: Some(notify.clone()),
			..Self::unhealthy()
		};
		(launcher, notify)
	}

	pub fn launches(&self) -> usize {
		self.counters.launches.load(Ordering::SeqCst)
	}

	pub fn terminations(&self) -> usize {
		self.counters.terminations.load(Ordering::SeqCst)
	}

	pub fn kills(&self) -> usize {
		self.counters.kills.load(Ordering::SeqCst)
	}
}

impl TunnelLauncher for FakeLauncher {
	type Process = FakeProcess;

	fn launch(&self, _port: u16) -> Result<FakeProcess, ProxyError> {
		self.counters.launches.fetch_add(1, Ordering::SeqCst);
		Ok(FakeProcess {
			healthy: self.healthy,
			exits_early: self.exits_early,
			on_probe: self.on_probe.clone(),
			counters: self.counters.clone(),
		})
	}
}

#[derive(Debug)]
pub struct FakeProcess {
	healthy: bool,
	exits_early: bool,
	on_probe: Option<Arc<Notify>>,
	counters: Arc<LauncherCounters>,
}

impl TunnelProcess for FakeProcess {
	fn exited(&mut self) -> Option<String> {
		self.exits_early.then(|| "exit code 1".to_string())
	}

	async fn healthy(&self, _endpoint: &str) -> bool {
		if let Some(notify) = &self.on_probe {
			notify.notify_one();
		}
		self.healthy
	}

	async fn terminate(&mut self, _grace: Duration) {
		self.counters.terminations.fetch_add(1, Ordering::SeqCst);
	}

	async fn kill(&mut self) {
		self.counters.kills.fetch_add(1, Ordering::SeqCst);
	}
}
