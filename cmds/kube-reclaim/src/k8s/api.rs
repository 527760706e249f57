//! The typed cluster API surface used by discovery and the escalation engine.

use std::{future::Future, path::Path};

use json_patch::{jsonptr::PointerBuf, PatchOperation, RemoveOperation};
use kube::api::Patch;
use serde_json::Value;
use thiserror::Error;

use super::{Observed, ResourceKind, ResourceRef};

/// Errors returned by cluster API calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
	#[error("{0} not found")]
	NotFound(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("{kind} cannot be listed: {reason}")]
	Discovery { kind: String, reason: String },

	#[error("transient API failure: {0}")]
	Transient(String),

	#[error("request rejected with status {status}: {reason}")]
	Rejected { status: u16, reason: String },
}

impl ApiError {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transient(_))
	}

	/// Classify a kube client error.
	pub fn from_kube(err: kube::Error) -> Self {
		match err {
			kube::Error::Api(ref resp) => Self::from_status(resp.code, resp.message.clone()),
			other => Self::Transient(other.to_string()),
		}
	}

	/// Classify an HTTP status code returned by the API server.
	pub fn from_status(status: u16, reason: String) -> Self {
		match status {
			404 => Self::NotFound(reason),
			403 => Self::Forbidden(reason),
			401 | 408 | 429 => Self::Transient(format!("{status}: {reason}")),
			s if s >= 500 => Self::Transient(format!("{status}: {reason}")),
			_ => Self::Rejected { status, reason },
		}
	}
}

/// How to clear `metadata.finalizers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerPatch {
	/// Merge patch `{"metadata":{"finalizers":null}}`.
	MergeNull,
	/// JSON patch `[{"op":"remove","path":"/metadata/finalizers"}]`.
	JsonRemove,
}

impl FinalizerPatch {
	/// The patch sent to the server.
	pub fn to_patch(self) -> Patch<Value> {
		match self {
			Self::MergeNull => Patch::Merge(serde_json::json!({"metadata": {"finalizers": null}})),
			Self::JsonRemove => Patch::Json(json_patch::Patch(vec![PatchOperation::Remove(
				RemoveOperation {
					path: PointerBuf::from_tokens(["metadata", "finalizers"]),
				},
			)])),
		}
	}
}

/// Outcome of a `finalize` subresource PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeResponse {
	/// The server answered with an object of `kind`.
	Accepted { kind: Option<String> },
	/// The server answered with a failure status.
	Rejected { status: u16, reason: String },
}

impl FinalizeResponse {
	/// Parse a proxy response.
	pub fn from_response(status: u16, body: &Value) -> Self {
		let message = || {
			body.get("message")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string()
		};
		if !(200..300).contains(&status) {
			return Self::Rejected {
				status,
				reason: message(),
			};
		}
		let kind = body.get("kind").and_then(Value::as_str);
		if kind == Some("Status")
			&& body.get("status").and_then(Value::as_str) == Some("Failure")
		{
			let status = body
				.get("code")
				.and_then(Value::as_u64)
				.map_or(status, |c| c as u16);
			return Self::Rejected {
				status,
				reason: message(),
			};
		}
		Self::Accepted {
			kind: kind.map(str::to_string),
		}
	}

	/// Whether the server echoed back an object of the expected kind.
	pub fn confirms(&self, expected_kind: &str) -> bool {
		matches!(self, Self::Accepted { kind: Some(kind) } if kind == expected_kind)
	}
}

/// Cluster operations needed to discover and reclaim resources.
#[allow(async_fn_in_trait)]
pub trait ClusterApi {
	/// Every resource type served by the cluster, at its preferred version.
	async fn discover_kinds(&self) -> Result<Vec<ResourceKind>, ApiError>;

	/// Instances of `kind` in `namespace`.
	async fn list(&self, namespace: &str, kind: &ResourceKind) -> Result<Vec<ResourceRef>, ApiError>;

	/// Fresh read of a single object.
	async fn get(&self, target: &ResourceRef) -> Result<Observed, ApiError>;

	/// Request deletion. Success only means the request was accepted.
	async fn delete(&self, target: &ResourceRef, grace_period_seconds: Option<u32>) -> Result<(), ApiError>;

	async fn patch(&self, target: &ResourceRef, patch: FinalizerPatch) -> Result<(), ApiError>;

	/// PUT the staged object at `payload` to the `finalize` subresource through `endpoint`.
	async fn finalize(
		&self,
		target: &ResourceRef,
		endpoint: &str,
		payload: &Path,
	) -> Result<FinalizeResponse, ApiError>;
}

/// Run `op`, repeating it once if the first attempt fails transiently.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, ApiError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, ApiError>>,
{
	match op().await {
		Err(err) if err.is_transient() => {
			tracing::debug!(error = %err, "retrying after transient error");
			op().await
		}
		other => other,
	}
}

/// Read `target`, mapping `NotFound` to `None`. Transient failures are retried once.
pub async fn fetch<A: ClusterApi>(api: &A, target: &ResourceRef) -> Result<Option<Observed>, ApiError> {
	match retry_transient(|| api.get(target)).await {
		Ok(observed) => Ok(Some(observed)),
		Err(ApiError::NotFound(_)) => Ok(None),
		Err(err) => Err(err),
	}
}
