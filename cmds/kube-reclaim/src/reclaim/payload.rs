//! Staging of objects sent to the `finalize` subresource.

use std::path::PathBuf;

use serde_json::Value;
use tempfile::TempDir;
use thiserror::Error;

use crate::k8s::ResourceRef;

#[derive(Debug, Error)]
pub enum PayloadError {
	#[error("creating payload staging directory")]
	CreateDir(#[source] std::io::Error),

	#[error("writing staged payload {path}")]
	Write {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("serializing staged payload")]
	Serialize(#[from] serde_json::Error),
}

/// Which finalizer list to clear before staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerField {
	/// `metadata.finalizers`, for ordinary objects.
	Metadata,
	/// `spec.finalizers`, for namespaces.
	Spec,
}

/// Remove the selected finalizer list from an exported object.
pub fn strip_finalizers(mut object: Value, field: FinalizerField) -> Value {
	let parent = match field {
		FinalizerField::Metadata => "metadata",
		FinalizerField::Spec => "spec",
	};
	if let Some(map) = object.get_mut(parent).and_then(Value::as_object_mut) {
		map.remove("finalizers");
	}
	object
}

/// Session-scoped directory of staged payloads, removed when dropped.
#[derive(Debug)]
pub struct PayloadStage {
	dir: TempDir,
}

impl PayloadStage {
	pub fn new() -> Result<Self, PayloadError> {
		let dir = tempfile::Builder::new()
			.prefix("kube-reclaim-")
			.tempdir()
			.map_err(PayloadError::CreateDir)?;
		Ok(Self { dir })
	}

	pub fn path(&self) -> &std::path::Path {
		self.dir.path()
	}

	/// Write `object` with the chosen finalizers stripped, returning the file path.
	pub fn stage(
		&self,
		target: &ResourceRef,
		object: Value,
		field: FinalizerField,
	) -> Result<PathBuf, PayloadError> {
		let stripped = strip_finalizers(object, field);
		let group = if target.api_group.is_empty() {
			"core"
		} else {
			&target.api_group
		};
		let path = self
			.dir
			.path()
			.join(format!("{}.{}-{}.json", target.kind, group, target.name));
		let body = serde_json::to_vec_pretty(&stripped)?;
		std::fs::write(&path, body).map_err(|source| PayloadError::Write {
			path: path.clone(),
			source,
		})?;
		tracing::debug!(path = %path.display(), "staged finalize payload");
		Ok(path)
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn strips_only_the_selected_list() {
		let ns = json!({
			"kind": "Namespace",
			"metadata": {"name": "ns1", "finalizers": ["a"]},
			"spec": {"finalizers": ["kubernetes"]}
		});

		let spec_stripped = strip_finalizers(ns.clone(), FinalizerField::Spec);
		assert_eq!(spec_stripped["spec"], json!({}));
		assert_eq!(spec_stripped["metadata"]["finalizers"], json!(["a"]));

		let meta_stripped = strip_finalizers(ns, FinalizerField::Metadata);
		assert!(meta_stripped["metadata"].get("finalizers").is_none());
		assert_eq!(meta_stripped["spec"]["finalizers"], json!(["kubernetes"]));
	}

	#[test]
	fn staged_files_are_removed_with_the_stage() {
		let stage = PayloadStage::new().unwrap();
		let dir = stage.path().to_path_buf();
		let target = ResourceRef::namespace_object("ns1");

		let path = stage
			.stage(
				&target,
				json!({"kind": "Namespace", "spec": {"finalizers": ["kubernetes"]}}),
				FinalizerField::Spec,
			)
			.unwrap();

		let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
		assert_eq!(written, json!({"kind": "Namespace", "spec": {}}));

		drop(stage);
		assert!(!dir.exists());
	}
}
