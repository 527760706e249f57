//! Helper functions for mock Kubernetes testing.

use serde_json::Value;

/// Apply a JSON merge patch (RFC 7386) to `base`.
///
/// `null` values in the patch remove the corresponding key.
pub fn merge_json(base: Value, patch: Value) -> Value {
	match (base, patch) {
		(Value::Object(mut base_map), Value::Object(patch_map)) => {
			for (key, patch_value) in patch_map {
				if patch_value.is_null() {
					base_map.remove(&key);
					continue;
				}
				let base_value = base_map.remove(&key).unwrap_or(Value::Null);
				base_map.insert(key, merge_json(base_value, patch_value));
			}
			Value::Object(base_map)
		}
		(_, patch) => patch,
	}
}

/// Strip strategic merge patch directives from a JSON value.
///
/// Strategic merge patch uses special keys like `$setElementOrder/xxx`, `$patch`,
/// and `$retainKeys` to control merge behavior. These are instructions for the
/// server, not actual resource content, so they should not appear in the response.
pub fn strip_strategic_merge_directives(value: Value) -> Value {
	match value {
		Value::Object(map) => Value::Object(
			map.into_iter()
				.filter(|(key, _)| !key.starts_with('$'))
				.map(|(key, val)| (key, strip_strategic_merge_directives(val)))
				.collect(),
		),
		Value::Array(arr) => Value::Array(
			arr.into_iter()
				.map(strip_strategic_merge_directives)
				.collect(),
		),
		other => other,
	}
}

/// Whether anything still blocks the removal of `object`.
///
/// Namespaces are additionally held by `spec.finalizers`.
pub fn has_blocking_finalizers(object: &Value) -> bool {
	let non_empty = |pointer: &str| {
		object
			.pointer(pointer)
			.and_then(Value::as_array)
			.is_some_and(|list| !list.is_empty())
	};

	non_empty("/metadata/finalizers")
		|| (object.get("kind").and_then(Value::as_str) == Some("Namespace")
			&& non_empty("/spec/finalizers"))
}

/// Whether the object has been marked for deletion.
pub fn is_terminating(object: &Value) -> bool {
	object.pointer("/metadata/deletionTimestamp").is_some()
}

/// Mark an object as being deleted.
pub fn mark_terminating(object: &mut Value) {
	if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
		metadata
			.entry("deletionTimestamp")
			.or_insert_with(|| Value::String("2024-01-01T00:00:00Z".to_string()));
	}
}
