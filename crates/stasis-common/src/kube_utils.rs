//! Shared Kubernetes utilities using kube-rs
//!
//! Finalizer bookkeeping and optimistic-concurrency patches used by both
//! reconcilers. Every write built here carries the caller's observed
//! `resourceVersion`, so a stale view surfaces as a 409 conflict instead of
//! silently overwriting a concurrent change.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::Error;

/// Cache key for a namespaced object, in the `namespace/name` form the
/// reflector stores and work queues use
pub fn cache_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Check whether an object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Finalizer list of `meta` with `finalizer` appended (no duplicates)
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizer list of `meta` with every occurrence of `finalizer` removed
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default()
}

/// Removes server-managed fields from metadata before embedding a copy of an
/// object inside another resource:
/// - uid, resourceVersion, generation
/// - creationTimestamp, deletionTimestamp, deletionGracePeriodSeconds
/// - managedFields, ownerReferences, finalizers
pub fn strip_export_metadata(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.owner_references = None;
    meta.finalizers = None;
}

/// Merge-patch body replacing the finalizer list, guarded by resourceVersion
pub fn finalizer_patch(meta: &ObjectMeta, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "finalizers": finalizers,
        }
    })
}

/// Merge-patch body for the status subresource, guarded by resourceVersion
pub fn status_patch(meta: &ObjectMeta, status: Value) -> Value {
    json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
        },
        "status": status,
    })
}

fn merge_params(field_manager: &str) -> PatchParams {
    PatchParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    }
}

/// Replace the finalizers of `name` with `finalizers`
///
/// Fails with a 409 conflict when the object changed since `meta` was read.
pub async fn patch_finalizers<K>(
    api: &Api<K>,
    meta: &ObjectMeta,
    finalizers: &[String],
    field_manager: &str,
) -> Result<K, Error>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("finalizers", "object has no name"))?;
    let patch = finalizer_patch(meta, finalizers);
    let updated = api
        .patch(name, &merge_params(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(updated)
}

/// Merge-patch the status subresource of `name`
///
/// Fails with a 409 conflict when the object changed since `meta` was read.
pub async fn patch_status<K>(
    api: &Api<K>,
    meta: &ObjectMeta,
    status: Value,
    field_manager: &str,
) -> Result<K, Error>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("status", "object has no name"))?;
    let patch = status_patch(meta, status);
    let updated = api
        .patch_status(name, &merge_params(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(finalizers: Option<Vec<&str>>) -> ObjectMeta {
        ObjectMeta {
            name: Some("vm1".to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("42".to_string()),
            finalizers: finalizers.map(|f| f.into_iter().map(String::from).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn cache_key_is_namespace_slash_name() {
        assert_eq!(cache_key("default", "vm1"), "default/vm1");
    }

    #[test]
    fn has_finalizer_handles_absent_list() {
        assert!(!has_finalizer(&meta_with(None), "a"));
        assert!(has_finalizer(&meta_with(Some(vec!["a", "b"])), "b"));
        assert!(!has_finalizer(&meta_with(Some(vec!["a"])), "b"));
    }

    #[test]
    fn finalizers_with_is_idempotent() {
        let meta = meta_with(Some(vec!["other"]));
        let once = finalizers_with(&meta, "mine");
        assert_eq!(once, vec!["other", "mine"]);

        let meta = meta_with(Some(vec!["other", "mine"]));
        assert_eq!(finalizers_with(&meta, "mine"), vec!["other", "mine"]);

        assert_eq!(finalizers_with(&meta_with(None), "mine"), vec!["mine"]);
    }

    #[test]
    fn finalizers_without_keeps_foreign_entries() {
        let meta = meta_with(Some(vec!["other", "mine", "third"]));
        assert_eq!(finalizers_without(&meta, "mine"), vec!["other", "third"]);
        assert!(finalizers_without(&meta_with(None), "mine").is_empty());
    }

    #[test]
    fn patches_carry_resource_version() {
        let meta = meta_with(None);
        let patch = finalizer_patch(&meta, &["mine".to_string()]);
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["finalizers"][0], "mine");

        let patch = status_patch(&meta, json!({ "snapshotInProgress": null }));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert!(patch["status"]["snapshotInProgress"].is_null());
    }

    #[test]
    fn empty_finalizer_list_is_serialized_not_omitted() {
        let patch = finalizer_patch(&meta_with(Some(vec!["mine"])), &[]);
        assert_eq!(patch["metadata"]["finalizers"], json!([]));
    }

    #[test]
    fn strip_export_metadata_keeps_identity_fields() {
        let mut meta = meta_with(Some(vec!["x"]));
        meta.uid = Some("uid-1".to_string());
        meta.generation = Some(3);
        meta.labels = Some([("app".to_string(), "db".to_string())].into());
        strip_export_metadata(&mut meta);

        assert_eq!(meta.name.as_deref(), Some("vm1"));
        assert_eq!(meta.namespace.as_deref(), Some("default"));
        assert!(meta.labels.is_some());
        assert!(meta.uid.is_none());
        assert!(meta.resource_version.is_none());
        assert!(meta.generation.is_none());
        assert!(meta.finalizers.is_none());
    }
}
