//! StorageClass to VolumeSnapshotClass resolution
//!
//! A storage class maps to the snapshot classes whose `driver` equals its
//! provisioner. When several match, exactly one must carry the default-class
//! annotation; anything else is ambiguous and needs an operator to fix it.

use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::warn;

use stasis_common::crd::VolumeSnapshotClass;
use stasis_common::Error;

use crate::cache::SnapshotCache;

/// Pick the VolumeSnapshotClass for `storage_class`
///
/// Returns `Ok(None)` when no class matches the provisioner.
pub fn resolve_snapshot_class(
    storage_class: &StorageClass,
    classes: &[Arc<VolumeSnapshotClass>],
) -> Result<Option<String>, Error> {
    let matches: Vec<&VolumeSnapshotClass> = classes
        .iter()
        .map(Arc::as_ref)
        .filter(|c| c.driver == storage_class.provisioner)
        .collect();

    match matches.as_slice() {
        [] => {
            warn!(
                storage_class = %storage_class.name_any(),
                provisioner = %storage_class.provisioner,
                "No VolumeSnapshotClass for storage class"
            );
            Ok(None)
        }
        [only] => Ok(Some(only.name_any())),
        many => {
            let defaults: Vec<_> = many.iter().filter(|c| c.is_default()).collect();
            match defaults.as_slice() {
                [default] => Ok(Some(default.name_any())),
                _ => Err(Error::ambiguous_snapshot_class(
                    storage_class.name_any(),
                    many.len(),
                )),
            }
        }
    }
}

/// Resolve the snapshot class for a storage class name through the cache
///
/// A storage class with no object behind it, as static volumes often use,
/// resolves to `Ok(None)` like one without a matching snapshot class.
pub fn snapshot_class_for(
    cache: &dyn SnapshotCache,
    storage_class_name: &str,
) -> Result<Option<String>, Error> {
    let Some(storage_class) = cache.storage_class(storage_class_name) else {
        warn!(storage_class = storage_class_name, "Storage class does not exist");
        return Ok(None);
    };
    resolve_snapshot_class(&storage_class, &cache.volume_snapshot_classes())
}
