//! Read side of the reconcilers
//!
//! Reconcilers read from the API server only to confirm a lock holder is
//! gone. Everything else is looked up
//! in watch-fed caches keyed by `namespace/name`, so a pass sees one
//! consistent, possibly stale, view and every write is checked against it
//! with the object's resourceVersion.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::runtime::reflector::store::WriterDropped;
use kube::runtime::reflector::{ObjectRef, Store};

use stasis_common::crd::{
    VirtualMachine, VirtualMachineInstance, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VolumeSnapshot, VolumeSnapshotClass,
};

use crate::source::is_virtual_machine;

/// Keyed lookups over the watched kinds
pub trait SnapshotCache: Send + Sync {
    /// VirtualMachine by key
    fn virtual_machine(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachine>>;

    /// VirtualMachineInstance by key
    fn virtual_machine_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<VirtualMachineInstance>>;

    /// All pods in a namespace
    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>>;

    /// PersistentVolumeClaim by key
    fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<PersistentVolumeClaim>>;

    /// StorageClass by name
    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>>;

    /// Every VolumeSnapshotClass in the cluster
    fn volume_snapshot_classes(&self) -> Vec<Arc<VolumeSnapshotClass>>;

    /// Content by key
    fn content(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshotContent>>;

    /// VolumeSnapshot by key
    fn volume_snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VolumeSnapshot>>;

    /// VirtualMachineSnapshot by key
    fn snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshot>>;
}

/// [`SnapshotCache`] backed by kube-runtime reflector stores
#[derive(Clone)]
pub struct ReflectorCache {
    /// VirtualMachines
    pub virtual_machines: Store<VirtualMachine>,
    /// VirtualMachineInstances
    pub virtual_machine_instances: Store<VirtualMachineInstance>,
    /// Pods
    pub pods: Store<Pod>,
    /// PersistentVolumeClaims
    pub persistent_volume_claims: Store<PersistentVolumeClaim>,
    /// StorageClasses
    pub storage_classes: Store<StorageClass>,
    /// VolumeSnapshotClasses
    pub volume_snapshot_classes: Store<VolumeSnapshotClass>,
    /// Snapshot contents
    pub contents: Store<VirtualMachineSnapshotContent>,
    /// VolumeSnapshots
    pub volume_snapshots: Store<VolumeSnapshot>,
    /// Snapshots, used to map VM changes back to snapshots
    pub snapshots: Store<VirtualMachineSnapshot>,
}

impl ReflectorCache {
    /// Snapshots in `namespace` whose source is the VirtualMachine `vm_name`
    pub fn snapshots_for_vm(&self, namespace: &str, vm_name: &str) -> Vec<ObjectRef<VirtualMachineSnapshot>> {
        self.snapshots
            .state()
            .iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(namespace))
            .filter(|s| is_virtual_machine(&s.spec.source) && s.spec.source.name == vm_name)
            .map(|s| ObjectRef::from_obj(s.as_ref()))
            .collect()
    }

    /// Resolve once every store has received its initial listing
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        self.virtual_machines.wait_until_ready().await?;
        self.virtual_machine_instances.wait_until_ready().await?;
        self.pods.wait_until_ready().await?;
        self.persistent_volume_claims.wait_until_ready().await?;
        self.storage_classes.wait_until_ready().await?;
        self.volume_snapshot_classes.wait_until_ready().await?;
        self.contents.wait_until_ready().await?;
        self.volume_snapshots.wait_until_ready().await?;
        self.snapshots.wait_until_ready().await
    }
}

impl SnapshotCache for ReflectorCache {
    fn virtual_machine(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachine>> {
        self.virtual_machines
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn virtual_machine_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<VirtualMachineInstance>> {
        self.virtual_machine_instances
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }

    fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<PersistentVolumeClaim>> {
        self.persistent_volume_claims
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.storage_classes.get(&ObjectRef::new(name))
    }

    fn volume_snapshot_classes(&self) -> Vec<Arc<VolumeSnapshotClass>> {
        self.volume_snapshot_classes.state()
    }

    fn content(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshotContent>> {
        self.contents.get(&ObjectRef::new(name).within(namespace))
    }

    fn volume_snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VolumeSnapshot>> {
        self.volume_snapshots
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshot>> {
        self.snapshots.get(&ObjectRef::new(name).within(namespace))
    }
}
