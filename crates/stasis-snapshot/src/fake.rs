//! In-memory cluster for multi-pass reconciler tests
//!
//! Implements both [`SnapshotCache`] and [`SnapshotClient`] over one store,
//! with enough API server behaviour to exercise the controllers end to end:
//! resourceVersion conflicts, finalizer-gated deletion, owner garbage
//! collection and a count of successful writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, PodStatus, TypedLocalObjectReference, Volume,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::json;

use stasis_common::crd::{
    VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceSpec, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentStatus,
    VirtualMachineSnapshotSpec, VirtualMachineSnapshotStatus, VolumeSnapshot, VolumeSnapshotClass,
    VolumeSnapshotError, VolumeSnapshotState,
};
use stasis_common::error::api_error;
use stasis_common::events::RecordingEventPublisher;
use stasis_common::kube_utils::cache_key;
use stasis_common::{Error, FixedClock, SOURCE_FINALIZER};

use crate::cache::SnapshotCache;
use crate::client::SnapshotClient;
use crate::controller::Context;

pub const NAMESPACE: &str = "default";
pub const STORAGE_CLASS: &str = "fast-ssd";
pub const PROVISIONER: &str = "rbd.csi.ceph.com";
pub const SNAPSHOT_CLASS: &str = "csi-rbd";

type Objects<K> = BTreeMap<String, K>;

#[derive(Default)]
struct State {
    version: u64,
    writes: Vec<String>,
    vms: Objects<VirtualMachine>,
    vmis: Objects<VirtualMachineInstance>,
    pods: Objects<Pod>,
    pvcs: Objects<PersistentVolumeClaim>,
    storage_classes: Objects<StorageClass>,
    snapshot_classes: Objects<VolumeSnapshotClass>,
    snapshots: Objects<VirtualMachineSnapshot>,
    contents: Objects<VirtualMachineSnapshotContent>,
    volume_snapshots: Objects<VolumeSnapshot>,
}

fn key_of<K: Resource>(obj: &K) -> String {
    let name = obj.meta().name.clone().unwrap_or_default();
    match obj.meta().namespace.as_deref() {
        Some(ns) => cache_key(ns, &name),
        None => name,
    }
}

fn bump(version: &mut u64, meta: &mut ObjectMeta) {
    *version += 1;
    meta.resource_version = Some(version.to_string());
}

fn admit<K: Resource>(version: &mut u64, obj: &mut K) {
    let meta = obj.meta_mut();
    if meta.uid.is_none() {
        meta.uid = Some(format!("uid-{}", meta.name.clone().unwrap_or_default()));
    }
    bump(version, meta);
}

/// The stored object `sent` was read from, if it is still current
fn current<'a, K: Resource>(objects: &'a mut Objects<K>, sent: &K) -> Result<&'a mut K, Error> {
    let key = key_of(sent);
    let stored = objects
        .get_mut(&key)
        .ok_or_else(|| api_error(404, "NotFound", &format!("{key} not found")))?;
    if stored.meta().resource_version != sent.meta().resource_version {
        return Err(api_error(
            409,
            "Conflict",
            "the object has been modified; please apply your changes to the latest version",
        ));
    }
    Ok(stored)
}

fn set_finalizers<K: Resource>(
    version: &mut u64,
    objects: &mut Objects<K>,
    sent: &K,
    finalizers: Vec<String>,
) -> Result<Option<K>, Error> {
    let stored = current(objects, sent)?;
    let released = finalizers.is_empty() && stored.meta().deletion_timestamp.is_some();
    stored.meta_mut().finalizers = Some(finalizers);
    bump(version, stored.meta_mut());
    Ok(if released {
        objects.remove(&key_of(sent))
    } else {
        None
    })
}

fn delete<K: Resource>(objects: &mut Objects<K>, key: &str) -> Result<Option<K>, Error> {
    let stored = objects
        .get_mut(key)
        .ok_or_else(|| api_error(404, "NotFound", &format!("{key} not found")))?;
    if stored.finalizers().is_empty() {
        return Ok(objects.remove(key));
    }
    if stored.meta().deletion_timestamp.is_none() {
        stored.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
    }
    Ok(None)
}

fn create<K: Resource + Clone>(version: &mut u64, objects: &mut Objects<K>, obj: &K) -> Result<(), Error> {
    let key = key_of(obj);
    if objects.contains_key(&key) {
        return Err(api_error(409, "AlreadyExists", &format!("{key} already exists")));
    }
    let mut obj = obj.clone();
    admit(version, &mut obj);
    objects.insert(key, obj);
    Ok(())
}

impl State {
    fn collect_content_garbage(&mut self, removed: Option<VirtualMachineSnapshotContent>) {
        let Some(content) = removed else { return };
        let uid = content.uid();
        self.volume_snapshots.retain(|_, vs| {
            !vs.owner_references()
                .iter()
                .any(|o| Some(&o.uid) == uid.as_ref())
        });
    }

    fn record(&mut self, what: &str, key: String) {
        self.writes.push(format!("{what} {key}"));
    }
}

/// In-memory API server and cache
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn write_count(&self) -> usize {
        self.with(|s| s.writes.len())
    }

    pub fn writes(&self) -> Vec<String> {
        self.with(|s| s.writes.clone())
    }

    pub fn insert_vm(&self, mut vm: VirtualMachine) {
        self.with(|s| {
            admit(&mut s.version, &mut vm);
            s.vms.insert(key_of(&vm), vm);
        });
    }

    pub fn insert_vmi(&self, mut vmi: VirtualMachineInstance) {
        self.with(|s| {
            admit(&mut s.version, &mut vmi);
            s.vmis.insert(key_of(&vmi), vmi);
        });
    }

    pub fn insert_pod(&self, mut pod: Pod) {
        self.with(|s| {
            admit(&mut s.version, &mut pod);
            s.pods.insert(key_of(&pod), pod);
        });
    }

    pub fn insert_pvc(&self, mut pvc: PersistentVolumeClaim) {
        self.with(|s| {
            admit(&mut s.version, &mut pvc);
            s.pvcs.insert(key_of(&pvc), pvc);
        });
    }

    pub fn insert_storage_class(&self, mut sc: StorageClass) {
        self.with(|s| {
            admit(&mut s.version, &mut sc);
            s.storage_classes.insert(key_of(&sc), sc);
        });
    }

    pub fn insert_snapshot_class(&self, mut class: VolumeSnapshotClass) {
        self.with(|s| {
            admit(&mut s.version, &mut class);
            s.snapshot_classes.insert(key_of(&class), class);
        });
    }

    pub fn insert_snapshot(&self, mut snapshot: VirtualMachineSnapshot) {
        self.with(|s| {
            admit(&mut s.version, &mut snapshot);
            s.snapshots.insert(key_of(&snapshot), snapshot);
        });
    }

    pub fn vm(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachine>> {
        self.with(|s| s.vms.get(&cache_key(namespace, name)).cloned().map(Arc::new))
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshot>> {
        self.with(|s| {
            s.snapshots
                .get(&cache_key(namespace, name))
                .cloned()
                .map(Arc::new)
        })
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.with(|s| s.snapshots.values().map(|o| o.name_any()).collect())
    }

    pub fn content_names(&self) -> Vec<String> {
        self.with(|s| s.contents.values().map(|o| o.name_any()).collect())
    }

    pub fn volume_snapshot_names(&self) -> Vec<String> {
        self.with(|s| s.volume_snapshots.values().map(|o| o.name_any()).collect())
    }

    pub fn update_vm(&self, namespace: &str, name: &str, f: impl FnOnce(&mut VirtualMachine)) {
        self.with(|s| {
            if let Some(vm) = s.vms.get_mut(&cache_key(namespace, name)) {
                f(vm);
                bump(&mut s.version, &mut vm.metadata);
            }
        });
    }

    pub fn update_snapshot(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut VirtualMachineSnapshot),
    ) {
        self.with(|s| {
            if let Some(snap) = s.snapshots.get_mut(&cache_key(namespace, name)) {
                f(snap);
                bump(&mut s.version, &mut snap.metadata);
            }
        });
    }

    pub fn update_content(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut VirtualMachineSnapshotContent),
    ) {
        self.with(|s| {
            if let Some(content) = s.contents.get_mut(&cache_key(namespace, name)) {
                f(content);
                bump(&mut s.version, &mut content.metadata);
            }
        });
    }

    /// Put both lock fields in place, as a completed lock would have
    pub fn lock_vm(&self, namespace: &str, name: &str, snapshot: &str) {
        self.update_vm(namespace, name, |vm| {
            vm.status.get_or_insert_with(Default::default).snapshot_in_progress =
                Some(snapshot.to_string());
            vm.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(SOURCE_FINALIZER.to_string());
        });
    }

    /// User-initiated delete of a snapshot
    pub fn delete_snapshot(&self, namespace: &str, name: &str) {
        self.with(|s| {
            let _ = delete(&mut s.snapshots, &cache_key(namespace, name));
        });
    }

    /// Out-of-band delete of a VolumeSnapshot
    pub fn delete_volume_snapshot(&self, namespace: &str, name: &str) {
        self.with(|s| {
            s.volume_snapshots.remove(&cache_key(namespace, name));
        });
    }

    /// Report a VolumeSnapshot's state as the snapshotter would
    pub fn set_volume_snapshot_state(
        &self,
        namespace: &str,
        name: &str,
        ready: bool,
        error: Option<&str>,
    ) {
        self.with(|s| {
            if let Some(vs) = s.volume_snapshots.get_mut(&cache_key(namespace, name)) {
                vs.status = Some(VolumeSnapshotState {
                    ready_to_use: Some(ready),
                    creation_time: ready.then(|| Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
                    error: error.map(|m| VolumeSnapshotError {
                        time: None,
                        message: Some(m.to_string()),
                    }),
                    ..Default::default()
                });
                bump(&mut s.version, &mut vs.metadata);
            }
        });
    }

    /// Mark every VolumeSnapshot ready
    pub fn ready_all_volume_snapshots(&self) {
        for name in self.volume_snapshot_names() {
            self.set_volume_snapshot_state(NAMESPACE, &name, true, None);
        }
    }
}

impl SnapshotCache for FakeCluster {
    fn virtual_machine(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachine>> {
        self.vm(namespace, name)
    }

    fn virtual_machine_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<VirtualMachineInstance>> {
        self.with(|s| s.vmis.get(&cache_key(namespace, name)).cloned().map(Arc::new))
    }

    fn pods(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.with(|s| {
            s.pods
                .values()
                .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
                .cloned()
                .map(Arc::new)
                .collect()
        })
    }

    fn persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<PersistentVolumeClaim>> {
        self.with(|s| s.pvcs.get(&cache_key(namespace, name)).cloned().map(Arc::new))
    }

    fn storage_class(&self, name: &str) -> Option<Arc<StorageClass>> {
        self.with(|s| s.storage_classes.get(name).cloned().map(Arc::new))
    }

    fn volume_snapshot_classes(&self) -> Vec<Arc<VolumeSnapshotClass>> {
        self.with(|s| s.snapshot_classes.values().cloned().map(Arc::new).collect())
    }

    fn content(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshotContent>> {
        self.with(|s| {
            s.contents
                .get(&cache_key(namespace, name))
                .cloned()
                .map(Arc::new)
        })
    }

    fn volume_snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VolumeSnapshot>> {
        self.with(|s| {
            s.volume_snapshots
                .get(&cache_key(namespace, name))
                .cloned()
                .map(Arc::new)
        })
    }

    fn snapshot(&self, namespace: &str, name: &str) -> Option<Arc<VirtualMachineSnapshot>> {
        FakeCluster::snapshot(self, namespace, name)
    }
}

#[async_trait]
impl SnapshotClient for FakeCluster {
    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
        status: &VirtualMachineSnapshotStatus,
    ) -> Result<(), Error> {
        self.with(|s| {
            let stored = current(&mut s.snapshots, snapshot)?;
            stored.status = Some(status.clone());
            bump(&mut s.version, &mut stored.metadata);
            s.record("update_snapshot_status", key_of(snapshot));
            Ok(())
        })
    }

    async fn set_snapshot_finalizers(
        &self,
        snapshot: &VirtualMachineSnapshot,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        self.with(|s| {
            set_finalizers(&mut s.version, &mut s.snapshots, snapshot, finalizers)?;
            s.record("set_snapshot_finalizers", key_of(snapshot));
            Ok(())
        })
    }

    async fn create_content(&self, content: &VirtualMachineSnapshotContent) -> Result<(), Error> {
        self.with(|s| {
            create(&mut s.version, &mut s.contents, content)?;
            s.record("create_content", key_of(content));
            Ok(())
        })
    }

    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
        status: &VirtualMachineSnapshotContentStatus,
    ) -> Result<(), Error> {
        self.with(|s| {
            let stored = current(&mut s.contents, content)?;
            stored.status = Some(status.clone());
            bump(&mut s.version, &mut stored.metadata);
            s.record("update_content_status", key_of(content));
            Ok(())
        })
    }

    async fn set_content_finalizers(
        &self,
        content: &VirtualMachineSnapshotContent,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        self.with(|s| {
            let removed = set_finalizers(&mut s.version, &mut s.contents, content, finalizers)?;
            s.collect_content_garbage(removed);
            s.record("set_content_finalizers", key_of(content));
            Ok(())
        })
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.with(|s| {
            let key = cache_key(namespace, name);
            let removed = delete(&mut s.contents, &key)?;
            s.collect_content_garbage(removed);
            s.record("delete_content", key);
            Ok(())
        })
    }

    async fn create_volume_snapshot(&self, volume_snapshot: &VolumeSnapshot) -> Result<(), Error> {
        self.with(|s| {
            create(&mut s.version, &mut s.volume_snapshots, volume_snapshot)?;
            s.record("create_volume_snapshot", key_of(volume_snapshot));
            Ok(())
        })
    }

    async fn set_vm_snapshot_in_progress(
        &self,
        vm: &VirtualMachine,
        snapshot: Option<String>,
    ) -> Result<(), Error> {
        self.with(|s| {
            let stored = current(&mut s.vms, vm)?;
            stored
                .status
                .get_or_insert_with(Default::default)
                .snapshot_in_progress = snapshot;
            bump(&mut s.version, &mut stored.metadata);
            s.record("set_vm_snapshot_in_progress", key_of(vm));
            Ok(())
        })
    }

    async fn set_vm_finalizers(
        &self,
        vm: &VirtualMachine,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        self.with(|s| {
            set_finalizers(&mut s.version, &mut s.vms, vm, finalizers)?;
            s.record("set_vm_finalizers", key_of(vm));
            Ok(())
        })
    }

    async fn snapshot_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.with(|s| s.snapshots.contains_key(&cache_key(namespace, name))))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Halted VM with claim-backed volumes `(volume, claim)`
pub fn vm(name: &str, volumes: &[(&str, &str)]) -> VirtualMachine {
    let volumes: Vec<_> = volumes
        .iter()
        .map(|(volume, claim)| json!({ "name": volume, "persistentVolumeClaim": { "claimName": claim } }))
        .collect();
    serde_json::from_value(json!({
        "apiVersion": "kubevirt.io/v1",
        "kind": "VirtualMachine",
        "metadata": { "name": name, "namespace": NAMESPACE },
        "spec": {
            "runStrategy": "Halted",
            "template": {
                "spec": {
                    "domain": { "devices": {}, "resources": { "requests": { "memory": "1Gi" } } },
                    "volumes": volumes
                }
            }
        }
    }))
    .unwrap()
}

pub fn vmi(name: &str) -> VirtualMachineInstance {
    let mut vmi = VirtualMachineInstance::new(name, VirtualMachineInstanceSpec::default());
    vmi.metadata.namespace = Some(NAMESPACE.to_string());
    vmi
}

pub fn pod(name: &str, claim: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "disk".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn snapshot(name: &str, vm: &str) -> VirtualMachineSnapshot {
    let mut snapshot = VirtualMachineSnapshot::new(
        name,
        VirtualMachineSnapshotSpec {
            source: TypedLocalObjectReference {
                api_group: Some("kubevirt.io".to_string()),
                kind: "VirtualMachine".to_string(),
                name: vm.to_string(),
            },
            deletion_policy: None,
        },
    );
    snapshot.metadata.namespace = Some(NAMESPACE.to_string());
    snapshot
}

/// Claim, bound unless `volume_name` is `None`
pub fn pvc(name: &str, storage_class: Option<&str>, volume_name: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some([("app".to_string(), "db".to_string())].into()),
            finalizers: Some(vec!["kubernetes.io/pvc-protection".to_string()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: storage_class.map(String::from),
            volume_name: volume_name.map(String::from),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        ..Default::default()
    }
}

/// Context over `cluster` with a fixed clock and a recording publisher
pub fn context(cluster: &Arc<FakeCluster>) -> Arc<Context> {
    Harness::over(cluster.clone()).ctx
}

/// Fake cluster plus the context and probes reconcilers run with
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub ctx: Arc<Context>,
    pub events: Arc<RecordingEventPublisher>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn over(cluster: Arc<FakeCluster>) -> Self {
        let events = Arc::new(RecordingEventPublisher::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let ctx = Arc::new(Context::for_testing(
            cluster.clone(),
            cluster.clone(),
            events.clone(),
            clock.clone(),
        ));
        Self {
            cluster,
            ctx,
            events,
            clock,
        }
    }

    /// vm1 with volumes d0 and d1 on bound, snapshottable claims
    pub fn with_vm() -> Self {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert_vm(vm("vm1", &[("d0", "vm1-d0"), ("d1", "vm1-d1")]));
        cluster.insert_pvc(pvc("vm1-d0", Some(STORAGE_CLASS), Some("pv-d0")));
        cluster.insert_pvc(pvc("vm1-d1", Some(STORAGE_CLASS), Some("pv-d1")));
        cluster.insert_storage_class(storage_class(STORAGE_CLASS, PROVISIONER));
        cluster.insert_snapshot_class(VolumeSnapshotClass::new(SNAPSHOT_CLASS, PROVISIONER));
        Self::over(cluster)
    }

    pub async fn reconcile_snapshot(&self, name: &str) -> Result<Action, Error> {
        let snapshot = self
            .cluster
            .snapshot(NAMESPACE, name)
            .ok_or_else(|| Error::internal(format!("snapshot {name} is gone")))?;
        crate::controller::reconcile(snapshot, self.ctx.clone()).await
    }

    pub async fn reconcile_content(&self, name: &str) -> Result<Action, Error> {
        let content = self
            .cluster
            .content(NAMESPACE, name)
            .ok_or_else(|| Error::internal(format!("content {name} is gone")))?;
        crate::content::reconcile(content, self.ctx.clone()).await
    }

    /// Reconcile every snapshot and content until a full round writes nothing
    ///
    /// Returns the number of rounds that made progress.
    pub async fn converge(&self) -> Result<usize, Error> {
        for round in 0..64 {
            let before = self.cluster.write_count();
            for name in self.cluster.snapshot_names() {
                if self.cluster.snapshot(NAMESPACE, &name).is_some() {
                    self.reconcile_snapshot(&name).await?;
                }
            }
            for name in self.cluster.content_names() {
                if self.cluster.content(NAMESPACE, &name).is_some() {
                    self.reconcile_content(&name).await?;
                }
            }
            if self.cluster.write_count() == before {
                return Ok(round);
            }
        }
        Err(Error::internal("reconcilers did not converge"))
    }
}
