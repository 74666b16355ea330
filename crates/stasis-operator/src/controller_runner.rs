//! Controller runner - builds the cache reflectors and controller futures
//!
//! The reconcilers read through a [`ReflectorCache`]; each of its stores is
//! fed by its own reflector task. The `build_*` functions only construct
//! futures, the caller decides how to drive them.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use stasis_common::crd::{
    VirtualMachine, VirtualMachineInstance, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VolumeSnapshot, VolumeSnapshotClass,
};
use stasis_snapshot::{content, controller, Context, ReflectorCache};

use crate::config::ControllerConfig;

/// A long-running task driven by the caller
pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn reflect<K>(api: Api<K>, config: WatcherConfig, kind: &'static str) -> (Store<K>, Task)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store();
    let task = reflector::reflector(writer, watcher::watcher(api, config).default_backoff())
        .for_each(move |event| {
            if let Err(e) = event {
                tracing::warn!(kind, error = %e, "Cache watch error");
            }
            std::future::ready(())
        });
    (store, Box::pin(task))
}

/// Build the read cache and the reflector tasks that keep it current
pub fn build_cache(client: &Client, config: &ControllerConfig) -> (ReflectorCache, Vec<Task>) {
    let ns = config.watch_namespace();
    let wc = config.watcher_config();
    let mut tasks = Vec::new();

    let (virtual_machines, task) = reflect(api::<VirtualMachine>(client, ns), wc.clone(), "VirtualMachine");
    tasks.push(task);
    let (virtual_machine_instances, task) = reflect(
        api::<VirtualMachineInstance>(client, ns),
        wc.clone(),
        "VirtualMachineInstance",
    );
    tasks.push(task);
    let (pods, task) = reflect(api::<Pod>(client, ns), wc.clone(), "Pod");
    tasks.push(task);
    let (persistent_volume_claims, task) = reflect(
        api::<PersistentVolumeClaim>(client, ns),
        wc.clone(),
        "PersistentVolumeClaim",
    );
    tasks.push(task);
    let (storage_classes, task) = reflect(
        Api::<StorageClass>::all(client.clone()),
        wc.clone(),
        "StorageClass",
    );
    tasks.push(task);
    let (volume_snapshot_classes, task) = reflect(
        Api::<VolumeSnapshotClass>::all(client.clone()),
        wc.clone(),
        "VolumeSnapshotClass",
    );
    tasks.push(task);
    let (contents, task) = reflect(
        api::<VirtualMachineSnapshotContent>(client, ns),
        wc.clone(),
        "VirtualMachineSnapshotContent",
    );
    tasks.push(task);
    let (volume_snapshots, task) = reflect(api::<VolumeSnapshot>(client, ns), wc.clone(), "VolumeSnapshot");
    tasks.push(task);
    let (snapshots, task) = reflect(
        api::<VirtualMachineSnapshot>(client, ns),
        wc,
        "VirtualMachineSnapshot",
    );
    tasks.push(task);

    let cache = ReflectorCache {
        virtual_machines,
        virtual_machine_instances,
        pods,
        persistent_volume_claims,
        storage_classes,
        volume_snapshot_classes,
        contents,
        volume_snapshots,
        snapshots,
    };
    (cache, tasks)
}

/// Snapshot that owns `content`, by its recorded snapshot name
pub fn snapshot_for_content(
    content: &VirtualMachineSnapshotContent,
) -> Option<ObjectRef<VirtualMachineSnapshot>> {
    let name = content.spec.virtual_machine_snapshot_name.as_deref()?;
    let namespace = content.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Build the snapshot and content controller futures
pub fn build_controllers(
    client: Client,
    config: &ControllerConfig,
    cache: ReflectorCache,
) -> Vec<Task> {
    let ns = config.watch_namespace();
    let wc = config.watcher_config();

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(cache.clone()))
            .controller_name(config.controller_name.clone())
            .build(),
    );

    let snapshots: Api<VirtualMachineSnapshot> = api(&client, ns);
    let contents: Api<VirtualMachineSnapshotContent> = api(&client, ns);
    let vms: Api<VirtualMachine> = api(&client, ns);
    let volume_snapshots: Api<VolumeSnapshot> = api(&client, ns);

    tracing::info!("- VirtualMachineSnapshot controller");
    let snapshot_ctrl = Controller::new(snapshots, wc.clone())
        .watches(contents.clone(), wc.clone(), |content| {
            snapshot_for_content(&content)
        })
        .watches(vms, wc.clone(), move |vm| {
            let Some(namespace) = vm.namespace() else {
                return vec![];
            };
            let affected = cache.snapshots_for_vm(&namespace, &vm.name_any());
            tracing::debug!(
                vm = %vm.name_any(),
                namespace = %namespace,
                affected_count = affected.len(),
                "Triggering re-reconciliation of snapshots of VM"
            );
            affected
        })
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx.clone())
        .for_each(log_reconcile_result("VirtualMachineSnapshot"));

    tracing::info!("- VirtualMachineSnapshotContent controller");
    let content_ctrl = Controller::new(contents, wc.clone())
        .owns(volume_snapshots, wc)
        .shutdown_on_signal()
        .run(content::reconcile, content::error_policy, ctx)
        .for_each(log_reconcile_result("VirtualMachineSnapshotContent"));

    vec![Box::pin(snapshot_ctrl), Box::pin(content_ctrl)]
}

fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
