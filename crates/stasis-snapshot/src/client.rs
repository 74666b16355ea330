//! API side of the reconcilers
//!
//! Everything here goes to the API server rather than the watch cache. Every
//! update is a merge patch carrying the resourceVersion the caller
//! read from the cache. A write based on a stale view fails with a 409
//! conflict, which the error policies retry quietly.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use stasis_common::crd::{
    VirtualMachine, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotStatus, VolumeSnapshot,
};
use stasis_common::kube_utils::{patch_finalizers, patch_status};
use stasis_common::Error;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "stasis-snapshot-controller";

/// Trait abstracting the Kubernetes calls of both reconcilers
///
/// Object arguments supply the namespace, name and resourceVersion the write
/// is based on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotClient: Send + Sync {
    /// Replace a snapshot's status
    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
        status: &VirtualMachineSnapshotStatus,
    ) -> Result<(), Error>;

    /// Replace a snapshot's finalizer list
    async fn set_snapshot_finalizers(
        &self,
        snapshot: &VirtualMachineSnapshot,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Create a content object
    async fn create_content(&self, content: &VirtualMachineSnapshotContent) -> Result<(), Error>;

    /// Replace a content object's status
    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
        status: &VirtualMachineSnapshotContentStatus,
    ) -> Result<(), Error>;

    /// Replace a content object's finalizer list
    async fn set_content_finalizers(
        &self,
        content: &VirtualMachineSnapshotContent,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Delete a content object
    async fn delete_content(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a VolumeSnapshot
    async fn create_volume_snapshot(&self, volume_snapshot: &VolumeSnapshot) -> Result<(), Error>;

    /// Set or clear a VirtualMachine's lock marker
    async fn set_vm_snapshot_in_progress(
        &self,
        vm: &VirtualMachine,
        snapshot: Option<String>,
    ) -> Result<(), Error>;

    /// Replace a VirtualMachine's finalizer list
    async fn set_vm_finalizers(&self, vm: &VirtualMachine, finalizers: Vec<String>)
        -> Result<(), Error>;

    /// Whether a snapshot exists on the API server, bypassing the cache
    async fn snapshot_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeSnapshotClient {
    client: Client,
}

impl KubeSnapshotClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, obj: &K) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotClient for KubeSnapshotClient {
    async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
        status: &VirtualMachineSnapshotStatus,
    ) -> Result<(), Error> {
        let api = self.namespaced(snapshot);
        patch_status(&api, &snapshot.metadata, serde_json::to_value(status)?, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn set_snapshot_finalizers(
        &self,
        snapshot: &VirtualMachineSnapshot,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api = self.namespaced(snapshot);
        patch_finalizers(&api, &snapshot.metadata, &finalizers, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn create_content(&self, content: &VirtualMachineSnapshotContent) -> Result<(), Error> {
        let api = self.namespaced(content);
        api.create(&PostParams::default(), content).await?;
        Ok(())
    }

    async fn update_content_status(
        &self,
        content: &VirtualMachineSnapshotContent,
        status: &VirtualMachineSnapshotContentStatus,
    ) -> Result<(), Error> {
        let api = self.namespaced(content);
        patch_status(&api, &content.metadata, serde_json::to_value(status)?, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn set_content_finalizers(
        &self,
        content: &VirtualMachineSnapshotContent,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api = self.namespaced(content);
        patch_finalizers(&api, &content.metadata, &finalizers, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn delete_content(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<VirtualMachineSnapshotContent> =
            Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_volume_snapshot(&self, volume_snapshot: &VolumeSnapshot) -> Result<(), Error> {
        let api = self.namespaced(volume_snapshot);
        api.create(&PostParams::default(), volume_snapshot).await?;
        Ok(())
    }

    async fn set_vm_snapshot_in_progress(
        &self,
        vm: &VirtualMachine,
        snapshot: Option<String>,
    ) -> Result<(), Error> {
        let api = self.namespaced(vm);
        patch_status(
            &api,
            &vm.metadata,
            json!({ "snapshotInProgress": snapshot }),
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }

    async fn set_vm_finalizers(
        &self,
        vm: &VirtualMachine,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api = self.namespaced(vm);
        patch_finalizers(&api, &vm.metadata, &finalizers, FIELD_MANAGER).await?;
        Ok(())
    }

    async fn snapshot_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<VirtualMachineSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}
