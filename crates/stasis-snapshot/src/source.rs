//! Snapshot sources
//!
//! A source is anything a snapshot can be taken of. The reconciler only
//! talks to [`SnapshotSource`]; supporting a new kind means adding an
//! implementation and a branch in [`resolve_source`].
//!
//! # Locking
//!
//! The lock is held through two fields on the source: a status marker naming
//! the snapshot and a finalizer. They cannot be written atomically, so the
//! lock is taken in two passes (marker, then finalizer) and released in the
//! opposite order. [`SnapshotSource::locked`] requires both, which keeps a
//! half-taken or half-released lock from being mistaken for a held one after
//! a restart. A lock whose holder has been deleted is released by the next
//! snapshot that tries to take it, once the API server confirms the holder
//! is gone.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, TypedLocalObjectReference};
use kube::ResourceExt;
use tracing::{debug, info};

use stasis_common::crd::{RunStrategy, SourceSpec, VirtualMachine, VirtualMachineSnapshot};
use stasis_common::kube_utils::{
    finalizers_with, finalizers_without, has_finalizer, strip_export_metadata,
};
use stasis_common::{Error, SOURCE_FINALIZER};

use crate::controller::Context;

/// Kind name of the VirtualMachine source
pub const VIRTUAL_MACHINE_KIND: &str = "VirtualMachine";

/// API group of the VirtualMachine source
pub const VIRTUAL_MACHINE_GROUP: &str = "kubevirt.io";

/// Whether `source` names a kubevirt VirtualMachine
///
/// A missing api group is taken as kubevirt's.
pub fn is_virtual_machine(source: &TypedLocalObjectReference) -> bool {
    let group = source.api_group.as_deref().unwrap_or(VIRTUAL_MACHINE_GROUP);
    source.kind == VIRTUAL_MACHINE_KIND && group == VIRTUAL_MACHINE_GROUP
}

/// A volume of the source and the claim backing it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceVolume {
    /// Volume name within the source
    pub volume_name: String,
    /// Claim backing the volume
    pub claim_name: String,
}

/// Capabilities the reconciler needs from a snapshot source
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// UID of the source object
    fn uid(&self) -> Option<String>;

    /// Both lock fields name this snapshot
    fn locked(&self) -> bool;

    /// Advance lock acquisition by at most one write
    ///
    /// Returns `true` once the lock is fully held. `false` means a
    /// precondition is unmet, another snapshot holds the marker, or the
    /// marker was just written and the pass must end.
    async fn lock(&self) -> Result<bool, Error>;

    /// Advance lock release by at most one write
    ///
    /// Returns `true` if a write was made, `false` if this snapshot does not
    /// hold the marker.
    async fn unlock(&self) -> Result<bool, Error>;

    /// Point-in-time copy of the source's configuration
    fn spec(&self) -> Result<SourceSpec, Error>;

    /// Claim-backed volumes, in declaration order
    fn volumes(&self) -> Vec<SourceVolume>;
}

/// Look up the source named by `snapshot`
///
/// `Ok(None)` means the source does not exist (yet, or anymore). A kind
/// without an implementation is an error.
pub fn resolve_source(
    snapshot: &Arc<VirtualMachineSnapshot>,
    ctx: &Arc<Context>,
) -> Result<Option<Box<dyn SnapshotSource>>, Error> {
    let source = &snapshot.spec.source;

    if is_virtual_machine(source) {
        let namespace = snapshot.namespace().unwrap_or_default();
        return Ok(ctx
            .cache
            .virtual_machine(&namespace, &source.name)
            .map(|vm| {
                Box::new(VmSnapshotSource {
                    vm,
                    snapshot: snapshot.clone(),
                    ctx: ctx.clone(),
                }) as Box<dyn SnapshotSource>
            }));
    }

    Err(Error::unknown_source(&source.kind, &source.name))
}

/// A halted VirtualMachine as a snapshot source
pub struct VmSnapshotSource {
    vm: Arc<VirtualMachine>,
    snapshot: Arc<VirtualMachineSnapshot>,
    ctx: Arc<Context>,
}

impl VmSnapshotSource {
    fn snapshot_name(&self) -> String {
        self.snapshot.name_any()
    }

    fn holds_marker(&self) -> bool {
        self.vm.snapshot_in_progress() == Some(self.snapshot_name().as_str())
    }

    /// Whether the VM's disks are guaranteed not to be written to
    fn quiesced(&self) -> Result<bool, Error> {
        let vm_name = self.vm.name_any();
        let namespace = self.vm.namespace().unwrap_or_default();

        let strategy = self.vm.run_strategy()?;
        if strategy != RunStrategy::Halted {
            debug!(vm = %vm_name, ?strategy, "VM is not halted");
            return Ok(false);
        }

        if self
            .ctx
            .cache
            .virtual_machine_instance(&namespace, &vm_name)
            .is_some()
        {
            debug!(vm = %vm_name, "VM has a running instance");
            return Ok(false);
        }

        let volumes = self.volumes();
        let claims: BTreeSet<&str> = volumes.iter().map(|v| v.claim_name.as_str()).collect();
        let pods = pods_using_claims(&self.ctx.cache.pods(&namespace), &claims);
        if !pods.is_empty() {
            debug!(vm = %vm_name, pods = ?pods, "VM volumes are in use");
            return Ok(false);
        }

        Ok(true)
    }

    /// Take down whichever lock field is still up, finalizer first
    async fn release(&self) -> Result<(), Error> {
        if has_finalizer(&self.vm.metadata, SOURCE_FINALIZER) {
            info!(vm = %self.vm.name_any(), "Removing source finalizer");
            self.ctx
                .client
                .set_vm_finalizers(
                    &self.vm,
                    finalizers_without(&self.vm.metadata, SOURCE_FINALIZER),
                )
                .await?;
            return Ok(());
        }

        info!(vm = %self.vm.name_any(), "Clearing VM snapshot in progress");
        self.ctx
            .client
            .set_vm_snapshot_in_progress(&self.vm, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotSource for VmSnapshotSource {
    fn uid(&self) -> Option<String> {
        self.vm.uid()
    }

    fn locked(&self) -> bool {
        self.holds_marker() && has_finalizer(&self.vm.metadata, SOURCE_FINALIZER)
    }

    async fn lock(&self) -> Result<bool, Error> {
        if self.locked() {
            return Ok(true);
        }

        if !self.quiesced()? {
            return Ok(false);
        }

        let snapshot = self.snapshot_name();
        match self.vm.snapshot_in_progress() {
            Some(holder) if holder != snapshot => {
                let namespace = self.vm.namespace().unwrap_or_default();
                // The snapshot store may lag behind the VM store, so a holder
                // missing from the cache is only released once the API agrees.
                if self.ctx.cache.snapshot(&namespace, holder).is_some()
                    || self.ctx.client.snapshot_exists(&namespace, holder).await?
                {
                    debug!(vm = %self.vm.name_any(), holder, "VM locked by another snapshot");
                } else {
                    info!(vm = %self.vm.name_any(), holder, "Releasing lock of deleted snapshot");
                    self.release().await?;
                }
                Ok(false)
            }
            None => {
                info!(vm = %self.vm.name_any(), "Marking VM snapshot in progress");
                self.ctx
                    .client
                    .set_vm_snapshot_in_progress(&self.vm, Some(snapshot))
                    .await?;
                Ok(false)
            }
            Some(_) => {
                info!(vm = %self.vm.name_any(), "Adding source finalizer");
                self.ctx
                    .client
                    .set_vm_finalizers(&self.vm, finalizers_with(&self.vm.metadata, SOURCE_FINALIZER))
                    .await?;
                Ok(true)
            }
        }
    }

    async fn unlock(&self) -> Result<bool, Error> {
        if !self.holds_marker() {
            return Ok(false);
        }
        self.release().await?;
        Ok(true)
    }

    fn spec(&self) -> Result<SourceSpec, Error> {
        let mut vm = (*self.vm).clone();
        strip_export_metadata(&mut vm.metadata);
        vm.status = None;
        Ok(SourceSpec {
            virtual_machine: Some(serde_json::to_value(&vm)?),
        })
    }

    fn volumes(&self) -> Vec<SourceVolume> {
        self.vm
            .volumes()
            .iter()
            .filter_map(|v| {
                v.claim_name().map(|claim| SourceVolume {
                    volume_name: v.name.clone(),
                    claim_name: claim.to_string(),
                })
            })
            .collect()
    }
}

/// Names of non-terminated pods mounting any of `claims`
fn pods_using_claims(pods: &[Arc<Pod>], claims: &BTreeSet<&str>) -> Vec<String> {
    pods.iter()
        .filter(|pod| {
            !matches!(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                Some("Succeeded") | Some("Failed")
            )
        })
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|pvc| claims.contains(pvc.claim_name.as_str()))
                    })
                })
        })
        .map(|pod| pod.name_any())
        .collect()
}
