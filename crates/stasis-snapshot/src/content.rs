//! VirtualMachineSnapshotContent controller implementation
//!
//! Drives the VolumeSnapshots listed in a content's volume backups and rolls
//! their state up into the content status. A VolumeSnapshot is created only
//! while the content has never been ready or errored; one that disappears
//! after that is reported, not recreated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use stasis_common::crd::{
    SnapshotError, VirtualMachineSnapshotContent, VirtualMachineSnapshotContentStatus,
    VolumeBackup, VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec, VolumeSnapshotStatus,
};
use stasis_common::events::{actions, reasons};
use stasis_common::kube_utils::cache_key;
use stasis_common::Error;

use crate::class::snapshot_class_for;
use crate::controller::{retry_after, Context};

/// Error message when VolumeSnapshots vanished after the content was ready
pub fn missing_message(names: &[String]) -> String {
    format!("VolumeSnapshots ({}) missing", names.join(","))
}

/// Error message when VolumeSnapshots were not created because the content
/// had already failed
pub fn skipped_message(names: &[String]) -> String {
    format!(
        "VolumeSnapshots ({}) skipped because in error state",
        names.join(",")
    )
}

/// Error message when any VolumeSnapshot reports an error
pub const VOLUME_SNAPSHOT_ERROR_MESSAGE: &str = "VolumeSnapshot in error state";

/// What one pass saw of a content's VolumeSnapshots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Per-volume state, for VolumeSnapshots that exist or were just created
    pub volumes: Vec<VolumeSnapshotStatus>,
    /// VolumeSnapshots gone after the content was ready
    pub missing: Vec<String>,
    /// VolumeSnapshots not created because the content had errored
    pub skipped: Vec<String>,
}

/// Roll an observation up into the content status
///
/// Creation time is stamped once, the first time the content is ready. An
/// error is replaced only when its message changes and is never cleared.
pub fn aggregate_status(
    current: &VirtualMachineSnapshotContentStatus,
    observation: Observation,
    now: DateTime<Utc>,
) -> VirtualMachineSnapshotContentStatus {
    let (ready, message) = if !observation.missing.is_empty() {
        (false, Some(missing_message(&observation.missing)))
    } else if !observation.skipped.is_empty() {
        (false, Some(skipped_message(&observation.skipped)))
    } else {
        let ready = observation
            .volumes
            .iter()
            .all(|v| v.ready_to_use == Some(true));
        let errored = observation
            .volumes
            .iter()
            .any(|v| v.error.as_ref().is_some_and(|e| e.message.is_some()));
        (ready, errored.then(|| VOLUME_SNAPSHOT_ERROR_MESSAGE.to_string()))
    };

    let mut status = current.clone();
    if ready && status.creation_time.is_none() {
        status.creation_time = Some(now);
    }
    if let Some(message) = message {
        let unchanged = status
            .error
            .as_ref()
            .and_then(|e| e.message.as_deref())
            == Some(message.as_str());
        if !unchanged {
            status.error = Some(SnapshotError::new(message, now));
        }
    }
    status.ready_to_use = Some(ready);
    status.volume_snapshot_status = observation.volumes;
    status
}

fn volume_status(name: &str, volume_snapshot: Option<&VolumeSnapshot>) -> VolumeSnapshotStatus {
    let mut status = VolumeSnapshotStatus {
        volume_snapshot_name: name.to_string(),
        ..Default::default()
    };
    if let Some(state) = volume_snapshot.and_then(|vs| vs.status.as_ref()) {
        status.ready_to_use = state.ready_to_use;
        status.creation_time = state.creation_time;
        status.error = state.error.as_ref().map(|e| SnapshotError {
            time: e.time,
            message: e.message.clone(),
        });
    }
    status
}

/// Reconcile a VirtualMachineSnapshotContent
#[instrument(
    skip(content, ctx),
    fields(content = %content.name_any(), namespace = %content.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    content: Arc<VirtualMachineSnapshotContent>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if content.is_deleting() {
        debug!("content is being deleted");
        return Ok(Action::await_change());
    }

    let namespace = content.namespace().unwrap_or_default();
    let was_ready = content.is_ready();
    let was_errored = content.error().is_some();

    let mut observation = Observation::default();
    for backup in &content.spec.volume_backups {
        let Some(name) = backup.volume_snapshot_name.as_deref() else {
            continue;
        };

        let existing = ctx.cache.volume_snapshot(&namespace, name);
        if existing.is_none() {
            if was_ready {
                warn!(volume_snapshot = %name, "VolumeSnapshot missing");
                ctx.events
                    .publish(
                        &content.object_ref(&()),
                        EventType::Warning,
                        reasons::VOLUME_SNAPSHOT_MISSING,
                        actions::RECONCILE,
                        Some(format!("VolumeSnapshot {name} is missing")),
                    )
                    .await;
                observation.missing.push(name.to_string());
                continue;
            }
            if was_errored {
                debug!(volume_snapshot = %name, "Not creating VolumeSnapshot, content errored");
                observation.skipped.push(name.to_string());
                continue;
            }
            create_volume_snapshot(&content, backup, name, &ctx).await?;
        }

        observation
            .volumes
            .push(volume_status(name, existing.as_deref()));
    }

    let current = content.status.clone().unwrap_or_default();
    let status = aggregate_status(&current, observation, ctx.clock.now());
    if Some(&status) != content.status.as_ref() {
        debug!(ready = ?status.ready_to_use, "Updating content status");
        ctx.client.update_content_status(&content, &status).await?;
    }

    Ok(Action::await_change())
}

async fn create_volume_snapshot(
    content: &VirtualMachineSnapshotContent,
    backup: &VolumeBackup,
    name: &str,
    ctx: &Context,
) -> Result<(), Error> {
    let namespace = content.namespace().unwrap_or_default();
    let claim = &backup.persistent_volume_claim;

    let class = match claim.storage_class() {
        Some(storage_class) => snapshot_class_for(ctx.cache.as_ref(), storage_class).and_then(
            |class| {
                class.ok_or_else(|| {
                    Error::snapshot_class_unresolved(
                        cache_key(&namespace, &claim.name),
                        format!("no VolumeSnapshotClass for storage class {storage_class}"),
                    )
                })
            },
        ),
        None => Err(Error::snapshot_class_unresolved(
            cache_key(&namespace, &claim.name),
            "claim has no storage class",
        )),
    };
    let class = match class {
        Ok(class) => class,
        Err(e) => {
            ctx.events
                .publish(
                    &content.object_ref(&()),
                    EventType::Warning,
                    reasons::SNAPSHOT_CLASS_UNRESOLVED,
                    actions::CREATE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    let owner = OwnerReference {
        api_version: VirtualMachineSnapshotContent::api_version(&()).into_owned(),
        kind: VirtualMachineSnapshotContent::kind(&()).into_owned(),
        name: content.name_any(),
        uid: content.uid().ok_or_else(|| {
            Error::internal_with_context(
                "content",
                format!("VirtualMachineSnapshotContent {} has no UID", content.name_any()),
            )
        })?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let mut volume_snapshot = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim.name.clone()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: Some(class.clone()),
        },
    );
    volume_snapshot.metadata.namespace = Some(namespace);
    volume_snapshot.metadata.owner_references = Some(vec![owner]);

    match ctx.client.create_volume_snapshot(&volume_snapshot).await {
        Ok(()) => {
            info!(volume_snapshot = %name, claim = %claim.name, class = %class, "Created VolumeSnapshot");
            ctx.events
                .publish(
                    &content.object_ref(&()),
                    EventType::Normal,
                    reasons::VOLUME_SNAPSHOT_CREATED,
                    actions::CREATE,
                    Some(format!("Successfully created VolumeSnapshot {name}")),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(volume_snapshot = %name, "VolumeSnapshot already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Error policy for the content controller
pub fn error_policy(
    content: Arc<VirtualMachineSnapshotContent>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    retry_after(error, "VirtualMachineSnapshotContent", &content.name_any())
}
