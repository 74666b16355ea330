//! VirtualMachineSnapshot controller implementation
//!
//! Each pass reads the snapshot, its source and its content from the cache
//! and makes at most one write. The first applicable branch wins:
//!
//! 1. no status: initialize it
//! 2. ready or errored with a live source: release the source lock
//! 3. deletion requested: cancel, release content, release the snapshot
//! 4. progressing: take the source lock, add the snapshot finalizer, create
//!    the content
//! 5. otherwise: recompute status and write it if it changed
//!
//! Progress between passes is carried entirely by the objects themselves,
//! so a restarted controller picks up where the previous one stopped.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use stasis_common::crd::{
    DeletionPolicy, PersistentVolumeClaimCopy, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentSpec,
    VirtualMachineSnapshotStatus, VolumeBackup,
};
use stasis_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use stasis_common::kube_utils::{cache_key, finalizers_with, finalizers_without, has_finalizer};
use stasis_common::{Clock, Error, SystemClock, CONTENT_FINALIZER, SNAPSHOT_FINALIZER};

use crate::cache::SnapshotCache;
use crate::class::snapshot_class_for;
use crate::client::{KubeSnapshotClient, SnapshotClient};
use crate::source::{resolve_source, SnapshotSource};
use crate::status::{cancelled_status, compute_status};

/// Requeue interval while the source lock is being taken
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Requeue interval after losing an optimistic-concurrency race
pub const CONFLICT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Requeue interval after any other failure
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default name reported on events
pub const DEFAULT_CONTROLLER_NAME: &str = "stasis-snapshot-controller";

/// Controller context shared by the snapshot and content reconcilers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, cache)
///     .controller_name("stasis-snapshot-controller")
///     .build();
/// ```
pub struct Context {
    /// Watch-fed read cache
    pub cache: Arc<dyn SnapshotCache>,
    /// Mutating API calls
    pub client: Arc<dyn SnapshotClient>,
    /// Kubernetes event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Time source for every timestamp written to status
    pub clock: Arc<dyn Clock>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, cache: Arc<dyn SnapshotCache>) -> ContextBuilder {
        ContextBuilder::new(client, cache)
    }

    /// Create a context for testing without a real Kubernetes client
    #[cfg(test)]
    pub fn for_testing(
        cache: Arc<dyn SnapshotCache>,
        client: Arc<dyn SnapshotClient>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            client,
            events,
            clock,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    cache: Arc<dyn SnapshotCache>,
    snapshot_client: Option<Arc<dyn SnapshotClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
    controller_name: String,
}

impl ContextBuilder {
    fn new(client: Client, cache: Arc<dyn SnapshotCache>) -> Self {
        Self {
            client,
            cache,
            snapshot_client: None,
            events: None,
            clock: None,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        }
    }

    /// Name reported as the reporting component on events
    pub fn controller_name(mut self, name: impl Into<String>) -> Self {
        self.controller_name = name.into();
        self
    }

    /// Override the write client
    pub fn snapshot_client(mut self, client: Arc<dyn SnapshotClient>) -> Self {
        self.snapshot_client = Some(client);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            cache: self.cache,
            client: self
                .snapshot_client
                .unwrap_or_else(|| Arc::new(KubeSnapshotClient::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    &self.controller_name,
                ))
            }),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        }
    }
}

/// Reconcile a VirtualMachineSnapshot
#[instrument(
    skip(snapshot, ctx),
    fields(snapshot = %snapshot.name_any(), namespace = %snapshot.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    snapshot: Arc<VirtualMachineSnapshot>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    debug!("reconciling snapshot");
    let source = resolve_source(&snapshot, &ctx);

    let Some(current) = snapshot.status.as_ref() else {
        let initial = VirtualMachineSnapshotStatus {
            ready_to_use: Some(false),
            ..Default::default()
        };
        let observed = source.as_ref().ok().and_then(|s| s.as_deref());
        let status = compute_status(&initial, None, observed, ctx.clock.now());
        info!("Initializing snapshot status");
        ctx.client.update_snapshot_status(&snapshot, &status).await?;
        return Ok(Action::await_change());
    };

    let source = match source {
        Ok(source) => source,
        Err(e) => {
            if matches!(e, Error::UnknownSource { .. }) {
                ctx.events
                    .publish(
                        &snapshot.object_ref(&()),
                        EventType::Warning,
                        reasons::UNKNOWN_SOURCE,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            return Err(e);
        }
    };

    if !snapshot.is_progressing() {
        if let Some(source) = &source {
            if source.unlock().await? {
                return Ok(Action::await_change());
            }
        }
    }

    if snapshot.is_deleting() {
        return cleanup(&snapshot, &ctx).await;
    }

    let namespace = snapshot.namespace().unwrap_or_default();
    let content_name = snapshot.content_name()?;

    if snapshot.is_progressing() {
        if let Some(source) = &source {
            if !source.locked() {
                let locked = source.lock().await?;
                debug!(locked, "Lock attempt finished, requeueing");
                return Ok(Action::requeue(LOCK_RETRY_INTERVAL));
            }

            if !has_finalizer(&snapshot.metadata, SNAPSHOT_FINALIZER) {
                info!("Adding snapshot finalizer");
                ctx.client
                    .set_snapshot_finalizers(
                        &snapshot,
                        finalizers_with(&snapshot.metadata, SNAPSHOT_FINALIZER),
                    )
                    .await?;
                return Ok(Action::await_change());
            }

            if ctx.cache.content(&namespace, &content_name).is_none() {
                create_content(&snapshot, source.as_ref(), &ctx).await?;
                return Ok(Action::await_change());
            }
        }
    }

    let content = ctx.cache.content(&namespace, &content_name);
    let status = compute_status(
        current,
        content.as_deref(),
        source.as_deref(),
        ctx.clock.now(),
    );
    if Some(&status) != snapshot.status.as_ref() {
        debug!(ready = ?status.ready_to_use, "Updating snapshot status");
        ctx.client.update_snapshot_status(&snapshot, &status).await?;
    }

    Ok(Action::await_change())
}

/// Deletion path, one step per pass
///
/// Cancel an in-progress snapshot, then release the content finalizer,
/// delete the content unless retained, and release the snapshot finalizer.
async fn cleanup(snapshot: &VirtualMachineSnapshot, ctx: &Context) -> Result<Action, Error> {
    if snapshot.is_progressing() {
        info!("Cancelling in-progress snapshot");
        let current = snapshot.status.clone().unwrap_or_default();
        ctx.client
            .update_snapshot_status(snapshot, &cancelled_status(&current, ctx.clock.now()))
            .await?;
        return Ok(Action::await_change());
    }

    let namespace = snapshot.namespace().unwrap_or_default();
    let content_name = snapshot.content_name()?;

    if let Some(content) = ctx.cache.content(&namespace, &content_name) {
        if has_finalizer(&content.metadata, CONTENT_FINALIZER) {
            info!(content = %content_name, "Removing content finalizer");
            ctx.client
                .set_content_finalizers(
                    &content,
                    finalizers_without(&content.metadata, CONTENT_FINALIZER),
                )
                .await?;
            return Ok(Action::await_change());
        }

        if snapshot.deletion_policy() == DeletionPolicy::Delete && !content.is_deleting() {
            info!(content = %content_name, "Deleting content");
            match ctx.client.delete_content(&namespace, &content_name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(content = %content_name, "Content already gone"),
                Err(e) => return Err(e),
            }
            return Ok(Action::await_change());
        }
    }

    if has_finalizer(&snapshot.metadata, SNAPSHOT_FINALIZER) {
        info!("Removing snapshot finalizer");
        ctx.client
            .set_snapshot_finalizers(
                snapshot,
                finalizers_without(&snapshot.metadata, SNAPSHOT_FINALIZER),
            )
            .await?;
    }

    Ok(Action::await_change())
}

/// Freeze the locked source into a new content object
async fn create_content(
    snapshot: &VirtualMachineSnapshot,
    source: &dyn SnapshotSource,
    ctx: &Context,
) -> Result<(), Error> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let name = snapshot.content_name()?;

    let mut volume_backups = Vec::new();
    for volume in source.volumes() {
        let Some(claim) = snapshot_claim(ctx, &namespace, &volume.claim_name)? else {
            continue;
        };
        volume_backups.push(VolumeBackup {
            volume_snapshot_name: Some(snapshot.volume_snapshot_name(&volume.volume_name)?),
            volume_name: volume.volume_name,
            persistent_volume_claim: claim,
        });
    }

    let mut content = VirtualMachineSnapshotContent::new(
        &name,
        VirtualMachineSnapshotContentSpec {
            virtual_machine_snapshot_name: Some(snapshot.name_any()),
            source: source.spec()?,
            volume_backups,
        },
    );
    content.metadata.namespace = Some(namespace);
    content.metadata.finalizers = Some(vec![CONTENT_FINALIZER.to_string()]);

    match ctx.client.create_content(&content).await {
        Ok(()) => {
            info!(content = %name, volumes = content.spec.volume_backups.len(), "Created content");
            ctx.events
                .publish(
                    &snapshot.object_ref(&()),
                    EventType::Normal,
                    reasons::CONTENT_CREATED,
                    actions::CREATE,
                    Some(format!(
                        "Successfully created VirtualMachineSnapshotContent {name}"
                    )),
                )
                .await;
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(content = %name, "Content already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Copy of a claim if it can be snapshotted
///
/// The claim must exist, be bound and carry a storage class that maps to a
/// VolumeSnapshotClass. Other claims are skipped with a warning.
fn snapshot_claim(
    ctx: &Context,
    namespace: &str,
    claim_name: &str,
) -> Result<Option<PersistentVolumeClaimCopy>, Error> {
    let claim_key = cache_key(namespace, claim_name);
    let Some(pvc) = ctx.cache.persistent_volume_claim(namespace, claim_name) else {
        warn!(claim = %claim_key, "Claim does not exist, skipping volume");
        return Ok(None);
    };

    let spec = pvc.spec.clone().unwrap_or_default();
    if spec.volume_name.as_deref().unwrap_or_default().is_empty() {
        warn!(claim = %claim_key, "Claim is not bound, skipping volume");
        return Ok(None);
    }

    let Some(storage_class) = spec.storage_class_name.as_deref().filter(|s| !s.is_empty()) else {
        warn!(claim = %claim_key, "Claim has no storage class, skipping volume");
        return Ok(None);
    };

    if snapshot_class_for(ctx.cache.as_ref(), storage_class)?.is_none() {
        warn!(claim = %claim_key, storage_class, "No VolumeSnapshotClass, skipping volume");
        return Ok(None);
    }

    Ok(Some(PersistentVolumeClaimCopy {
        name: claim_name.to_string(),
        labels: pvc.labels().clone(),
        annotations: pvc.annotations().clone(),
        spec,
    }))
}

/// Requeue policy shared by both controllers
pub(crate) fn retry_after(error: &Error, kind: &str, name: &str) -> Action {
    if error.is_conflict() {
        debug!(kind, name, error = %error, "Write conflict, retrying");
        return Action::requeue(CONFLICT_RETRY_INTERVAL);
    }
    if error.is_retryable() {
        warn!(kind, name, error = %error, "Transient API error, retrying");
        return Action::requeue(ERROR_RETRY_INTERVAL);
    }
    error!(kind, name, error = %error, "Reconciliation failed");
    Action::requeue(ERROR_RETRY_INTERVAL)
}

/// Error policy for the snapshot controller
pub fn error_policy(
    snapshot: Arc<VirtualMachineSnapshot>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    retry_after(error, "VirtualMachineSnapshot", &snapshot.name_any())
}
