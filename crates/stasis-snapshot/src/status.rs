//! Snapshot status computation
//!
//! Pure functions from observed state to the status a snapshot should carry.
//! The reconciler compares the result with the stored status and writes only
//! on difference.

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use stasis_common::crd::{
    update_condition, Condition, ConditionStatus, ConditionType, SnapshotError,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotStatus,
};

use crate::source::SnapshotSource;

/// Condition reasons
pub mod reasons {
    /// Progressing=True
    pub const LOCKED_IN_PROGRESS: &str = "Source locked and operation in progress";
    /// Progressing=False while the lock is being taken
    pub const NOT_LOCKED: &str = "Source not locked";
    /// Progressing=False when the source is gone
    pub const NO_SOURCE: &str = "Source does not exist";
    /// Ready=False while progressing
    pub const NOT_READY: &str = "Not ready";
    /// Progressing=False once errored
    pub const IN_ERROR_STATE: &str = "In error state";
    /// Ready=False once errored
    pub const ERROR: &str = "Error";
    /// Both conditions once ready
    pub const COMPLETE: &str = "Operation complete";
    /// Both conditions when the state is inconsistent
    pub const UNKNOWN: &str = "Unknown state";
    /// Both conditions after deletion interrupted the snapshot
    pub const CANCELLED: &str = "Snapshot cancelled";
}

/// Error message recorded when an in-progress snapshot is deleted
pub const CANCELLED_MESSAGE: &str = "Snapshot cancelled";

/// How the source looks from this snapshot's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    /// Both lock fields name this snapshot
    Locked,
    /// The source exists but this snapshot does not hold its lock
    Unlocked,
    /// The source does not exist
    Missing,
}

impl SourceState {
    /// Observe `source`
    pub fn of(source: Option<&dyn SnapshotSource>) -> Self {
        match source {
            Some(s) if s.locked() => Self::Locked,
            Some(_) => Self::Unlocked,
            None => Self::Missing,
        }
    }
}

/// `(status, reason)` of one condition
pub type ConditionValue = (ConditionStatus, &'static str);

/// Decision table for the Progressing and Ready conditions
pub fn conditions_for(
    progressing: bool,
    errored: bool,
    ready: bool,
    source: SourceState,
) -> (ConditionValue, ConditionValue) {
    use ConditionStatus::{False, True, Unknown};

    if progressing {
        let p = match source {
            SourceState::Locked => (True, reasons::LOCKED_IN_PROGRESS),
            SourceState::Unlocked => (False, reasons::NOT_LOCKED),
            SourceState::Missing => (False, reasons::NO_SOURCE),
        };
        (p, (False, reasons::NOT_READY))
    } else if errored {
        ((False, reasons::IN_ERROR_STATE), (False, reasons::ERROR))
    } else if ready {
        ((False, reasons::COMPLETE), (True, reasons::COMPLETE))
    } else {
        ((Unknown, reasons::UNKNOWN), (Unknown, reasons::UNKNOWN))
    }
}

fn apply_conditions(
    status: &mut VirtualMachineSnapshotStatus,
    (progressing, ready): (ConditionValue, ConditionValue),
    now: DateTime<Utc>,
) {
    update_condition(
        &mut status.conditions,
        Condition::new(ConditionType::Progressing, progressing.0, progressing.1, now),
    );
    update_condition(
        &mut status.conditions,
        Condition::new(ConditionType::Ready, ready.0, ready.1, now),
    );
}

/// Status a snapshot should carry given its content and source
///
/// Readiness and creation time are taken from initialized content. A content
/// error is copied over but never cleared from the snapshot.
pub fn compute_status(
    current: &VirtualMachineSnapshotStatus,
    content: Option<&VirtualMachineSnapshotContent>,
    source: Option<&dyn SnapshotSource>,
    now: DateTime<Utc>,
) -> VirtualMachineSnapshotStatus {
    let mut status = current.clone();

    if let Some(source) = source {
        status.source_uid = source.uid();
    }

    if let Some(content) = content {
        if let Some(content_status) = &content.status {
            status.virtual_machine_snapshot_content_name = Some(content.name_any());
            status.creation_time = content_status.creation_time;
            status.ready_to_use = content_status.ready_to_use;
            if content_status.error.is_some() {
                status.error = content_status.error.clone();
            }
        }
    }

    let errored = status.error.is_some();
    let ready = status.ready_to_use.unwrap_or(false);
    let progressing = !errored && !ready;
    apply_conditions(
        &mut status,
        conditions_for(progressing, errored, ready, SourceState::of(source)),
        now,
    );
    status
}

/// Status recorded when an in-progress snapshot is deleted
pub fn cancelled_status(
    current: &VirtualMachineSnapshotStatus,
    now: DateTime<Utc>,
) -> VirtualMachineSnapshotStatus {
    let mut status = current.clone();
    status.ready_to_use = Some(false);
    status.error = Some(SnapshotError::new(CANCELLED_MESSAGE, now));
    apply_conditions(
        &mut status,
        (
            (ConditionStatus::False, reasons::CANCELLED),
            (ConditionStatus::False, reasons::CANCELLED),
        ),
        now,
    );
    status
}
