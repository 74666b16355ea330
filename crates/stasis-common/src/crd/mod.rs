//! Custom Resource Definitions for stasis
//!
//! The two snapshot CRDs owned by this project, plus typed views of the
//! external kinds the controller reads and writes.

mod content;
mod snapshot;
mod types;
mod virtual_machine;
mod volume_snapshot;

pub use content::{
    PersistentVolumeClaimCopy, SourceSpec, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentSpec, VirtualMachineSnapshotContentStatus, VolumeBackup,
    VolumeSnapshotStatus,
};
pub use snapshot::{
    DeletionPolicy, VirtualMachineSnapshot, VirtualMachineSnapshotSpec,
    VirtualMachineSnapshotStatus,
};
pub use types::{
    find_condition, update_condition, Condition, ConditionStatus, ConditionType, SnapshotError,
};
pub use virtual_machine::{
    ClaimVolumeSource, DataVolumeSource, RunStrategy, VirtualMachine,
    VirtualMachineInstance, VirtualMachineInstanceSpec, VirtualMachineInstanceTemplateSpec,
    VirtualMachineSpec, VirtualMachineStatus, Volume,
};
pub use volume_snapshot::{
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotError, VolumeSnapshotSource,
    VolumeSnapshotSpec, VolumeSnapshotState,
};
