//! VirtualMachineSnapshot Custom Resource Definition
//!
//! A VirtualMachineSnapshot asks for a crash-consistent copy of a source
//! (today: a halted VirtualMachine). The controller locks the source, records
//! its configuration in a generated VirtualMachineSnapshotContent and reports
//! progress through `status`.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SnapshotError};
use crate::{Error, Result};

/// Prefix of the generated content name
const CONTENT_NAME_PREFIX: &str = "vmsnapshot-content";

/// What happens to the content when its snapshot is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Delete the content and its volume snapshots
    #[default]
    Delete,
    /// Leave the content in place
    Retain,
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "Delete"),
            Self::Retain => write!(f, "Retain"),
        }
    }
}

/// Specification for a VirtualMachineSnapshot
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.stasis.dev",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshot",
    plural = "virtualmachinesnapshots",
    shortname = "vmsnapshot",
    namespaced,
    status = "VirtualMachineSnapshotStatus",
    printcolumn = r#"{"name":"SourceKind","type":"string","jsonPath":".spec.source.kind"}"#,
    printcolumn = r#"{"name":"SourceName","type":"string","jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"CreationTime","type":"date","jsonPath":".status.creationTime"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.error.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    /// The object to snapshot
    pub source: TypedLocalObjectReference,

    /// Content handling on deletion; `Delete` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// Status of a VirtualMachineSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    /// UID of the source at the time it was snapshotted
    #[serde(
        default,
        rename = "sourceUID",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_uid: Option<String>,

    /// Name of the generated content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,

    /// When the content became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Whether the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Terminal error for this attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,

    /// Progressing and Ready conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VirtualMachineSnapshot {
    /// The snapshot completed and is usable
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// The recorded error, if the snapshot failed
    pub fn error(&self) -> Option<&SnapshotError> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }

    /// Neither ready nor errored
    pub fn is_progressing(&self) -> bool {
        self.error().is_none() && !self.is_ready()
    }

    /// Deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Effective deletion policy
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }

    /// UID assigned by the API server
    pub fn require_uid(&self) -> Result<String> {
        self.uid().ok_or_else(|| {
            Error::internal_with_context(
                "snapshot",
                format!("VirtualMachineSnapshot {} has no UID", self.name_any()),
            )
        })
    }

    /// Deterministic name of this snapshot's content
    ///
    /// A name already recorded in status wins, so a rename of the prefix can
    /// never orphan existing content.
    pub fn content_name(&self) -> Result<String> {
        if let Some(name) = self
            .status
            .as_ref()
            .and_then(|s| s.virtual_machine_snapshot_content_name.clone())
        {
            return Ok(name);
        }
        Ok(format!("{CONTENT_NAME_PREFIX}-{}", self.require_uid()?))
    }

    /// Deterministic name of the VolumeSnapshot backing `volume_name`
    pub fn volume_snapshot_name(&self, volume_name: &str) -> Result<String> {
        Ok(format!("vmsnapshot-{}-volume-{volume_name}", self.require_uid()?))
    }
}
