//! VirtualMachineSnapshotContent Custom Resource Definition
//!
//! Content is generated once per snapshot. Its spec is a frozen copy of the
//! source taken while the source was locked plus one backup entry per
//! volume; only its status changes afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::SnapshotError;

/// Schema for an opaque embedded object the API server must store verbatim
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), Value::Bool(true));
    Schema::Object(schema)
}

/// Specification for a VirtualMachineSnapshotContent
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.stasis.dev",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshotContent",
    plural = "virtualmachinesnapshotcontents",
    shortname = "vmsnapshotcontent",
    namespaced,
    status = "VirtualMachineSnapshotContentStatus",
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"CreationTime","type":"date","jsonPath":".status.creationTime"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.error.message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    /// Snapshot this content was generated for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,

    /// Frozen copy of the source
    pub source: SourceSpec,

    /// One entry per snapshotted volume
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

/// Frozen source configuration; exactly one member is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// VirtualMachine with status cleared and server metadata stripped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub virtual_machine: Option<Value>,
}

/// Backup of a single volume
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    /// Name of the volume in the source
    pub volume_name: String,

    /// Claim backing the volume, as it was at lock time
    pub persistent_volume_claim: PersistentVolumeClaimCopy,

    /// VolumeSnapshot to create for this volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

/// Claim identity and spec without status or server-managed metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimCopy {
    /// Claim name
    pub name: String,

    /// Claim labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Claim annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Claim spec
    pub spec: PersistentVolumeClaimSpec,
}

impl PersistentVolumeClaimCopy {
    /// Storage class requested by the claim, if any
    pub fn storage_class(&self) -> Option<&str> {
        self.spec
            .storage_class_name
            .as_deref()
            .filter(|s| !s.is_empty())
    }
}

/// Status of a VirtualMachineSnapshotContent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    /// Set once, when every volume first became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Every volume snapshot is ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Aggregate error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,

    /// Observed state of each VolumeSnapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_status: Vec<VolumeSnapshotStatus>,
}

/// Observed state of one VolumeSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// VolumeSnapshot name
    pub volume_snapshot_name: String,

    /// When the storage layer cut the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,

    /// Whether the storage layer reports it usable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    /// Error reported by the storage layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

impl VirtualMachineSnapshotContent {
    /// Every volume snapshot is ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// The aggregate error, if any
    pub fn error(&self) -> Option<&SnapshotError> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }

    /// Deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
