//! Common types for stasis: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for the snapshot CRDs
pub const SNAPSHOT_API_GROUP: &str = "snapshot.stasis.dev";

/// API version for the snapshot CRDs
pub const SNAPSHOT_API_VERSION: &str = "snapshot.stasis.dev/v1alpha1";

/// Finalizer placed on a source while a snapshot holds its lock
pub const SOURCE_FINALIZER: &str = "snapshot.stasis.dev/snapshot-source-protection";

/// Finalizer placed on a snapshot once its source is locked
pub const SNAPSHOT_FINALIZER: &str = "snapshot.stasis.dev/vmsnapshot-protection";

/// Finalizer placed on a content object at creation
pub const CONTENT_FINALIZER: &str = "snapshot.stasis.dev/vmsnapshotcontent-protection";

/// Annotation marking the default VolumeSnapshotClass for a driver
pub const DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str =
    "snapshot.storage.kubernetes.io/is-default-class";
