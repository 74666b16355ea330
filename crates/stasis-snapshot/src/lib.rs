//! VirtualMachineSnapshot and VirtualMachineSnapshotContent reconcilers
//!
//! The snapshot reconciler locks a quiesced source, freezes it into a
//! content object and reports progress on the snapshot. The content
//! reconciler creates one VolumeSnapshot per backed-up volume and rolls
//! their state up into the content status.

#![deny(missing_docs)]

/// Watch-fed read cache
pub mod cache;
/// StorageClass to VolumeSnapshotClass resolution
pub mod class;
/// Mutating API calls
pub mod client;
/// Content reconciler
pub mod content;
/// Snapshot reconciler
pub mod controller;
/// Snapshot source abstraction
pub mod source;
/// Snapshot status and condition computation
pub mod status;

#[cfg(test)]
mod fake;

pub use cache::{ReflectorCache, SnapshotCache};
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
