//! stasis operator: CLI configuration and controller wiring

#![deny(missing_docs)]

/// CLI and runtime configuration
pub mod config;
/// Reflectors and controller loops
pub mod controller_runner;
