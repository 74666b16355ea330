//! Command-line interface and controller configuration
//!
//! Every runtime knob has an environment fallback so the operator can be
//! configured from a Deployment manifest without arguments.

use clap::{Args, Parser, Subcommand};
use kube::runtime::watcher::Config as WatcherConfig;

use stasis_snapshot::controller::DEFAULT_CONTROLLER_NAME;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 25;

/// stasis - crash-consistent snapshots of halted virtual machines
#[derive(Parser, Debug)]
#[command(name = "stasis", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Controller settings
    #[command(flatten)]
    pub config: ControllerConfig,

    /// Mode to run in
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator modes
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the snapshot and content controllers (default mode)
    Controller,
}

/// Settings shared by both controllers
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Only watch objects in this namespace (default: all namespaces)
    #[arg(long, env = "STASIS_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Server-side watch timeout in seconds
    #[arg(
        long,
        env = "STASIS_WATCH_TIMEOUT_SECS",
        default_value_t = DEFAULT_WATCH_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u32).range(1..30)
    )]
    pub watch_timeout_secs: u32,

    /// Reporting controller name on Kubernetes events
    #[arg(long, env = "STASIS_CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
        }
    }
}

impl ControllerConfig {
    /// Watcher configuration for every watch the operator opens
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::default().timeout(self.watch_timeout_secs)
    }

    /// Namespace to scope watches to, `None` for the whole cluster
    pub fn watch_namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}
