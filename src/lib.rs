//! kore - single-binary controller for a lightweight Kubernetes-compatible
//! cluster distribution
//!
//! `kore server` boots the control plane of one node: it decides from an
//! optional join token whether this node founds a new cluster or joins an
//! existing one, brings the control-plane processes up in dependency order,
//! keeps a set of in-cluster add-on reconcilers running, optionally enables
//! worker processes on the same node, and tears everything down on
//! SIGINT/SIGTERM.
//!
//! # Modules
//!
//! - [`component`] - Component lifecycle contract and the ordered manager
//! - [`config`] - Cluster configuration model and node directory layout
//! - [`join`] - Join token codec and the client for a peer's control API
//! - [`pki`] - Certificate authority, leaf issuance, kubeconfig rendering
//! - [`server`] - Control-plane components (storage, api-server, ...)
//! - [`reconciler`] - Add-on reconcilers and their supervision set
//! - [`worker`] - Worker enablement (containerd + kubelet)
//! - [`shutdown`] - Signal-driven shutdown sequencing
//! - [`supervisor`] - Child-process supervision with restart backoff
//! - [`retry`] - Bounded retry with exponential backoff
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod component;
pub mod config;
pub mod error;
pub mod join;
pub mod pki;
pub mod reconciler;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default configuration file path for the `server` subcommand
pub const DEFAULT_CONFIG_PATH: &str = "kore.yaml";

/// Default data directory for all node-local state
pub const DEFAULT_DATA_DIR: &str = "/var/lib/kore";

/// Port the local control API listens on
///
/// Joining nodes reach this port on an existing controller to fetch CA
/// material and consensus-store join information.
pub const CONTROL_API_PORT: u16 = 9443;
