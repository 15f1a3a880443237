//! Add-on reconcilers and their supervision set
//!
//! Reconcilers keep optional cluster add-ons (DNS, kube-proxy, CNI, ...)
//! reconciled to desired state once the API is live. They are supervised
//! outside the component manager because they depend on a *running* API,
//! not just an initialized one: they start strictly after the manager's
//! `start` has been attempted and stop strictly before the manager's
//! teardown.
//!
//! Everything about them is best-effort. A reconciler whose constructor
//! fails is absent from the set, never present-but-broken; one add-on's
//! failure never prevents the others from being built, run, or stopped.

pub mod addons;
mod manifests;

pub use manifests::ManifestsSaver;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::config::{ClusterConfig, NodePaths};
use crate::Result;

/// An independent controller driving one add-on toward desired state
#[async_trait]
pub trait Reconciler: Send {
    /// Unique name identifying this reconciler in the set
    fn name(&self) -> &str;

    /// Start reconciling against the live cluster
    async fn run(&mut self) -> Result<()>;

    /// Stop reconciling
    async fn stop(&mut self) -> Result<()>;
}

/// Named collection of independent add-on reconcilers
#[derive(Default)]
pub struct ReconcilerSet {
    entries: BTreeMap<String, Box<dyn Reconciler>>,
}

impl ReconcilerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the full add-on set for this configuration
    ///
    /// Attempts one constructor per add-on; a failure is logged as a warning
    /// and that entry is simply omitted (degraded mode). The network plugin
    /// is only attempted when the configured provider is the one this
    /// controller manages directly.
    pub fn build(config: &ClusterConfig, paths: &NodePaths) -> Self {
        let mut set = Self::new();

        set.add_or_warn("default-psp", addons::default_psp(paths));
        set.add_or_warn("kube-proxy", addons::kube_proxy(config, paths));
        set.add_or_warn("coredns", addons::coredns(config, paths));

        if config.network.provider == "cilium" {
            set.add_or_warn("cilium", addons::cilium(config, paths));
        } else {
            warn!(
                provider = %config.network.provider,
                "network provider set to custom, kore will not manage it"
            );
        }

        set.add_or_warn("metric-server", addons::metric_server(paths));
        set.add_or_warn("kubelet-config", addons::kubelet_config(config, paths));
        set.add_or_warn("system-rbac", addons::system_rbac(paths));

        set
    }

    fn add_or_warn<R: Reconciler + 'static>(&mut self, name: &str, result: Result<R>) {
        match result {
            Ok(reconciler) => self.insert(Box::new(reconciler)),
            Err(e) => warn!(reconciler = name, error = %e, "failed to initialize reconciler"),
        }
    }

    /// Insert a reconciler under its own name
    pub fn insert(&mut self, reconciler: Box<dyn Reconciler>) {
        self.entries.insert(reconciler.name().to_string(), reconciler);
    }

    /// Whether a reconciler with the given name is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names of all present reconcilers
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Number of present reconcilers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every present reconciler; failures are logged, never escalated
    pub async fn run_all(&mut self) {
        for reconciler in self.entries.values_mut() {
            if let Err(e) = reconciler.run().await {
                error!(reconciler = reconciler.name(), error = %e, "failed to start reconciler");
            }
        }
    }

    /// Stop every present reconciler; failures are logged, never escalated
    pub async fn stop_all(&mut self) {
        for reconciler in self.entries.values_mut() {
            if let Err(e) = reconciler.stop().await {
                warn!(reconciler = reconciler.name(), error = %e, "failed to stop reconciler");
            }
        }
    }
}
