//! Worker enablement
//!
//! Promotes a controller node to also run workload-execution processes. The
//! control plane's `init`/`start` returning does not mean the API is usable
//! yet: the admin kubeconfig appears on disk only once the certificate and
//! API server components have actually come up. Worker enablement therefore
//! polls for that file with a bounded retry before it tries to mint
//! bootstrap credentials against the live API.

mod bootstrap;
mod containerd;
mod kubelet;

pub use bootstrap::{bootstrap_kubeconfig, create_kubelet_bootstrap_config};
pub use containerd::ContainerRuntime;
pub use kubelet::NodeAgent;

use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::component::{Component, Manager};
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;

/// Retry and timeout policy for worker enablement
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Worker profile passed through to the node agent
    pub profile: String,
    /// Retry policy for the admin-kubeconfig readiness wait
    pub admin_wait: RetryConfig,
    /// Retry policy for bootstrap credential creation
    pub bootstrap_retry: RetryConfig,
    /// Time box for each bootstrap credential attempt
    pub bootstrap_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            admin_wait: RetryConfig::with_max_attempts(20),
            bootstrap_retry: RetryConfig::with_max_attempts(5),
            bootstrap_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerOptions {
    /// Options for the named worker profile
    pub fn with_profile(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Default::default()
        }
    }
}

/// Enable worker processes on this controller node
///
/// If worker credentials already exist, the bootstrap steps are skipped
/// entirely. Otherwise the admin kubeconfig is awaited (bounded retry), a
/// kubelet bootstrap kubeconfig is minted against the live API (bounded
/// retry, each attempt time-boxed) and persisted. Then the container
/// runtime and node agent are initialized and run directly, and finally
/// appended to the manager so they participate in the ordinary shutdown
/// path. Any failure here is fatal to worker enablement; the caller
/// routes it into full shutdown.
pub async fn enable_worker(
    config: &ClusterConfig,
    paths: &NodePaths,
    manager: &mut Manager,
    opts: &WorkerOptions,
) -> Result<()> {
    if !paths.kubelet_auth_config().exists() {
        wait_for_admin_kubeconfig(paths, &opts.admin_wait).await?;

        let bootstrap_config = retry_with_backoff(&opts.bootstrap_retry, "kubelet-bootstrap", || {
            mint_bootstrap_config(config, paths, opts.bootstrap_timeout)
        })
        .await?;

        crate::pki::write_private(&paths.kubelet_auth_config(), &bootstrap_config)
            .await
            .map_err(|e| Error::worker(format!("failed to persist bootstrap credentials: {e}")))?;
        info!(path = %paths.kubelet_auth_config().display(), "worker bootstrap credentials written");
    } else {
        info!("worker credentials already present, skipping bootstrap");
    }

    kernel_setup().await;

    let mut containerd = ContainerRuntime::new(paths.clone());
    let mut kubelet = NodeAgent::new(config.clone(), paths.clone(), opts.profile.clone());

    containerd.init().await?;
    kubelet.init().await?;
    containerd.run().await?;
    kubelet.run().await?;

    // The one documented post-hoc append: these components bypassed the
    // manager's own init/run and only join the stop path.
    manager.add(Box::new(containerd));
    manager.add(Box::new(kubelet));

    Ok(())
}

/// Wait for the admin kubeconfig to appear on disk
///
/// This is the synchronization point between "control plane start returned"
/// and "control plane is actually usable locally".
async fn wait_for_admin_kubeconfig(paths: &NodePaths, retry: &RetryConfig) -> Result<()> {
    let path = paths.admin_kubeconfig();
    retry_with_backoff(retry, "admin-kubeconfig-wait", || async {
        if path.exists() {
            Ok(())
        } else {
            Err(Error::worker(format!("file does not exist: {}", path.display())))
        }
    })
    .await
}

async fn mint_bootstrap_config(
    config: &ClusterConfig,
    paths: &NodePaths,
    time_box: Duration,
) -> Result<String> {
    match tokio::time::timeout(time_box, create_kubelet_bootstrap_config(config, paths, "worker"))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::worker(format!(
            "bootstrap credential creation timed out after {time_box:?}"
        ))),
    }
}

/// Local kernel preparation for running workloads
///
/// Best-effort: a container-optimized host may have everything baked in and
/// an unprivileged dev run has no business failing startup over sysctls.
pub async fn kernel_setup() {
    match Command::new("modprobe").arg("br_netfilter").status().await {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "modprobe br_netfilter failed"),
        Err(e) => warn!(error = %e, "failed to run modprobe"),
    }

    for (path, value) in [
        ("/proc/sys/net/ipv4/ip_forward", "1"),
        ("/proc/sys/net/bridge/bridge-nf-call-iptables", "1"),
    ] {
        if let Err(e) = tokio::fs::write(path, value).await {
            warn!(path, error = %e, "failed to set sysctl");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_opts() -> WorkerOptions {
        let fast = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        };
        WorkerOptions {
            profile: "default".to_string(),
            admin_wait: fast.clone(),
            bootstrap_retry: fast,
            bootstrap_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_existing_credentials_skip_bootstrap_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();
        // Pre-existing worker credentials; no admin kubeconfig anywhere, so
        // any attempt to bootstrap would fail loudly.
        std::fs::write(paths.kubelet_auth_config(), "creds").unwrap();

        let mut manager = Manager::new();
        enable_worker(&ClusterConfig::default(), &paths, &mut manager, &fast_opts())
            .await
            .unwrap();

        assert_eq!(manager.len(), 2, "runtime and agent registered for shutdown");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_admin_kubeconfig_retry_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();

        let mut manager = Manager::new();
        let err = enable_worker(&ClusterConfig::default(), &paths, &mut manager, &fast_opts())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("does not exist"));
        assert!(manager.is_empty(), "runtime and agent must not be started");
        assert!(!paths.kubelet_auth_config().exists());
    }
}
