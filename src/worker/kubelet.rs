//! Node agent (kubelet) component
//!
//! Writes the local kubelet configuration for the selected worker profile
//! and supervises the kubelet against the bootstrap credentials produced by
//! worker enablement.

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::Result;

use super::containerd::ContainerRuntime;

/// Supervises the `kubelet` process
pub struct NodeAgent {
    config: ClusterConfig,
    paths: NodePaths,
    profile: String,
    supervisor: Option<Supervisor>,
}

impl NodeAgent {
    /// Create the component for the named worker profile
    ///
    /// The profile is passed through unmodified; it selects the kubelet
    /// configuration profile and is stamped onto the node as a label.
    pub fn new(config: ClusterConfig, paths: NodePaths, profile: impl Into<String>) -> Self {
        Self {
            config,
            paths,
            profile: profile.into(),
            supervisor: None,
        }
    }

    fn kubelet_config_path(&self) -> std::path::PathBuf {
        self.paths.data_dir().join("kubelet-config.yaml")
    }
}

#[async_trait]
impl Component for NodeAgent {
    fn name(&self) -> &str {
        "kubelet"
    }

    async fn init(&mut self) -> Result<()> {
        let dns_address = self.config.network.dns_address()?;
        let kubelet_config = serde_json::json!({
            "apiVersion": "kubelet.config.k8s.io/v1beta1",
            "kind": "KubeletConfiguration",
            "clusterDNS": [dns_address],
            "clusterDomain": "cluster.local",
            "cgroupsPerQOS": true,
            "rotateCertificates": true,
        });
        let rendered = serde_yaml::to_string(&kubelet_config)
            .map_err(|e| Error::component("kubelet", format!("failed to render config: {e}")))?;
        tokio::fs::write(self.kubelet_config_path(), rendered).await?;

        let args = vec![
            format!(
                "--bootstrap-kubeconfig={}",
                self.paths.kubelet_auth_config().display()
            ),
            format!(
                "--kubeconfig={}",
                self.paths.data_dir().join("kubelet-client.conf").display()
            ),
            format!("--config={}", self.kubelet_config_path().display()),
            format!(
                "--container-runtime-endpoint={}",
                ContainerRuntime::socket(&self.paths)
            ),
            format!("--node-labels=kore.dev/profile={}", self.profile),
        ];
        self.supervisor = Some(Supervisor::new(
            "kubelet",
            self.paths.bin_dir().join("kubelet"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("kubelet", "not initialized"))?;
        supervisor.spawn();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_writes_profile_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();

        let mut agent = NodeAgent::new(ClusterConfig::default(), paths.clone(), "gpu");
        agent.init().await.unwrap();

        let rendered =
            std::fs::read_to_string(paths.data_dir().join("kubelet-config.yaml")).unwrap();
        assert!(rendered.contains("10.96.0.10"));
        assert!(rendered.contains("clusterDomain: cluster.local"));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_fails_on_bad_service_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();

        let mut config = ClusterConfig::default();
        config.network.service_cidr = "bogus".to_string();

        let mut agent = NodeAgent::new(config, paths, "default");
        assert!(agent.init().await.is_err());
    }
}
