//! Cluster controller-manager component

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::Result;

/// Supervises the `kube-controller-manager` process
pub struct ControllerManager {
    config: ClusterConfig,
    paths: NodePaths,
    supervisor: Option<Supervisor>,
}

impl ControllerManager {
    /// Create the component
    pub fn new(config: ClusterConfig, paths: NodePaths) -> Self {
        Self {
            config,
            paths,
            supervisor: None,
        }
    }
}

#[async_trait]
impl Component for ControllerManager {
    fn name(&self) -> &str {
        "kube-controller-manager"
    }

    async fn init(&mut self) -> Result<()> {
        let pki = self.paths.cert_dir();
        let args = vec![
            format!("--kubeconfig={}", pki.join("ccm.conf").display()),
            format!("--authentication-kubeconfig={}", pki.join("ccm.conf").display()),
            format!(
                "--service-account-private-key-file={}",
                pki.join("sa.key").display()
            ),
            format!("--root-ca-file={}", pki.join("ca.crt").display()),
            format!("--cluster-signing-cert-file={}", pki.join("ca.crt").display()),
            format!("--cluster-signing-key-file={}", pki.join("ca.key").display()),
            format!("--cluster-cidr={}", self.config.network.pod_cidr),
            "--allocate-node-cidrs=true".to_string(),
            "--bind-address=127.0.0.1".to_string(),
            "--controllers=*,bootstrapsigner,tokencleaner".to_string(),
            "--leader-elect=false".to_string(),
        ];
        self.supervisor = Some(Supervisor::new(
            "kube-controller-manager",
            self.paths.bin_dir().join("kube-controller-manager"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("kube-controller-manager", "not initialized"))?;
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
