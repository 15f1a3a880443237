//! Reverse-tunnel gateway component
//!
//! Worker nodes dial out to this gateway so the control plane can reach
//! kubelets behind NAT without inbound connectivity to the workers.

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::Result;

/// Supervises the `tunnel-server` process
pub struct TunnelServer {
    config: ClusterConfig,
    paths: NodePaths,
    supervisor: Option<Supervisor>,
}

impl TunnelServer {
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
impl Component for TunnelServer {
    fn name(&self) -> &str {
        "tunnel-server"
    }

    async fn init(&mut self) -> Result<()> {
        let pki = self.paths.cert_dir();
        let args = vec![
            format!("--bind-address={}", self.config.api.address),
            "--agent-port=8132".to_string(),
            "--admin-port=8133".to_string(),
            format!("--server-cert={}", pki.join("apiserver.crt").display()),
            format!("--server-key={}", pki.join("apiserver.key").display()),
            format!("--agent-ca-cert={}", pki.join("ca.crt").display()),
            "--mode=grpc".to_string(),
        ];
        self.supervisor = Some(Supervisor::new(
            "tunnel-server",
            self.paths.bin_dir().join("tunnel-server"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("tunnel-server", "not initialized"))?;
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
