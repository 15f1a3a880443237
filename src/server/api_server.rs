//! Kubernetes API server component
//!
//! Assembles the process arguments from the cluster config, the issued
//! certificates, and the selected storage backend's client endpoint, then
//! supervises the bundled `kube-apiserver` binary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::pki::CertificateManager;
use crate::supervisor::Supervisor;
use crate::Result;

/// Supervises the API server process
pub struct ApiServer {
    config: ClusterConfig,
    paths: NodePaths,
    certs: Arc<CertificateManager>,
    storage_endpoint: String,
    supervisor: Option<Supervisor>,
}

impl ApiServer {
    /// Create the component
    ///
    /// `storage_endpoint` is the client endpoint of whichever storage
    /// backend was selected; the API server does not care which kind it is.
    pub fn new(
        config: ClusterConfig,
        paths: NodePaths,
        certs: Arc<CertificateManager>,
        storage_endpoint: String,
    ) -> Self {
        Self {
            config,
            paths,
            certs,
            storage_endpoint,
            supervisor: None,
        }
    }
}

#[async_trait]
impl Component for ApiServer {
    fn name(&self) -> &str {
        "kube-apiserver"
    }

    async fn init(&mut self) -> Result<()> {
        let pki = self.paths.cert_dir();
        let args = vec![
            format!("--advertise-address={}", self.config.api.address),
            format!("--secure-port={}", self.config.api.port),
            format!("--service-cluster-ip-range={}", self.config.network.service_cidr),
            format!("--etcd-servers={}", self.storage_endpoint),
            format!("--tls-cert-file={}", pki.join("apiserver.crt").display()),
            format!("--tls-private-key-file={}", pki.join("apiserver.key").display()),
            format!("--client-ca-file={}", self.certs.ca_cert_path().display()),
            format!(
                "--kubelet-client-certificate={}",
                pki.join("apiserver-kubelet-client.crt").display()
            ),
            format!(
                "--kubelet-client-key={}",
                pki.join("apiserver-kubelet-client.key").display()
            ),
            format!("--service-account-key-file={}", pki.join("sa.key").display()),
            format!(
                "--service-account-signing-key-file={}",
                pki.join("sa.key").display()
            ),
            "--service-account-issuer=https://kubernetes.default.svc".to_string(),
            "--enable-bootstrap-token-auth=true".to_string(),
            "--authorization-mode=Node,RBAC".to_string(),
            "--allow-privileged=true".to_string(),
        ];
        self.supervisor = Some(Supervisor::new(
            "kube-apiserver",
            self.paths.bin_dir().join("kube-apiserver"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("kube-apiserver", "not initialized"))?;
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
