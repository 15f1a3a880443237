//! Certificate issuance sync component
//!
//! Runs in the sync group: every later component (storage, API server)
//! assumes its key material exists by the time its own `init` begins. In
//! founder mode this component also creates the cluster CA; in join mode
//! the CA syncer has already placed the fetched CA on disk and issuance
//! derives from it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::pki::{CertRequest, CertificateManager};
use crate::Result;

/// Issues the node's certificates and renders the control-plane kubeconfigs
pub struct Certificates {
    config: ClusterConfig,
    paths: NodePaths,
    certs: Arc<CertificateManager>,
}

impl Certificates {
    /// Create the component; issuance happens in `init`
    pub fn new(config: ClusterConfig, paths: NodePaths, certs: Arc<CertificateManager>) -> Self {
        Self {
            config,
            paths,
            certs,
        }
    }

    fn api_server_sans(&self) -> Result<Vec<String>> {
        let mut sans = vec![
            self.config.api.address.clone(),
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            self.config.network.internal_api_address()?,
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            "kubernetes.default.svc.cluster.local".to_string(),
        ];
        sans.extend(self.config.api.sans.iter().cloned());
        Ok(sans)
    }
}

#[async_trait]
impl Component for Certificates {
    fn name(&self) -> &str {
        "certificates"
    }

    async fn init(&mut self) -> Result<()> {
        self.certs.ensure_ca().await?;

        self.certs
            .ensure_issued(
                &CertRequest::new("apiserver", "kube-apiserver").with_sans(self.api_server_sans()?),
            )
            .await?;
        self.certs
            .ensure_issued(
                &CertRequest::new("apiserver-kubelet-client", "kube-apiserver-kubelet-client")
                    .with_org("system:masters"),
            )
            .await?;
        // Service-account token signing keypair; only the key halves matter
        self.certs
            .ensure_issued(&CertRequest::new("sa", "service-accounts"))
            .await?;

        let server_url = self.config.api.local_url();

        let admin = self
            .certs
            .ensure_issued(&CertRequest::new("admin", "admin").with_org("system:masters"))
            .await?;
        self.certs
            .write_kubeconfig(&self.paths.admin_kubeconfig(), &server_url, "admin", &admin)
            .await?;

        let scheduler = self
            .certs
            .ensure_issued(&CertRequest::new("scheduler", "system:kube-scheduler"))
            .await?;
        self.certs
            .write_kubeconfig(
                &self.paths.cert_dir().join("scheduler.conf"),
                &server_url,
                "system:kube-scheduler",
                &scheduler,
            )
            .await?;

        let ccm = self
            .certs
            .ensure_issued(&CertRequest::new("ccm", "system:kube-controller-manager"))
            .await?;
        self.certs
            .write_kubeconfig(
                &self.paths.cert_dir().join("ccm.conf"),
                &server_url,
                "system:kube-controller-manager",
                &ccm,
            )
            .await?;

        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
