//! Storage backend selection and the two backend components
//!
//! A pure mapping from the configured storage kind to a concrete component:
//! the embedded KV proxy (kine) needs only its own settings, while the
//! external consensus store (etcd) additionally needs to know whether this
//! node is joining, the certificate manager for peer certs, and (when
//! joining) the join client, because a joining member fetches its peer
//! connection material through the same channel as the CA.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::join::{EtcdJoinRequest, JoinClient};
use crate::pki::{CertRequest, CertificateManager};
use crate::supervisor::Supervisor;
use crate::Result;

/// Configuration value selecting the embedded KV proxy
pub const KINE_STORAGE_TYPE: &str = "kine";
/// Configuration value selecting the external consensus store
pub const ETCD_STORAGE_TYPE: &str = "etcd";

/// Map the configured storage kind to a concrete backend component
///
/// The empty string is the documented default (kine); any other
/// unrecognized kind is a fatal configuration error, raised before the
/// backend or anything after it is registered.
pub fn storage_backend(
    config: &ClusterConfig,
    paths: &NodePaths,
    join: bool,
    certs: Arc<CertificateManager>,
    join_client: Option<Arc<JoinClient>>,
) -> Result<Box<dyn Component>> {
    match config.storage.kind.as_str() {
        KINE_STORAGE_TYPE | "" => Ok(Box::new(Kine::new(config, paths))),
        ETCD_STORAGE_TYPE => Ok(Box::new(Etcd::new(config, paths, join, certs, join_client))),
        other => Err(Error::UnsupportedStorage(other.to_string())),
    }
}

/// Client endpoint the API server uses to reach the selected backend
pub fn storage_endpoint(config: &ClusterConfig, paths: &NodePaths) -> String {
    match config.storage.kind.as_str() {
        ETCD_STORAGE_TYPE => "https://127.0.0.1:2379".to_string(),
        _ => format!("unix://{}", paths.run_dir().join("kine.sock").display()),
    }
}

/// Embedded KV proxy backed by sqlite (or any kine datasource)
pub struct Kine {
    data_source: String,
    paths: NodePaths,
    supervisor: Option<Supervisor>,
}

impl Kine {
    /// Create the component from the kine section of the config
    pub fn new(config: &ClusterConfig, paths: &NodePaths) -> Self {
        Self {
            data_source: config.storage.kine.data_source.clone(),
            paths: paths.clone(),
            supervisor: None,
        }
    }
}

#[async_trait]
impl Component for Kine {
    fn name(&self) -> &str {
        "kine"
    }

    async fn init(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(self.paths.storage_dir()).await?;
        tokio::fs::create_dir_all(self.paths.run_dir()).await?;

        let data_source = if self.data_source.is_empty() {
            format!(
                "sqlite://{}?mode=rwc&_journal=WAL",
                self.paths.storage_dir().join("state.db").display()
            )
        } else {
            self.data_source.clone()
        };

        let args = vec![
            format!("--endpoint={data_source}"),
            format!(
                "--listen-address=unix://{}",
                self.paths.run_dir().join("kine.sock").display()
            ),
        ];
        self.supervisor = Some(Supervisor::new("kine", self.paths.bin_dir().join("kine"), args));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("kine", "not initialized"))?;
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

/// External consensus store member
pub struct Etcd {
    peer_address: String,
    paths: NodePaths,
    join: bool,
    certs: Arc<CertificateManager>,
    join_client: Option<Arc<JoinClient>>,
    supervisor: Option<Supervisor>,
}

impl Etcd {
    /// Create the component from the etcd section of the config
    pub fn new(
        config: &ClusterConfig,
        paths: &NodePaths,
        join: bool,
        certs: Arc<CertificateManager>,
        join_client: Option<Arc<JoinClient>>,
    ) -> Self {
        Self {
            peer_address: config.storage.etcd.peer_address.clone(),
            paths: paths.clone(),
            join,
            certs,
            join_client,
            supervisor: None,
        }
    }

    async fn initial_cluster(&self, name: &str, data_dir_empty: bool) -> Result<(String, String)> {
        if self.join && data_dir_empty {
            let client = self.join_client.as_ref().ok_or_else(|| {
                Error::component("etcd", "join mode requires a join client")
            })?;
            let response = client
                .get_etcd_join_info(&EtcdJoinRequest {
                    node: name.to_string(),
                    peer_address: self.peer_address.clone(),
                })
                .await?;
            Ok((response.initial_cluster.join(","), "existing".to_string()))
        } else {
            Ok((
                format!("{name}=https://{}:2380", self.peer_address),
                "new".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Component for Etcd {
    fn name(&self) -> &str {
        "etcd"
    }

    async fn init(&mut self) -> Result<()> {
        let data_dir = self.paths.storage_dir().join("etcd");
        let data_dir_empty = !data_dir.join("member").exists();
        tokio::fs::create_dir_all(&data_dir).await?;

        let server = self
            .certs
            .ensure_issued(&CertRequest::new("etcd-server", "etcd-server").with_sans(vec![
                "127.0.0.1".to_string(),
                "localhost".to_string(),
                self.peer_address.clone(),
            ]))
            .await?;
        let peer = self
            .certs
            .ensure_issued(
                &CertRequest::new("etcd-peer", "etcd-peer")
                    .with_sans(vec![self.peer_address.clone()]),
            )
            .await?;

        let name = super::node_name();
        let (initial_cluster, cluster_state) = self.initial_cluster(&name, data_dir_empty).await?;
        info!(%initial_cluster, %cluster_state, "configuring etcd member");

        let ca = self.certs.ca_cert_path();
        let args = vec![
            format!("--name={name}"),
            format!("--data-dir={}", data_dir.display()),
            "--listen-client-urls=https://127.0.0.1:2379".to_string(),
            "--advertise-client-urls=https://127.0.0.1:2379".to_string(),
            format!("--listen-peer-urls=https://{}:2380", self.peer_address),
            format!("--initial-advertise-peer-urls=https://{}:2380", self.peer_address),
            format!("--initial-cluster={initial_cluster}"),
            format!("--initial-cluster-state={cluster_state}"),
            format!("--cert-file={}", server.cert_path.display()),
            format!("--key-file={}", server.key_path.display()),
            format!("--trusted-ca-file={}", ca.display()),
            format!("--peer-cert-file={}", peer.cert_path.display()),
            format!("--peer-key-file={}", peer.key_path.display()),
            format!("--peer-trusted-ca-file={}", ca.display()),
            "--client-cert-auth=true".to_string(),
            "--peer-client-cert-auth=true".to_string(),
        ];
        self.supervisor = Some(Supervisor::new("etcd", self.paths.bin_dir().join("etcd"), args));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("etcd", "not initialized"))?;
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
