//! CA synchronization sync component (join mode only)
//!
//! Registered ahead of the certificate issuer so the CA fetched from the
//! peer is on disk before any local certificate is derived from it. The
//! peer's control API may not be reachable on the first attempt (the token
//! may have been minted moments ago), so the fetch is retried with bounded
//! backoff; exhausting the attempts is a fatal init error.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::component::Component;
use crate::join::JoinClient;
use crate::pki::CertificateManager;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;

/// Fetches the cluster CA bundle from an existing controller
pub struct CaSyncer {
    join_client: Arc<JoinClient>,
    certs: Arc<CertificateManager>,
    retry: RetryConfig,
}

impl CaSyncer {
    /// Create the syncer around an already-constructed join client
    pub fn new(join_client: Arc<JoinClient>, certs: Arc<CertificateManager>) -> Self {
        Self {
            join_client,
            certs,
            retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy (tests)
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Component for CaSyncer {
    fn name(&self) -> &str {
        "ca-syncer"
    }

    async fn init(&mut self) -> Result<()> {
        if self.certs.ca_exists() {
            debug!("CA material already present, skipping sync");
            return Ok(());
        }

        info!(peer = self.join_client.endpoint(), "syncing CA from peer");
        let bundle = retry_with_backoff(&self.retry, "ca-sync", || self.join_client.get_ca()).await?;
        self.certs.adopt_ca(bundle).await?;
        info!("CA synced from peer");
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
