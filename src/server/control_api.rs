//! Local control API component
//!
//! Serves the join flow to prospective cluster members: a joining node's
//! join client calls `GET /v1beta1/ca` for the CA bundle and, when running
//! the external consensus store, `POST /v1beta1/etcd` for its
//! initial-cluster membership. Both endpoints are guarded by bearer join
//! tokens.
//!
//! # Security Model
//!
//! - The server presents a certificate signed by the cluster CA; the join
//!   token a node was handed embeds that CA, pinning the TLS identity.
//! - Only token *hashes* are stored server-side.
//! - Tokens are one-time at join granularity: the first use opens a short
//!   window in which the same token may finish the remaining join steps
//!   (CA fetch, then etcd membership); afterwards it is dead.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::component::Component;
use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::join::{CaResponse, EtcdJoinRequest, EtcdJoinResponse};
use crate::pki::{CertRequest, CertificateManager};
use crate::Result;

/// How long after first use a token may finish the remaining join steps
const JOIN_WINDOW: Duration = Duration::from_secs(600);

/// A bearer join token value
#[derive(Clone)]
pub struct BootstrapToken {
    raw: Vec<u8>,
    string: String,
}

impl BootstrapToken {
    /// Generate a new random token
    pub fn generate() -> Self {
        let mut raw = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let string = URL_SAFE_NO_PAD.encode(&raw);
        Self { raw, string }
    }

    /// Reconstruct a token from its string form (for validation)
    pub fn from_string(s: &str) -> Self {
        let raw = URL_SAFE_NO_PAD.decode(s).unwrap_or_default();
        Self {
            raw,
            string: s.to_string(),
        }
    }

    /// The token as presented in the Authorization header
    pub fn as_str(&self) -> &str {
        &self.string
    }

    /// SHA-256 hash of the token, the only form ever stored
    pub fn hash(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(&self.raw))
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the token value in logs
        f.debug_struct("BootstrapToken").field("hash", &self.hash()).finish()
    }
}

#[derive(Debug)]
struct TokenState {
    first_used: Option<Instant>,
}

/// Thread-safe store of provisioned join-token hashes
#[derive(Default)]
pub struct TokenStore {
    tokens: DashMap<String, TokenState>,
}

impl TokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provisioned token hash
    pub fn add_hash(&self, hash: impl Into<String>) {
        self.tokens.insert(hash.into(), TokenState { first_used: None });
    }

    /// Provision a freshly generated token
    pub fn provision(&self, token: &BootstrapToken) {
        self.add_hash(token.hash());
    }

    /// Authorize a presented token
    ///
    /// The first successful use starts the join window; inside the window
    /// the same token keeps authorizing (a join is more than one request),
    /// outside it the token is dead for good.
    pub fn authorize(&self, presented: &str) -> bool {
        let hash = BootstrapToken::from_string(presented).hash();
        match self.tokens.get_mut(&hash) {
            Some(mut state) => match state.first_used {
                None => {
                    state.first_used = Some(Instant::now());
                    true
                }
                Some(first) => first.elapsed() <= JOIN_WINDOW,
            },
            None => false,
        }
    }

    /// Number of provisioned tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is provisioned
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

struct ApiState {
    certs: Arc<CertificateManager>,
    tokens: Arc<TokenStore>,
    node_name: String,
    etcd_peer_address: String,
}

/// Serves the local control API over TLS
pub struct ControlApi {
    config: ClusterConfig,
    paths: NodePaths,
    certs: Arc<CertificateManager>,
    tokens: Arc<TokenStore>,
    listen_addr: SocketAddr,
    handle: Option<axum_server::Handle>,
    task: Option<JoinHandle<()>>,
}

impl ControlApi {
    /// Create the component listening on the default control API port
    pub fn new(config: ClusterConfig, paths: NodePaths, certs: Arc<CertificateManager>) -> Self {
        Self {
            config,
            paths,
            certs,
            tokens: Arc::new(TokenStore::new()),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], crate::CONTROL_API_PORT)),
            handle: None,
            task: None,
        }
    }

    /// Override the listen address (tests)
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Address the server is actually bound to, once running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &self.handle {
            Some(handle) => handle.listening().await,
            None => None,
        }
    }

    /// Token store backing the bearer auth
    pub fn tokens(&self) -> Arc<TokenStore> {
        self.tokens.clone()
    }

    fn router(state: Arc<ApiState>) -> Router {
        Router::new()
            .route("/v1beta1/ca", get(get_ca))
            .route("/v1beta1/etcd", post(etcd_join))
            .with_state(state)
    }
}

#[async_trait]
impl Component for ControlApi {
    fn name(&self) -> &str {
        "control-api"
    }

    async fn init(&mut self) -> Result<()> {
        // Provisioned token hashes, one per line; token creation itself is
        // a separate concern
        let tokens_file = self.paths.join_tokens_file();
        if tokens_file.exists() {
            let raw = tokio::fs::read_to_string(&tokens_file).await?;
            for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
                self.tokens.add_hash(line);
            }
            info!(count = self.tokens.len(), "loaded provisioned join tokens");
        }

        self.certs
            .ensure_issued(&CertRequest::new("control-api", "kore-control-api").with_sans(vec![
                self.config.api.address.clone(),
                "127.0.0.1".to_string(),
                "localhost".to_string(),
            ]))
            .await?;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let cert = self
            .certs
            .ensure_issued(&CertRequest::new("control-api", "kore-control-api"))
            .await?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem(
            cert.cert_pem.into_bytes(),
            cert.key_pem.into_bytes(),
        )
        .await
        .map_err(|e| Error::component("control-api", format!("invalid TLS material: {e}")))?;

        let state = Arc::new(ApiState {
            certs: self.certs.clone(),
            tokens: self.tokens.clone(),
            node_name: super::node_name(),
            etcd_peer_address: self.config.storage.etcd.peer_address.clone(),
        });

        let handle = axum_server::Handle::new();
        let server = axum_server::bind_rustls(self.listen_addr, tls)
            .handle(handle.clone())
            .serve(Self::router(state).into_make_service());

        let addr = self.listen_addr;
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = server.await {
                error!(error = %e, %addr, "control API server failed");
            }
        }));
        self.handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.graceful_shutdown(Some(Duration::from_secs(5)));
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::component("control-api", format!("server task failed: {e}")))?;
        }
        Ok(())
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    bearer(headers).is_some_and(|token| state.tokens.authorize(token))
}

async fn get_ca(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.certs.ca().await {
        Ok(ca) => Json(CaResponse {
            ca_cert: ca.cert_pem,
            ca_key: ca.key_pem,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "CA not available for join request");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn etcd_join(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<EtcdJoinRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    info!(node = %request.node, peer = %request.peer_address, "etcd member joining");
    Json(EtcdJoinResponse {
        initial_cluster: vec![
            format!("{}=https://{}:2380", state.node_name, state.etcd_peer_address),
            format!("{}=https://{}:2380", request.node, request.peer_address),
        ],
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{JoinClient, JoinToken};

    #[test]
    fn test_tokens_are_unique_and_url_safe() {
        let a = BootstrapToken::generate();
        let b = BootstrapToken::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert!(a.as_str().chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_debug_output_protects_token_secrecy() {
        let token = BootstrapToken::generate();
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.as_str()));
        assert!(debug.contains("hash"));
    }

    #[test]
    fn test_forged_tokens_are_rejected() {
        let store = TokenStore::new();
        store.provision(&BootstrapToken::generate());
        assert!(!store.authorize("forged-token-attempt"));
    }

    #[test]
    fn test_token_keeps_authorizing_within_join_window() {
        let store = TokenStore::new();
        let token = BootstrapToken::generate();
        store.provision(&token);

        // A join is more than one request: CA fetch, then etcd membership.
        assert!(store.authorize(token.as_str()));
        assert!(store.authorize(token.as_str()));
    }

    #[test]
    fn test_unprovisioned_store_rejects_everything() {
        let store = TokenStore::new();
        assert!(store.is_empty());
        assert!(!store.authorize(BootstrapToken::generate().as_str()));
    }

    #[tokio::test]
    async fn test_join_flow_end_to_end() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();
        let certs = CertificateManager::new(paths.cert_dir());
        certs.ensure_ca().await.unwrap();

        // Provision one join token the way the token CLI would
        let token = BootstrapToken::generate();
        std::fs::write(paths.join_tokens_file(), format!("{}\n", token.hash())).unwrap();

        let mut api = ControlApi::new(ClusterConfig::default(), paths.clone(), certs.clone())
            .with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
        api.init().await.unwrap();
        api.run().await.unwrap();
        let addr = api.local_addr().await.expect("server must be listening");

        // The joining side: a join token embedding the cluster CA
        let join_token = JoinToken {
            endpoint: format!("https://127.0.0.1:{}", addr.port()),
            token: token.as_str().to_string(),
            ca_cert: certs.ca().await.unwrap().cert_pem,
        };
        let client = JoinClient::new(join_token.clone()).unwrap();

        let ca = client.get_ca().await.unwrap();
        assert_eq!(ca.cert_pem, certs.ca().await.unwrap().cert_pem);

        // Same token finishes the join: etcd membership
        let response = client
            .get_etcd_join_info(&EtcdJoinRequest {
                node: "node-b".to_string(),
                peer_address: "10.0.0.2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.initial_cluster.len(), 2);
        assert!(response.initial_cluster[1].contains("node-b=https://10.0.0.2:2380"));

        // A forged token is rejected
        let forged = JoinToken {
            token: BootstrapToken::generate().as_str().to_string(),
            ..join_token
        };
        let client = JoinClient::new(forged).unwrap();
        assert!(client.get_ca().await.is_err());

        api.stop().await.unwrap();
    }
}
