//! Join token codec and the client for a peer's control API
//!
//! A join token is a one-time bootstrap credential handed to a node that
//! should join an existing cluster. Its wire form is URL-safe base64 over a
//! small JSON document carrying the peer's control API endpoint, a bearer
//! token, and the CA certificate used to pin TLS verification of that peer.
//!
//! The token is consumed once at startup to retrieve CA and peer endpoint
//! material, then discarded; it is never persisted by this controller.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pki::CaBundle;
use crate::Result;

/// Decoded join token contents
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinToken {
    /// Peer control API endpoint, e.g. `https://10.0.0.1:9443`
    pub endpoint: String,
    /// Bearer token authenticating against the peer (one-time use)
    pub token: String,
    /// PEM CA certificate pinning the peer's TLS identity
    pub ca_cert: String,
}

impl JoinToken {
    /// Decode a token from its wire form
    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|e| Error::join(format!("token is not valid base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::join(format!("token payload is malformed: {e}")))
    }

    /// Encode the token into its wire form
    pub fn encode(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| Error::join(format!("failed to encode token: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// CA bundle response served by `GET /v1beta1/ca`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaResponse {
    /// PEM CA certificate
    pub ca_cert: String,
    /// PEM CA private key
    pub ca_key: String,
}

/// Request body for `POST /v1beta1/etcd`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdJoinRequest {
    /// Name of the joining member
    pub node: String,
    /// Peer address the joining member will advertise
    pub peer_address: String,
}

/// Response body for `POST /v1beta1/etcd`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdJoinResponse {
    /// `name=peer-url` entries forming the member's initial cluster
    pub initial_cluster: Vec<String>,
}

/// HTTP client for an existing controller's control API
///
/// Construction validates the token shape and pins the embedded CA; it never
/// touches the network, so a malformed token is a fatal startup error while
/// peer unreachability surfaces from the first fetch.
#[derive(Debug)]
pub struct JoinClient {
    endpoint: String,
    bearer: String,
    http: reqwest::Client,
}

impl JoinClient {
    /// Build a client from a join token's wire form
    pub fn from_token(raw: &str) -> Result<Arc<Self>> {
        let token = JoinToken::decode(raw)?;
        Self::new(token)
    }

    /// Build a client from an already-decoded token
    pub fn new(token: JoinToken) -> Result<Arc<Self>> {
        let ca = reqwest::Certificate::from_pem(token.ca_cert.as_bytes())
            .map_err(|e| Error::join(format!("token CA certificate is invalid: {e}")))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .tls_built_in_root_certs(false)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::join(format!("failed to build join client: {e}")))?;

        Ok(Arc::new(Self {
            endpoint: token.endpoint.trim_end_matches('/').to_string(),
            bearer: token.token,
            http,
        }))
    }

    /// Peer control API endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the cluster CA bundle from the peer
    pub async fn get_ca(&self) -> Result<CaBundle> {
        let response = self
            .http
            .get(format!("{}/v1beta1/ca", self.endpoint))
            .bearer_auth(&self.bearer)
            .send()
            .await
            .map_err(|e| Error::join(format!("failed to reach peer: {e}")))?;
        let response = check_status(response)?;
        let ca: CaResponse = response
            .json()
            .await
            .map_err(|e| Error::join(format!("invalid CA response: {e}")))?;
        Ok(CaBundle {
            cert_pem: ca.ca_cert,
            key_pem: ca.ca_key,
        })
    }

    /// Ask the peer for the initial-cluster membership of a joining
    /// consensus-store member
    pub async fn get_etcd_join_info(&self, request: &EtcdJoinRequest) -> Result<EtcdJoinResponse> {
        let response = self
            .http
            .post(format!("{}/v1beta1/etcd", self.endpoint))
            .bearer_auth(&self.bearer)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::join(format!("failed to reach peer: {e}")))?;
        let response = check_status(response)?;
        response
            .json()
            .await
            .map_err(|e| Error::join(format!("invalid etcd join response: {e}")))
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::join(format!("peer returned {status}")));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::generate_ca;

    fn sample_token() -> JoinToken {
        JoinToken {
            endpoint: "https://10.0.0.1:9443".to_string(),
            token: "secret-bearer".to_string(),
            ca_cert: generate_ca("test-ca").unwrap().cert_pem,
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let token = sample_token();
        let raw = token.encode().unwrap();
        let decoded = JoinToken::decode(&raw).unwrap();
        assert_eq!(decoded.endpoint, token.endpoint);
        assert_eq!(decoded.token, token.token);
        assert_eq!(decoded.ca_cert, token.ca_cert);
    }

    #[test]
    fn test_wire_form_is_url_safe() {
        let raw = sample_token().encode().unwrap();
        assert!(raw
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JoinToken::decode("!!!not base64!!!").is_err());

        // Valid base64, invalid payload
        let raw = URL_SAFE_NO_PAD.encode(b"{\"nope\": true}");
        assert!(JoinToken::decode(&raw).is_err());
    }

    #[test]
    fn test_from_token_is_a_fatal_construction_error_on_malformed_input() {
        let err = JoinClient::from_token("definitely-not-a-token").unwrap_err();
        assert!(err.to_string().contains("join error"));
    }

    #[test]
    fn test_from_token_rejects_invalid_pinned_ca() {
        let token = JoinToken {
            ca_cert: "garbage".to_string(),
            ..sample_token()
        };
        let raw = token.encode().unwrap();
        assert!(JoinClient::from_token(&raw).is_err());
    }

    #[test]
    fn test_from_token_builds_pinned_client() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let raw = sample_token().encode().unwrap();
        let client = JoinClient::from_token(&raw).unwrap();
        assert_eq!(client.endpoint(), "https://10.0.0.1:9443");
    }
}
