//! Kubelet bootstrap credential creation
//!
//! Creates a short-lived bootstrap token in the live cluster and renders the
//! bootstrap kubeconfig the kubelet uses for its first connection, after
//! which it requests its own client certificate through the CSR flow.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use rand::Rng;

use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::Result;

const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Random lowercase-alphanumeric token fragment
fn random_token_part(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Create a bootstrap token in the live cluster and render the kubeconfig
///
/// The token expires after ten minutes; it only has to outlive the kubelet's
/// first CSR. The given role becomes the token's bootstrappers group.
pub async fn create_kubelet_bootstrap_config(
    config: &ClusterConfig,
    paths: &NodePaths,
    role: &str,
) -> Result<String> {
    let client = crate::server::applier::load_client(&paths.admin_kubeconfig()).await?;

    let token_id = random_token_part(TOKEN_ID_LEN);
    let token_secret = random_token_part(TOKEN_SECRET_LEN);
    let expiration = (Utc::now() + ChronoDuration::minutes(10))
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut data = BTreeMap::new();
    data.insert("token-id".to_string(), token_id.clone());
    data.insert("token-secret".to_string(), token_secret.clone());
    data.insert("expiration".to_string(), expiration);
    data.insert("usage-bootstrap-authentication".to_string(), "true".to_string());
    data.insert("usage-bootstrap-signing".to_string(), "true".to_string());
    data.insert(
        "auth-extra-groups".to_string(),
        format!("system:bootstrappers:{role}"),
    );

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(format!("bootstrap-token-{token_id}")),
            namespace: Some("kube-system".to_string()),
            ..Default::default()
        },
        type_: Some("bootstrap.kubernetes.io/token".to_string()),
        string_data: Some(data),
        ..Default::default()
    };

    let secrets: Api<Secret> = Api::namespaced(client, "kube-system");
    secrets.create(&PostParams::default(), &secret).await?;

    let ca_pem = tokio::fs::read_to_string(paths.cert_dir().join("ca.crt"))
        .await
        .map_err(|e| Error::worker(format!("cluster CA not readable: {e}")))?;

    Ok(bootstrap_kubeconfig(
        &config.api.local_url(),
        &ca_pem,
        &format!("{token_id}.{token_secret}"),
    ))
}

/// Render a token-authenticated bootstrap kubeconfig
pub fn bootstrap_kubeconfig(server_url: &str, ca_pem: &str, token: &str) -> String {
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "kore",
            "cluster": {
                "server": server_url,
                "certificate-authority-data": STANDARD.encode(ca_pem),
            },
        }],
        "users": [{
            "name": "kubelet-bootstrap",
            "user": { "token": token },
        }],
        "contexts": [{
            "name": "kore",
            "context": { "cluster": "kore", "user": "kubelet-bootstrap" },
        }],
        "current-context": "kore",
    });
    // Serializing a json! mapping cannot fail
    serde_yaml::to_string(&doc).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_parts_use_bootstrap_charset() {
        let id = random_token_part(TOKEN_ID_LEN);
        let secret = random_token_part(TOKEN_SECRET_LEN);

        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        for c in id.chars().chain(secret.chars()) {
            assert!(c.is_ascii_lowercase() || c.is_ascii_digit());
        }
        assert_ne!(random_token_part(16), random_token_part(16));
    }

    #[test]
    fn test_bootstrap_kubeconfig_embeds_token_and_server() {
        let rendered = bootstrap_kubeconfig("https://10.0.0.1:6443", "CA", "abcdef.0123456789abcdef");
        assert!(rendered.contains("server: https://10.0.0.1:6443"));
        assert!(rendered.contains("token: abcdef.0123456789abcdef"));
        assert!(rendered.contains(&STANDARD.encode("CA")));
    }
}
