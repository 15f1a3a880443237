//! Certificate authority, leaf issuance, and kubeconfig rendering
//!
//! The certificate manager owns the cert directory. In founder mode it
//! generates a fresh self-signed CA; in join mode it adopts the CA bundle
//! fetched from a peer. Either way, every control-plane component derives
//! its leaf certificates from the same manager handle, shared by reference
//! and read-only after issuance.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tokio::sync::RwLock;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA material is not available yet
    #[error("CA not initialized")]
    CaNotInitialized,

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// PEM or key material could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// CA certificate and private key, both PEM-encoded
#[derive(Clone, Debug)]
pub struct CaBundle {
    /// PEM-encoded CA certificate
    pub cert_pem: String,
    /// PEM-encoded CA private key
    pub key_pem: String,
}

/// Request for one leaf certificate
#[derive(Clone, Debug)]
pub struct CertRequest {
    /// File base name under the cert dir (`<name>.crt` / `<name>.key`)
    pub name: String,
    /// Subject common name
    pub cn: String,
    /// Subject organization (Kubernetes group)
    pub org: Option<String>,
    /// Subject-alternative names; IP literals become IP SANs
    pub sans: Vec<String>,
}

impl CertRequest {
    /// Create a request with no organization and no SANs
    pub fn new(name: impl Into<String>, cn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cn: cn.into(),
            org: None,
            sans: Vec::new(),
        }
    }

    /// Set the subject organization
    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    /// Set the subject-alternative names
    pub fn with_sans(mut self, sans: Vec<String>) -> Self {
        self.sans = sans;
        self
    }
}

/// An issued (or reloaded) leaf certificate
#[derive(Clone, Debug)]
pub struct IssuedCert {
    /// Path of the PEM certificate file
    pub cert_path: PathBuf,
    /// Path of the PEM key file
    pub key_path: PathBuf,
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Shared handle owning CA material and leaf issuance for one node
pub struct CertificateManager {
    cert_dir: PathBuf,
    ca: RwLock<Option<CaBundle>>,
}

impl CertificateManager {
    /// Create a manager rooted at the given cert directory
    pub fn new(cert_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            cert_dir: cert_dir.into(),
            ca: RwLock::new(None),
        })
    }

    /// Path of the CA certificate file
    pub fn ca_cert_path(&self) -> PathBuf {
        self.cert_dir.join("ca.crt")
    }

    /// Path of the CA key file
    pub fn ca_key_path(&self) -> PathBuf {
        self.cert_dir.join("ca.key")
    }

    /// Whether CA material already exists on disk
    pub fn ca_exists(&self) -> bool {
        self.ca_cert_path().exists() && self.ca_key_path().exists()
    }

    /// Load an existing CA from disk, or generate and persist a new one
    pub async fn ensure_ca(&self) -> Result<()> {
        if self.ca_exists() {
            let bundle = CaBundle {
                cert_pem: tokio::fs::read_to_string(self.ca_cert_path()).await?,
                key_pem: tokio::fs::read_to_string(self.ca_key_path()).await?,
            };
            // Fail early on corrupt material instead of at first issuance
            KeyPair::from_pem(&bundle.key_pem)
                .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {e}")))?;
            *self.ca.write().await = Some(bundle);
            return Ok(());
        }

        let bundle = generate_ca("kore-ca")?;
        self.persist_ca(&bundle).await?;
        *self.ca.write().await = Some(bundle);
        Ok(())
    }

    /// Adopt a CA bundle fetched from a peer, persisting it if absent
    pub async fn adopt_ca(&self, bundle: CaBundle) -> Result<()> {
        KeyPair::from_pem(&bundle.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse synced CA key: {e}")))?;
        if !self.ca_exists() {
            self.persist_ca(&bundle).await?;
        }
        *self.ca.write().await = Some(bundle);
        Ok(())
    }

    /// Current CA bundle
    pub async fn ca(&self) -> Result<CaBundle> {
        self.ca.read().await.clone().ok_or(PkiError::CaNotInitialized)
    }

    async fn persist_ca(&self, bundle: &CaBundle) -> Result<()> {
        tokio::fs::write(self.ca_cert_path(), &bundle.cert_pem).await?;
        write_private(&self.ca_key_path(), &bundle.key_pem).await?;
        Ok(())
    }

    /// Issue (or reload) a leaf certificate signed by the CA
    ///
    /// Idempotent: existing cert/key files are reloaded unchanged, so
    /// restarts never rotate certificates behind running components.
    pub async fn ensure_issued(&self, request: &CertRequest) -> Result<IssuedCert> {
        let cert_path = self.cert_dir.join(format!("{}.crt", request.name));
        let key_path = self.cert_dir.join(format!("{}.key", request.name));

        if cert_path.exists() && key_path.exists() {
            return Ok(IssuedCert {
                cert_pem: tokio::fs::read_to_string(&cert_path).await?,
                key_pem: tokio::fs::read_to_string(&key_path).await?,
                cert_path,
                key_path,
            });
        }

        let ca = self.ca().await?;
        let (cert_pem, key_pem) = issue_leaf(&ca, request)?;
        tokio::fs::write(&cert_path, &cert_pem).await?;
        write_private(&key_path, &key_pem).await?;

        Ok(IssuedCert {
            cert_path,
            key_path,
            cert_pem,
            key_pem,
        })
    }

    /// Render a client kubeconfig and write it to the given path
    pub async fn write_kubeconfig(
        &self,
        path: &Path,
        server_url: &str,
        user: &str,
        cert: &IssuedCert,
    ) -> Result<()> {
        let ca = self.ca().await?;
        let rendered = kubeconfig(server_url, &ca.cert_pem, &cert.cert_pem, &cert.key_pem, user);
        write_private(path, &rendered).await?;
        Ok(())
    }
}

/// Generate a new self-signed CA
pub fn generate_ca(common_name: &str) -> Result<CaBundle> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String("kore".to_string()));
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    // 10 year validity
    params.not_before = rcgen::date_time_ymd(2025, 1, 1);
    params.not_after = rcgen::date_time_ymd(2035, 1, 1);

    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate CA key: {e}")))?;
    let key_pem = key_pair.serialize_pem();

    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {e}"))
    })?;

    Ok(CaBundle {
        cert_pem: cert.pem(),
        key_pem,
    })
}

/// Issue one leaf certificate signed by the given CA
fn issue_leaf(ca: &CaBundle, request: &CertRequest) -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(request.cn.clone()));
    if let Some(org) = &request.org {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    // 1 year validity for leaves
    params.not_before = rcgen::date_time_ymd(2025, 1, 1);
    params.not_after = rcgen::date_time_ymd(2026, 1, 1);

    for san in &request.sans {
        if let Ok(ip) = san.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            let name = Ia5String::try_from(san.clone())
                .map_err(|e| PkiError::ParseError(format!("invalid SAN {san}: {e}")))?;
            params.subject_alt_names.push(SanType::DnsName(name));
        }
    }

    let ca_key = KeyPair::from_pem(&ca.key_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {e}")))?;

    let leaf_key = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {e}")))?;
    let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {e}"))
    })?;

    Ok((cert.pem(), leaf_key.serialize_pem()))
}

/// Render a kubeconfig with embedded certificates
pub fn kubeconfig(
    server_url: &str,
    ca_pem: &str,
    cert_pem: &str,
    key_pem: &str,
    user: &str,
) -> String {
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
            "name": user,
            "user": {
                "client-certificate-data": STANDARD.encode(cert_pem),
                "client-key-data": STANDARD.encode(key_pem),
            },
        }],
        "contexts": [{
            "name": "kore",
            "context": { "cluster": "kore", "user": user },
        }],
        "current-context": "kore",
    });
    // Serializing a json! mapping cannot fail
    serde_yaml::to_string(&doc).unwrap_or_default()
}

/// Write a file only the owner may read (keys, kubeconfigs)
pub(crate) async fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_ca_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());

        manager.ensure_ca().await.unwrap();
        assert!(manager.ca_exists());

        let ca = manager.ca().await.unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn test_ensure_ca_reloads_existing_material() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());
        manager.ensure_ca().await.unwrap();
        let first = manager.ca().await.unwrap();

        // A second manager over the same dir must not regenerate the CA
        let manager = CertificateManager::new(dir.path());
        manager.ensure_ca().await.unwrap();
        assert_eq!(manager.ca().await.unwrap().cert_pem, first.cert_pem);
    }

    #[tokio::test]
    async fn test_adopt_ca_persists_synced_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());

        let bundle = generate_ca("peer-ca").unwrap();
        manager.adopt_ca(bundle.clone()).await.unwrap();

        assert!(manager.ca_exists());
        assert_eq!(manager.ca().await.unwrap().cert_pem, bundle.cert_pem);
    }

    #[tokio::test]
    async fn test_adopt_ca_rejects_garbage_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());

        let bundle = CaBundle {
            cert_pem: "not a cert".to_string(),
            key_pem: "not a key".to_string(),
        };
        assert!(manager.adopt_ca(bundle).await.is_err());
        assert!(!manager.ca_exists());
    }

    #[tokio::test]
    async fn test_issuance_requires_ca() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());
        let err = manager
            .ensure_issued(&CertRequest::new("admin", "admin"))
            .await
            .unwrap_err();
        assert!(matches!(err, PkiError::CaNotInitialized));
    }

    #[tokio::test]
    async fn test_ensure_issued_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());
        manager.ensure_ca().await.unwrap();

        let request = CertRequest::new("apiserver", "kube-apiserver")
            .with_sans(vec!["127.0.0.1".to_string(), "localhost".to_string()]);
        let first = manager.ensure_issued(&request).await.unwrap();
        let second = manager.ensure_issued(&request).await.unwrap();

        assert_eq!(first.cert_pem, second.cert_pem, "restart must not rotate certs");
        assert!(first.cert_path.exists());
        assert!(first.key_path.exists());
    }

    #[tokio::test]
    async fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(dir.path());
        manager.ensure_ca().await.unwrap();

        let mode = std::fs::metadata(manager.ca_key_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_kubeconfig_embeds_material() {
        let rendered = kubeconfig("https://10.0.0.1:6443", "CA", "CERT", "KEY", "admin");
        assert!(rendered.contains("server: https://10.0.0.1:6443"));
        assert!(rendered.contains("name: admin"));
        assert!(rendered.contains(&STANDARD.encode("CA")));
        assert!(rendered.contains("current-context: kore"));
    }
}
