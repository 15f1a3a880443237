//! Cluster configuration model and node directory layout
//!
//! Configuration is loaded once from YAML, validated, and never mutated
//! afterwards. Every violation found during validation is collected so the
//! operator sees the full list in one failed startup instead of one error
//! per restart.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Validated, immutable-after-load cluster configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// API server settings
    pub api: ApiSpec,
    /// Cluster networking settings
    pub network: NetworkSpec,
    /// Storage backend settings
    pub storage: StorageSpec,
    /// Telemetry settings
    pub telemetry: TelemetrySpec,
}

/// API server bind address and certificate subject-alternative names
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSpec {
    /// Public address clients and joining nodes use to reach the API
    pub address: String,
    /// Secure port the API server listens on
    pub port: u16,
    /// Extra subject-alternative names for the API server certificate
    pub sans: Vec<String>,
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 6443,
            sans: Vec::new(),
        }
    }
}

impl ApiSpec {
    /// URL clients on this node use to reach the API server
    pub fn local_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }
}

/// Pod/service addressing and the CNI provider selector
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSpec {
    /// CIDR for pod addresses
    pub pod_cidr: String,
    /// CIDR for cluster service addresses
    pub service_cidr: String,
    /// CNI provider; `cilium` is managed by this controller, anything else
    /// is left to an external, user-managed provider
    pub provider: String,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            provider: "cilium".to_string(),
        }
    }
}

impl NetworkSpec {
    /// Cluster DNS service address, derived from the service CIDR (base + 10)
    pub fn dns_address(&self) -> Result<String> {
        Ok(nth_service_address(&self.service_cidr, 10)?.to_string())
    }

    /// In-cluster address of the `kubernetes` service (base + 1)
    pub fn internal_api_address(&self) -> Result<String> {
        Ok(nth_service_address(&self.service_cidr, 1)?.to_string())
    }
}

/// Offset into the service CIDR, used for the well-known service addresses
fn nth_service_address(cidr: &str, offset: u32) -> Result<Ipv4Addr> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::config(format!("invalid service CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::config(format!("invalid service CIDR address: {cidr}")))?;
    let prefix: u32 = prefix
        .parse()
        .map_err(|_| Error::config(format!("invalid service CIDR prefix: {cidr}")))?;
    if prefix == 0 || prefix > 30 {
        return Err(Error::config(format!(
            "service CIDR prefix out of range for well-known addresses: {cidr}"
        )));
    }
    let mask = u32::MAX << (32 - prefix);
    let base = u32::from(addr) & mask;
    Ok(Ipv4Addr::from(base + offset))
}

/// Storage backend kind plus backend-specific connection parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSpec {
    /// Backend kind: `kine` (default, also selected by the empty string) or
    /// `etcd`; anything else fails validation of the storage selector
    #[serde(rename = "type")]
    pub kind: String,
    /// Embedded KV proxy settings
    pub kine: KineSpec,
    /// External consensus store settings
    pub etcd: EtcdSpec,
}

/// Embedded KV proxy (kine) settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KineSpec {
    /// Datasource URI; defaults to a sqlite database under the data dir
    pub data_source: String,
}

/// External consensus store (etcd) settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdSpec {
    /// Address this member advertises to its peers
    pub peer_address: String,
}

impl Default for EtcdSpec {
    fn default() -> Self {
        Self {
            peer_address: "127.0.0.1".to_string(),
        }
    }
}

/// Telemetry toggle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySpec {
    /// Whether the telemetry reporter component is registered at all
    pub enabled: bool,
}

impl Default for TelemetrySpec {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl ClusterConfig {
    /// Load configuration from a YAML file
    ///
    /// A missing file is not an error: the node runs with defaults, the same
    /// way a fresh single-node install would.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Validate the configuration, collecting every violation
    ///
    /// Returns an empty vector when the configuration is usable. The caller
    /// aborts startup on any violation; no component is ever constructed
    /// from an unvalidated config.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.api.address.is_empty() {
            errors.push("api.address must not be empty".to_string());
        } else if self.api.address.parse::<Ipv4Addr>().is_err() {
            errors.push(format!("api.address is not a valid IPv4 address: {}", self.api.address));
        }
        if self.api.port == 0 {
            errors.push("api.port must not be zero".to_string());
        }
        for san in &self.api.sans {
            if san.is_empty() {
                errors.push("api.sans must not contain empty entries".to_string());
            }
        }

        if let Err(e) = nth_service_address(&self.network.service_cidr, 10) {
            errors.push(e.to_string());
        }
        if !self.network.pod_cidr.contains('/') {
            errors.push(format!("network.podCIDR is not a CIDR: {}", self.network.pod_cidr));
        }
        if self.network.provider.is_empty() {
            errors.push("network.provider must not be empty".to_string());
        }

        errors
    }
}

/// Filesystem layout of all node-local state under one data directory
///
/// The admin kubeconfig under the cert dir doubles as the readiness signal
/// that the control plane is locally usable; the kubelet auth config is the
/// marker that worker enablement already ran on this node.
#[derive(Clone, Debug)]
pub struct NodePaths {
    data_dir: PathBuf,
}

impl NodePaths {
    /// Create a layout rooted at the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding CA material, leaf certificates, and kubeconfigs
    pub fn cert_dir(&self) -> PathBuf {
        self.data_dir.join("pki")
    }

    /// Directory the reconcilers write add-on manifests into
    pub fn manifests_dir(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }

    /// Directory holding the bundled control-plane binaries
    pub fn bin_dir(&self) -> PathBuf {
        self.data_dir.join("bin")
    }

    /// Directory for sockets and other runtime state
    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    /// Directory for storage backend state (kine db / etcd data)
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    /// Admin kubeconfig written by the certificates component
    pub fn admin_kubeconfig(&self) -> PathBuf {
        self.cert_dir().join("admin.conf")
    }

    /// Kubelet auth kubeconfig produced by worker enablement
    pub fn kubelet_auth_config(&self) -> PathBuf {
        self.data_dir.join("kubelet.conf")
    }

    /// File of provisioned join-token hashes served by the control API
    pub fn join_tokens_file(&self) -> PathBuf {
        self.cert_dir().join("join-tokens")
    }

    /// Create the data dir (0755) and cert dir (0700) with proper permissions
    ///
    /// Runs before any component exists so no component ever races directory
    /// creation.
    pub fn init_directories(&self) -> std::io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;

        let mut data = std::fs::DirBuilder::new();
        data.recursive(true).mode(0o755);
        data.create(&self.data_dir)?;

        let mut certs = std::fs::DirBuilder::new();
        certs.recursive(true).mode(0o700);
        certs.create(self.cert_dir())?;
        Ok(())
    }
}

impl Default for NodePaths {
    fn default() -> Self {
        Self::new(crate::DEFAULT_DATA_DIR)
    }
}
