//! Add-on reconciler constructors
//!
//! One constructor per managed add-on. Each validates its inputs, compiles
//! its manifest template, and returns a [`ManifestReconciler`] that renders
//! the add-on's desired state into the stack manifest directory on `run`.
//! Construction failures degrade the node by omission: the failing add-on is
//! left out of the set, the rest are unaffected.

use minijinja::{context, Environment, Value};

use crate::config::{ClusterConfig, NodePaths};
use crate::error::Error;
use crate::Result;

use super::manifests::ManifestsSaver;
use super::Reconciler;

/// Generic template-driven add-on reconciler
///
/// `run` renders the compiled template with the context captured at
/// construction and writes it into the add-on's manifest subdirectory;
/// `stop` has nothing to release since applied state stays in the cluster.
pub struct ManifestReconciler {
    name: &'static str,
    file: String,
    env: Environment<'static>,
    context: Value,
    saver: ManifestsSaver,
}

impl ManifestReconciler {
    fn new(
        name: &'static str,
        template: &'static str,
        context: Value,
        paths: &NodePaths,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(name, template)
            .map_err(|e| Error::component(name, format!("invalid manifest template: {e}")))?;
        let saver = ManifestsSaver::new(&paths.manifests_dir(), name)
            .map_err(|e| Error::component(name, format!("failed to create manifest dir: {e}")))?;
        Ok(Self {
            name,
            file: format!("{name}.yaml"),
            env,
            context,
            saver,
        })
    }
}

#[async_trait::async_trait]
impl Reconciler for ManifestReconciler {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&mut self) -> Result<()> {
        let template = self
            .env
            .get_template(self.name)
            .map_err(|e| Error::component(self.name, format!("template lookup failed: {e}")))?;
        let rendered = template
            .render(&self.context)
            .map_err(|e| Error::component(self.name, format!("template render failed: {e}")))?;
        self.saver
            .save(&self.file, &rendered)
            .await
            .map_err(|e| Error::component(self.name, format!("failed to write manifest: {e}")))?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

const DEFAULT_PSP_TEMPLATE: &str = r#"apiVersion: policy/v1beta1
kind: PodSecurityPolicy
metadata:
  name: kore-default
spec:
  privileged: {{ privileged }}
  seLinux:
    rule: RunAsAny
  runAsUser:
    rule: RunAsAny
  supplementalGroups:
    rule: RunAsAny
  fsGroup:
    rule: RunAsAny
  volumes:
    - '*'
"#;

/// Pod-security defaults applied to every cluster
pub fn default_psp(paths: &NodePaths) -> Result<ManifestReconciler> {
    ManifestReconciler::new(
        "default-psp",
        DEFAULT_PSP_TEMPLATE,
        context! { privileged => true },
        paths,
    )
}

const KUBE_PROXY_TEMPLATE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: kube-proxy
  namespace: kube-system
data:
  kube-proxy.conf: |
    apiVersion: kubeproxy.config.k8s.io/v1alpha1
    kind: KubeProxyConfiguration
    clusterCIDR: {{ pod_cidr }}
    mode: iptables
  server: {{ api_url }}
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kube-proxy
  namespace: kube-system
  labels:
    k8s-app: kube-proxy
spec:
  selector:
    matchLabels:
      k8s-app: kube-proxy
  template:
    metadata:
      labels:
        k8s-app: kube-proxy
    spec:
      hostNetwork: true
      containers:
        - name: kube-proxy
          image: registry.k8s.io/kube-proxy:v1.31.0
          command: ["/usr/local/bin/kube-proxy", "--config=/var/lib/kube-proxy/kube-proxy.conf"]
"#;

/// kube-proxy daemonset for service traffic on every node
pub fn kube_proxy(config: &ClusterConfig, paths: &NodePaths) -> Result<ManifestReconciler> {
    ManifestReconciler::new(
        "kube-proxy",
        KUBE_PROXY_TEMPLATE,
        context! {
            pod_cidr => config.network.pod_cidr,
            api_url => config.api.local_url(),
        },
        paths,
    )
}

const COREDNS_TEMPLATE: &str = r#"apiVersion: v1
kind: Service
metadata:
  name: kube-dns
  namespace: kube-system
spec:
  clusterIP: {{ dns_address }}
  selector:
    k8s-app: coredns
  ports:
    - name: dns
      port: 53
      protocol: UDP
    - name: dns-tcp
      port: 53
      protocol: TCP
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: coredns
  namespace: kube-system
  labels:
    k8s-app: coredns
spec:
  replicas: 2
  selector:
    matchLabels:
      k8s-app: coredns
  template:
    metadata:
      labels:
        k8s-app: coredns
    spec:
      containers:
        - name: coredns
          image: docker.io/coredns/coredns:1.11.3
          args: ["-conf", "/etc/coredns/Corefile"]
"#;

/// Cluster DNS; construction fails when the service CIDR cannot yield a DNS
/// address
pub fn coredns(config: &ClusterConfig, paths: &NodePaths) -> Result<ManifestReconciler> {
    let dns_address = config.network.dns_address()?;
    ManifestReconciler::new(
        "coredns",
        COREDNS_TEMPLATE,
        context! { dns_address => dns_address },
        paths,
    )
}

const CILIUM_TEMPLATE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: cilium-config
  namespace: kube-system
data:
  cluster-pool-ipv4-cidr: {{ pod_cidr }}
  tunnel: vxlan
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: cilium
  namespace: kube-system
  labels:
    k8s-app: cilium
spec:
  selector:
    matchLabels:
      k8s-app: cilium
  template:
    metadata:
      labels:
        k8s-app: cilium
    spec:
      hostNetwork: true
      containers:
        - name: cilium-agent
          image: quay.io/cilium/cilium:v1.16.5
          command: ["cilium-agent", "--config-dir=/tmp/cilium/config-map"]
"#;

/// Managed CNI; only constructed when the configured provider is `cilium`
pub fn cilium(config: &ClusterConfig, paths: &NodePaths) -> Result<ManifestReconciler> {
    ManifestReconciler::new(
        "cilium",
        CILIUM_TEMPLATE,
        context! { pod_cidr => config.network.pod_cidr },
        paths,
    )
}

const METRIC_SERVER_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: metrics-server
  namespace: kube-system
  labels:
    k8s-app: metrics-server
spec:
  selector:
    matchLabels:
      k8s-app: metrics-server
  template:
    metadata:
      labels:
        k8s-app: metrics-server
    spec:
      containers:
        - name: metrics-server
          image: registry.k8s.io/metrics-server/metrics-server:v0.7.2
          args:
            - --kubelet-insecure-tls
            - --kubelet-preferred-address-types=InternalIP
"#;

/// Resource metrics API backend
pub fn metric_server(paths: &NodePaths) -> Result<ManifestReconciler> {
    ManifestReconciler::new("metric-server", METRIC_SERVER_TEMPLATE, context! {}, paths)
}

const KUBELET_CONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: kubelet-config-{{ profile }}
  namespace: kube-system
data:
  kubelet: |
    apiVersion: kubelet.config.k8s.io/v1beta1
    kind: KubeletConfiguration
    clusterDNS:
      - {{ dns_address }}
    clusterDomain: cluster.local
    cgroupsPerQOS: true
"#;

/// Base kubelet configuration profile served to workers
pub fn kubelet_config(config: &ClusterConfig, paths: &NodePaths) -> Result<ManifestReconciler> {
    let dns_address = config.network.dns_address()?;
    ManifestReconciler::new(
        "kubelet-config",
        KUBELET_CONFIG_TEMPLATE,
        context! {
            dns_address => dns_address,
            profile => "default",
        },
        paths,
    )
}

const SYSTEM_RBAC_TEMPLATE: &str = r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: kore:bootstrap-node-approver
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:certificates.k8s.io:certificatesigningrequests:nodeclient
subjects:
  - apiGroup: rbac.authorization.k8s.io
    kind: Group
    name: system:bootstrappers
"#;

/// RBAC bootstrap so kubelet bootstrap tokens can request certificates
pub fn system_rbac(paths: &NodePaths) -> Result<ManifestReconciler> {
    ManifestReconciler::new("system-rbac", SYSTEM_RBAC_TEMPLATE, context! {}, paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coredns_renders_dns_address() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        let config = ClusterConfig::default();

        let mut reconciler = coredns(&config, &paths).unwrap();
        reconciler.run().await.unwrap();

        let rendered =
            std::fs::read_to_string(paths.manifests_dir().join("coredns/coredns.yaml")).unwrap();
        assert!(rendered.contains("clusterIP: 10.96.0.10"));
    }

    #[test]
    fn test_coredns_constructor_fails_on_bad_service_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        let mut config = ClusterConfig::default();
        config.network.service_cidr = "bogus".to_string();

        assert!(coredns(&config, &paths).is_err());
    }

    #[tokio::test]
    async fn test_kubelet_config_names_the_default_profile() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        let config = ClusterConfig::default();

        let mut reconciler = kubelet_config(&config, &paths).unwrap();
        reconciler.run().await.unwrap();

        let rendered = std::fs::read_to_string(
            paths.manifests_dir().join("kubelet-config/kubelet-config.yaml"),
        )
        .unwrap();
        assert!(rendered.contains("kubelet-config-default"));
        assert!(rendered.contains("10.96.0.10"));
    }
}
