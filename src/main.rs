//! kore - single-binary controller for a lightweight Kubernetes-compatible
//! cluster distribution

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kore::component::Manager;
use kore::config::{ClusterConfig, NodePaths};
use kore::error::Error;
use kore::join::JoinClient;
use kore::pki::CertificateManager;
use kore::reconciler::ReconcilerSet;
use kore::server::{
    storage_backend, storage_endpoint, ApiServer, ApplierManager, CaSyncer, Certificates,
    ControlApi, ControllerManager, Reporter, Scheduler, TunnelServer,
};
use kore::shutdown::{ShutdownSequencer, StopReason};
use kore::worker::{enable_worker, WorkerOptions};

/// kore - lightweight Kubernetes-compatible cluster distribution
#[derive(Parser, Debug)]
#[command(name = "kore", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller node
    ///
    /// Without a join token this node founds a new cluster: it generates a
    /// CA and brings up a fresh control plane. With a token it joins an
    /// existing cluster, fetching CA and peer material from the token's
    /// peer before anything else starts.
    Server(ServerArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    /// Path to the cluster configuration file
    #[arg(short = 'c', long = "config", default_value = kore::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Also run worker processes (containerd + kubelet) on this node
    #[arg(long)]
    enable_worker: bool,

    /// Worker profile to use on the node
    #[arg(long, default_value = "default")]
    profile: String,

    /// Data directory for all node-local state
    #[arg(long, default_value = kore::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Join token for joining an existing cluster
    join_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // One process-wide crypto provider; both the TLS client and server
    // stacks resolve against it.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => start_server(args).await.map_err(Into::into),
    }
}

/// Decide join vs. founder mode and assemble the full component set
///
/// In join mode the CA syncer is registered ahead of the certificate
/// issuer so the fetched CA exists before local certificates are derived
/// from it. The storage backend is *selected* before anything is
/// registered: an unrecognized storage kind must abort with zero
/// components in the registry.
///
/// Returns whether this node is joining an existing cluster.
fn register_control_plane(
    config: &ClusterConfig,
    paths: &NodePaths,
    certs: &Arc<CertificateManager>,
    manager: &mut Manager,
    join_token: Option<&str>,
) -> kore::Result<bool> {
    let mut join = false;
    let mut join_client: Option<Arc<JoinClient>> = None;
    if let Some(token) = join_token.filter(|t| !t.is_empty()) {
        join = true;
        let client = JoinClient::from_token(token)
            .map_err(|e| Error::join(format!("failed to create join client: {e}")))?;
        join_client = Some(client);
    }

    let storage = storage_backend(config, paths, join, certs.clone(), join_client.clone())?;

    if let Some(client) = join_client {
        manager.add_sync(Box::new(CaSyncer::new(client, certs.clone())));
    }
    manager.add_sync(Box::new(Certificates::new(
        config.clone(),
        paths.clone(),
        certs.clone(),
    )));

    info!(backend = storage.name(), "using storage backend");
    manager.add(storage);

    manager.add(Box::new(ApiServer::new(
        config.clone(),
        paths.clone(),
        certs.clone(),
        storage_endpoint(config, paths),
    )));
    manager.add(Box::new(TunnelServer::new(config.clone(), paths.clone())));
    manager.add(Box::new(Scheduler::new(paths.clone())));
    manager.add(Box::new(ControllerManager::new(config.clone(), paths.clone())));
    manager.add(Box::new(ApplierManager::new(paths.clone())));
    manager.add(Box::new(ControlApi::new(
        config.clone(),
        paths.clone(),
        certs.clone(),
    )));
    if config.telemetry.enabled {
        manager.add(Box::new(Reporter::new()));
    }

    Ok(join)
}

/// The ordered startup and teardown of one controller node
async fn start_server(args: ServerArgs) -> kore::Result<()> {
    let config = ClusterConfig::load(&args.config)?;
    let violations = config.validate();
    if !violations.is_empty() {
        return Err(Error::config(format!(
            "config does not pass validation, following errors found: {}",
            violations.join("; ")
        )));
    }

    // Create directories early with the proper permissions
    let paths = NodePaths::new(&args.data_dir);
    paths.init_directories()?;

    info!(address = %config.api.address, "using public address");
    info!(sans = ?config.api.sans, "using extra SANs");
    info!(dns = %config.network.dns_address()?, "DNS address");

    let mut manager = Manager::new();
    let certs = CertificateManager::new(paths.cert_dir());
    register_control_plane(&config, &paths, &certs, &mut manager, args.join_token.as_deref())?;

    let started = std::time::Instant::now();
    manager.init().await?;
    debug!(elapsed = ?started.elapsed(), "component init complete");

    // The signal handler goes in before start so nothing is ever brought up
    // that a termination signal could no longer tear down; the buffered
    // channel holds a signal arriving during the startup window.
    let mut sequencer = ShutdownSequencer::new();
    sequencer.install_signal_handler()?;

    let start_result = manager.start().await;
    debug!(elapsed = ?started.elapsed(), "component start attempted");
    if let Err(e) = &start_result {
        error!(error = %e, "failed to start server components");
        sequencer.trigger(StopReason::StartupFailure);
    }

    // In-cluster add-on reconcilers; they need a reachable API, so they run
    // only when start reported no aggregate error.
    let mut reconcilers = ReconcilerSet::build(&config, &paths);
    if start_result.is_ok() {
        reconcilers.run_all().await;
    }

    let mut worker_result = Ok(());
    if start_result.is_ok() && args.enable_worker {
        worker_result = enable_worker(
            &config,
            &paths,
            &mut manager,
            &WorkerOptions::with_profile(&args.profile),
        )
        .await;
        if let Err(e) = &worker_result {
            error!(error = %e, "failed to start worker components");
            sequencer.trigger(StopReason::StartupFailure);
        }
    }

    // Block until termination: a signal, or the synthetic event a fatal
    // startup error fed into the same channel.
    let reason = sequencer.wait().await;
    info!(?reason, "shutting down kore server");

    sequencer.shutdown(&mut reconcilers, &mut manager).await;

    start_result?;
    worker_result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kore::join::JoinToken;
    use kore::pki::generate_ca;

    fn test_setup() -> (tempfile::TempDir, ClusterConfig, NodePaths, Arc<CertificateManager>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());
        paths.init_directories().unwrap();
        let certs = CertificateManager::new(paths.cert_dir());
        (dir, ClusterConfig::default(), paths, certs)
    }

    fn valid_join_token() -> String {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        JoinToken {
            endpoint: "https://10.0.0.1:9443".to_string(),
            token: "bearer".to_string(),
            ca_cert: generate_ca("peer-ca").unwrap().cert_pem,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_founder_mode_registers_single_sync_component() {
        let (_dir, config, paths, certs) = test_setup();
        let mut manager = Manager::new();

        let join =
            register_control_plane(&config, &paths, &certs, &mut manager, None).unwrap();

        assert!(!join);
        assert_eq!(manager.sync_component_names(), vec!["certificates"]);
        let components = manager.component_names();
        assert_eq!(
            components,
            vec![
                "kine",
                "kube-apiserver",
                "tunnel-server",
                "kube-scheduler",
                "kube-controller-manager",
                "manifest-applier",
                "control-api",
                "telemetry",
            ]
        );
    }

    #[test]
    fn test_join_mode_registers_ca_syncer_ahead_of_certificates() {
        let (_dir, config, paths, certs) = test_setup();
        let mut manager = Manager::new();
        let token = valid_join_token();

        let join =
            register_control_plane(&config, &paths, &certs, &mut manager, Some(&token)).unwrap();

        assert!(join);
        assert_eq!(manager.sync_component_names(), vec!["ca-syncer", "certificates"]);
    }

    #[test]
    fn test_empty_token_means_founder_mode() {
        let (_dir, config, paths, certs) = test_setup();
        let mut manager = Manager::new();

        let join = register_control_plane(&config, &paths, &certs, &mut manager, Some("")).unwrap();
        assert!(!join);
        assert_eq!(manager.sync_component_names(), vec!["certificates"]);
    }

    #[test]
    fn test_malformed_token_is_fatal_before_registration() {
        let (_dir, config, paths, certs) = test_setup();
        let mut manager = Manager::new();

        let err = register_control_plane(&config, &paths, &certs, &mut manager, Some("garbage"))
            .unwrap_err();
        assert!(err.to_string().contains("failed to create join client"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_unrecognized_storage_type_registers_nothing() {
        let (_dir, mut config, paths, certs) = test_setup();
        config.storage.kind = "bogus".to_string();
        let mut manager = Manager::new();

        let err =
            register_control_plane(&config, &paths, &certs, &mut manager, None).unwrap_err();
        assert!(err.to_string().contains("invalid storage type"));
        assert!(manager.is_empty(), "zero components on config error");
    }

    #[test]
    fn test_etcd_storage_selected_when_configured() {
        let (_dir, mut config, paths, certs) = test_setup();
        config.storage.kind = "etcd".to_string();
        let mut manager = Manager::new();

        register_control_plane(&config, &paths, &certs, &mut manager, None).unwrap();
        assert!(manager.component_names().contains(&"etcd"));
    }

    #[test]
    fn test_telemetry_disabled_skips_reporter() {
        let (_dir, mut config, paths, certs) = test_setup();
        config.telemetry.enabled = false;
        let mut manager = Manager::new();

        register_control_plane(&config, &paths, &certs, &mut manager, None).unwrap();
        assert!(!manager.component_names().contains(&"telemetry"));
    }
}
