//! Control-plane components
//!
//! Everything the component manager drives on a controller node lives here:
//! the certificate bootstrap (sync components), the storage backends, the
//! supervised control-plane processes, the manifest applier bridge, the
//! local control API, and the telemetry reporter.

pub mod api_server;
pub mod applier;
pub mod ca_syncer;
pub mod certificates;
pub mod control_api;
pub mod controller_manager;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod tunnel;

pub use api_server::ApiServer;
pub use applier::ApplierManager;
pub use ca_syncer::CaSyncer;
pub use certificates::Certificates;
pub use control_api::ControlApi;
pub use controller_manager::ControllerManager;
pub use scheduler::Scheduler;
pub use storage::{storage_backend, storage_endpoint, Etcd, Kine};
pub use telemetry::Reporter;
pub use tunnel::TunnelServer;

/// Name this node goes by in cluster membership (consensus store, telemetry)
pub(crate) fn node_name() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "kore-node".to_string())
}
