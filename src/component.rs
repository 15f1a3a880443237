//! Component lifecycle contract and the ordered component manager
//!
//! Every managed control-plane process implements [`Component`]. The
//! [`Manager`] owns the ordered set and drives `init` / `run` / `stop`
//! across all of them with three deliberately different failure policies:
//!
//! - `init` is fail-fast: a half-initialized dependency chain must never
//!   reach `run` (a scheduler must not run against uninitialized storage).
//! - `run` is best-effort with first-error-wins aggregation: one component
//!   being down does not make starting the others unsafe.
//! - `stop` is always best-effort: teardown is never abandoned because one
//!   component misbehaved.

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::Result;

/// Uniform capability contract implemented by every managed process/unit
///
/// Lifecycle calls are driven sequentially by a single control flow and are
/// expected to return once the component has reached the requested state
/// (or failed); components run their own internal concurrency behind `run`.
#[async_trait]
pub trait Component: Send {
    /// Stable name used in logs and error messages
    fn name(&self) -> &str;

    /// Prepare the component: directories, certificates, configuration
    async fn init(&mut self) -> Result<()>;

    /// Bring the component to its running state
    async fn run(&mut self) -> Result<()>;

    /// Stop the component and release its resources
    async fn stop(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component").field("name", &self.name()).finish()
    }
}

/// Ordered, dependency-respecting manager for a dynamically-assembled set of
/// long-running components
///
/// The registry is built once before `init` and never mutated afterwards,
/// with one documented exception: worker enablement appends its components
/// after `init`/`run` completed, driving their lifecycle itself so they only
/// participate in the ordinary `stop` path.
#[derive(Default)]
pub struct Manager {
    sync_components: Vec<Box<dyn Component>>,
    components: Vec<Box<dyn Component>>,
}

impl Manager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component to the sync group
    ///
    /// Sync components are initialized to completion, in registration order,
    /// strictly before any other component's `init` begins. Used for the
    /// CA/certificate bootstrap every later component depends on.
    pub fn add_sync(&mut self, component: Box<dyn Component>) {
        self.sync_components.push(component);
    }

    /// Append a component to the regular group
    pub fn add(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    /// Number of registered components across both groups
    pub fn len(&self) -> usize {
        self.sync_components.len() + self.components.len()
    }

    /// Whether no component has been registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the sync-group components, in registration order
    pub fn sync_component_names(&self) -> Vec<&str> {
        self.sync_components.iter().map(|c| c.name()).collect()
    }

    /// Names of the regular components, in registration order
    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    /// Initialize every component: sync group first, then the regular group,
    /// each strictly sequential in registration order
    ///
    /// The first failure aborts immediately; components after the failing
    /// one never observe `init`.
    pub async fn init(&mut self) -> Result<()> {
        for component in &mut self.sync_components {
            debug!(component = component.name(), "initializing sync component");
            component.init().await?;
        }
        for component in &mut self.components {
            debug!(component = component.name(), "initializing component");
            component.init().await?;
        }
        Ok(())
    }

    /// Run every initialized component in the same order as `init`
    ///
    /// A failure does not prevent later components from being attempted; the
    /// first error encountered is returned after all components have been
    /// tried.
    pub async fn start(&mut self) -> Result<()> {
        let mut first_err = None;
        for component in self.sync_components.iter_mut().chain(&mut self.components) {
            info!(component = component.name(), "starting component");
            if let Err(e) = component.run().await {
                error!(component = component.name(), error = %e, "failed to start component");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every registered component in reverse registration order
    ///
    /// Individual failures are logged and never abort the sweep; the first
    /// failure is returned after every component has been visited, only to
    /// signal that at least one stop failed. Tolerates components that were
    /// appended after `init`/`start` (worker enablement).
    pub async fn stop(&mut self) -> Result<()> {
        let mut first_err = None;
        for component in self
            .components
            .iter_mut()
            .rev()
            .chain(self.sync_components.iter_mut().rev())
        {
            info!(component = component.name(), "stopping component");
            if let Err(e) = component.stop().await {
                error!(component = component.name(), error = %e, "failed to stop component");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::{Arc, Mutex};

    /// Records every lifecycle call into a shared log, optionally failing
    /// chosen phases
    struct Probe {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
        fail_run: bool,
        fail_stop: bool,
    }

    impl Probe {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: log.clone(),
                fail_init: false,
                fail_run: false,
                fail_stop: false,
            }
        }

        fn record(&self, phase: &str) {
            self.log.lock().unwrap().push(format!("{}:{phase}", self.name));
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&mut self) -> Result<()> {
            self.record("init");
            if self.fail_init {
                return Err(Error::component(&self.name, "init failed"));
            }
            Ok(())
        }

        async fn run(&mut self) -> Result<()> {
            self.record("run");
            if self.fail_run {
                return Err(Error::component(&self.name, "run failed"));
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.record("stop");
            if self.fail_stop {
                return Err(Error::component(&self.name, "stop failed"));
            }
            Ok(())
        }
    }

    fn events(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_init_runs_sync_group_before_async_group_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager.add(Box::new(Probe::new("a", &log)));
        manager.add_sync(Box::new(Probe::new("certs", &log)));
        manager.add(Box::new(Probe::new("b", &log)));
        manager.add_sync(Box::new(Probe::new("ca-sync", &log)));

        manager.init().await.unwrap();

        // Sync components first in their own registration order, then the
        // async group in its registration order, regardless of interleaved
        // add calls.
        assert_eq!(
            events(&log),
            vec!["certs:init", "ca-sync:init", "a:init", "b:init"]
        );
    }

    #[tokio::test]
    async fn test_sync_init_failure_prevents_all_async_init() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        let mut failing = Probe::new("certs", &log);
        failing.fail_init = true;
        manager.add_sync(Box::new(failing));
        manager.add(Box::new(Probe::new("storage", &log)));
        manager.add(Box::new(Probe::new("api", &log)));

        assert!(manager.init().await.is_err());
        assert_eq!(events(&log), vec!["certs:init"]);
    }

    #[tokio::test]
    async fn test_init_fail_fast_within_async_group() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager.add(Box::new(Probe::new("storage", &log)));
        let mut failing = Probe::new("api", &log);
        failing.fail_init = true;
        manager.add(Box::new(failing));
        manager.add(Box::new(Probe::new("scheduler", &log)));

        assert!(manager.init().await.is_err());
        assert_eq!(events(&log), vec!["storage:init", "api:init"]);
    }

    #[tokio::test]
    async fn test_start_attempts_all_and_returns_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        let mut failing = Probe::new("api", &log);
        failing.fail_run = true;
        manager.add(Box::new(failing));
        manager.add(Box::new(Probe::new("telemetry", &log)));

        manager.init().await.unwrap();
        log.lock().unwrap().clear();

        let err = manager.start().await.unwrap_err();
        assert!(err.to_string().contains("api"), "first error wins: {err}");
        assert_eq!(events(&log), vec!["api:run", "telemetry:run"]);
    }

    #[tokio::test]
    async fn test_stop_visits_every_component_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager.add_sync(Box::new(Probe::new("certs", &log)));
        let mut failing = Probe::new("storage", &log);
        failing.fail_stop = true;
        manager.add(Box::new(failing));
        manager.add(Box::new(Probe::new("api", &log)));

        manager.init().await.unwrap();
        manager.start().await.unwrap();
        log.lock().unwrap().clear();

        // One stop failure neither aborts the sweep nor reorders it, and is
        // surfaced to the caller after all components were visited.
        assert!(manager.stop().await.is_err());
        assert_eq!(events(&log), vec!["api:stop", "storage:stop", "certs:stop"]);
    }

    #[tokio::test]
    async fn test_stop_tolerates_components_added_after_start() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager.add(Box::new(Probe::new("api", &log)));
        manager.init().await.unwrap();
        manager.start().await.unwrap();

        // Worker enablement appends components that never pass through the
        // manager's own init/run.
        manager.add(Box::new(Probe::new("kubelet", &log)));
        log.lock().unwrap().clear();

        manager.stop().await.unwrap();
        assert_eq!(events(&log), vec!["kubelet:stop", "api:stop"]);
    }
}
