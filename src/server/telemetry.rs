//! Telemetry reporter component
//!
//! Registered only when `telemetry.enabled` is set. Emits a periodic
//! heartbeat event carrying a stable machine identity and the build
//! version; the event sink is the structured log stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::component::Component;
use crate::error::Error;
use crate::Result;

const REPORT_INTERVAL: Duration = Duration::from_secs(600);

/// Stable machine identity for telemetry
///
/// Prefers the OS machine id; falls back to the hostname on systems that
/// don't have one.
pub fn machine_id() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    super::node_name()
}

/// Periodic telemetry heartbeat
pub struct Reporter {
    interval: Duration,
    machine_id: Option<String>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Reporter {
    /// Create the component with the default reporting interval
    pub fn new() -> Self {
        Self {
            interval: REPORT_INTERVAL,
            machine_id: None,
            stop_tx: None,
            task: None,
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for Reporter {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn init(&mut self) -> Result<()> {
        self.machine_id = Some(machine_id());
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let machine_id = self
            .machine_id
            .clone()
            .ok_or_else(|| Error::component("telemetry", "not initialized"))?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!(
                            machine_id = %machine_id,
                            version = env!("CARGO_PKG_VERSION"),
                            "telemetry heartbeat"
                        );
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        }));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::component("telemetry", format!("task failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_is_stable_and_non_empty() {
        let id = machine_id();
        assert!(!id.is_empty());
        assert_eq!(id, machine_id());
    }

    #[tokio::test]
    async fn test_run_before_init_is_an_error() {
        let mut reporter = Reporter::new();
        assert!(reporter.run().await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut reporter = Reporter::new();
        reporter.init().await.unwrap();
        reporter.run().await.unwrap();
        reporter.stop().await.unwrap();
    }
}
