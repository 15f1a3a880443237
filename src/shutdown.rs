//! Signal-driven shutdown sequencing
//!
//! One sequencer owns the termination channel for the whole process. The
//! channel is buffered so a signal arriving during the startup window,
//! before the orchestrator reaches its wait point, is held rather than
//! lost. Fatal startup errors feed the same channel so both paths run the
//! identical teardown: reconcilers first, then the component manager, both
//! best-effort.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::component::Manager;
use crate::reconciler::ReconcilerSet;

/// Why the node is shutting down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT or SIGTERM received
    Signal,
    /// A fatal startup error synthesized a termination event
    StartupFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Running,
    Stopping,
    Stopped,
}

/// Single-entry shutdown state machine: `Running -> Stopping -> Stopped`
pub struct ShutdownSequencer {
    tx: mpsc::Sender<StopReason>,
    rx: mpsc::Receiver<StopReason>,
    state: State,
}

impl ShutdownSequencer {
    /// Create a sequencer with a one-slot buffered termination channel
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx,
            state: State::Running,
        }
    }

    /// Install the SIGINT/SIGTERM handler task
    ///
    /// No other signals are handled. Installing after `Manager::init` is
    /// safe because the buffered channel holds a signal delivered before
    /// `wait` is reached.
    pub fn install_signal_handler(&self) -> std::io::Result<()> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
                // A full buffer means a termination event is already
                // pending; dropping the duplicate is correct.
                let _ = tx.try_send(StopReason::Signal);
            }
        });
        Ok(())
    }

    /// Synthesize a termination event (fatal start or worker error)
    pub fn trigger(&self, reason: StopReason) {
        let _ = self.tx.try_send(reason);
    }

    /// Block until a termination event arrives
    pub async fn wait(&mut self) -> StopReason {
        // The sequencer holds its own sender, so recv never yields None
        self.rx.recv().await.unwrap_or(StopReason::Signal)
    }

    /// Run the teardown: reconcilers first, then the component manager
    ///
    /// Both sweeps are best-effort; individual failures are logged and never
    /// abort the remaining teardown. Idempotent once `Stopped`.
    pub async fn shutdown(&mut self, reconcilers: &mut ReconcilerSet, manager: &mut Manager) {
        if self.state != State::Running {
            return;
        }
        self.state = State::Stopping;

        info!("stopping reconcilers");
        reconcilers.stop_all().await;

        info!("stopping components");
        if let Err(e) = manager.stop().await {
            error!(error = %e, "error while stopping component manager");
        }

        self.state = State::Stopped;
    }
}

impl Default for ShutdownSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::reconciler::Reconciler;
    use crate::Result;
    use std::sync::{Arc, Mutex};

    struct Probe {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        async fn init(&mut self) -> Result<()> {
            Ok(())
        }
        async fn run(&mut self) -> Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("component:{}", self.name));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Reconciler for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        async fn run(&mut self) -> Result<()> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("reconciler:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconcilers_before_components() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager.add(Box::new(Probe {
            name: "api".to_string(),
            log: log.clone(),
        }) as Box<dyn Component>);
        let mut reconcilers = ReconcilerSet::new();
        reconcilers.insert(Box::new(Probe {
            name: "coredns".to_string(),
            log: log.clone(),
        }) as Box<dyn Reconciler>);

        let mut sequencer = ShutdownSequencer::new();
        sequencer.trigger(StopReason::Signal);
        sequencer.wait().await;
        sequencer.shutdown(&mut reconcilers, &mut manager).await;

        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["reconciler:coredns", "component:api"]);
    }

    #[tokio::test]
    async fn test_trigger_before_wait_is_not_lost() {
        // The startup window: a termination event fires before anyone is
        // waiting. The buffered slot must hold it.
        let mut sequencer = ShutdownSequencer::new();
        sequencer.trigger(StopReason::StartupFailure);

        assert_eq!(sequencer.wait().await, StopReason::StartupFailure);
    }

    #[tokio::test]
    async fn test_duplicate_triggers_collapse() {
        let mut sequencer = ShutdownSequencer::new();
        sequencer.trigger(StopReason::Signal);
        sequencer.trigger(StopReason::Signal);
        sequencer.trigger(StopReason::StartupFailure);

        assert_eq!(sequencer.wait().await, StopReason::Signal);

        // Nothing else is buffered; a fresh trigger is delivered again.
        sequencer.trigger(StopReason::StartupFailure);
        assert_eq!(sequencer.wait().await, StopReason::StartupFailure);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut sequencer = ShutdownSequencer::new();
        let mut reconcilers = ReconcilerSet::new();
        let mut manager = Manager::new();

        sequencer.shutdown(&mut reconcilers, &mut manager).await;
        // Second call must be a no-op, not a double teardown.
        sequencer.shutdown(&mut reconcilers, &mut manager).await;
        assert_eq!(sequencer.state, State::Stopped);
    }

    #[tokio::test]
    async fn test_install_signal_handler() {
        let sequencer = ShutdownSequencer::new();
        sequencer.install_signal_handler().unwrap();
    }
}
