//! Cluster scheduler component

use async_trait::async_trait;

use crate::component::Component;
use crate::config::NodePaths;
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::Result;

/// Supervises the `kube-scheduler` process
pub struct Scheduler {
    paths: NodePaths,
    supervisor: Option<Supervisor>,
}

impl Scheduler {
    /// Create the component
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            supervisor: None,
        }
    }
}

#[async_trait]
impl Component for Scheduler {
    fn name(&self) -> &str {
        "kube-scheduler"
    }

    async fn init(&mut self) -> Result<()> {
        let args = vec![
            format!(
                "--authentication-kubeconfig={}",
                self.paths.cert_dir().join("scheduler.conf").display()
            ),
            format!(
                "--kubeconfig={}",
                self.paths.cert_dir().join("scheduler.conf").display()
            ),
            "--bind-address=127.0.0.1".to_string(),
            "--leader-elect=false".to_string(),
        ];
        self.supervisor = Some(Supervisor::new(
            "kube-scheduler",
            self.paths.bin_dir().join("kube-scheduler"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("kube-scheduler", "not initialized"))?;
        supervisor.spawn();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor.stop().await?;
        }
        Ok(())
    }
}
