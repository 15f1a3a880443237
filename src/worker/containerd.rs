//! Container runtime component

use async_trait::async_trait;

use crate::component::Component;
use crate::config::NodePaths;
use crate::error::Error;
use crate::supervisor::Supervisor;
use crate::Result;

/// Supervises the `containerd` process
pub struct ContainerRuntime {
    paths: NodePaths,
    supervisor: Option<Supervisor>,
}

impl ContainerRuntime {
    /// Create the component
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            supervisor: None,
        }
    }

    /// Socket the node agent dials for runtime operations
    pub fn socket(paths: &NodePaths) -> String {
        format!("unix://{}", paths.run_dir().join("containerd.sock").display())
    }
}

#[async_trait]
impl Component for ContainerRuntime {
    fn name(&self) -> &str {
        "containerd"
    }

    async fn init(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(self.paths.run_dir()).await?;
        let args = vec![
            format!("--root={}", self.paths.data_dir().join("containerd").display()),
            format!("--state={}", self.paths.run_dir().join("containerd").display()),
            format!(
                "--address={}",
                self.paths.run_dir().join("containerd.sock").display()
            ),
        ];
        self.supervisor = Some(Supervisor::new(
            "containerd",
            self.paths.bin_dir().join("containerd"),
            args,
        ));
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let supervisor = self
            .supervisor
            .as_mut()
            .ok_or_else(|| Error::component("containerd", "not initialized"))?;
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
