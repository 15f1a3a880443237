//! Manifest applier bridge
//!
//! Bridges the reconcilers' on-disk output into the live cluster: polls the
//! stack manifest directory and server-side-applies every changed manifest
//! through the Kubernetes API. The API server usually isn't reachable the
//! moment this component starts, so the client is built lazily and a failed
//! pass simply retries on the next tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::component::Component;
use crate::config::NodePaths;
use crate::error::Error;
use crate::Result;

const APPLY_INTERVAL: Duration = Duration::from_secs(10);
const FIELD_MANAGER: &str = "kore-applier";

/// Applies reconciler-rendered manifests to the live cluster
pub struct ApplierManager {
    paths: NodePaths,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ApplierManager {
    /// Create the component
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            stop_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl Component for ApplierManager {
    fn name(&self) -> &str {
        "manifest-applier"
    }

    async fn init(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(self.paths.manifests_dir()).await?;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let paths = self.paths.clone();

        self.task = Some(tokio::spawn(async move {
            let mut client: Option<Client> = None;
            let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();
            let mut ticker = tokio::time::interval(APPLY_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        apply_pass(&paths, &mut client, &mut seen).await;
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
                .map_err(|e| Error::component("manifest-applier", format!("task failed: {e}")))?;
        }
        Ok(())
    }
}

async fn apply_pass(
    paths: &NodePaths,
    client: &mut Option<Client>,
    seen: &mut HashMap<PathBuf, SystemTime>,
) {
    if client.is_none() {
        match load_client(&paths.admin_kubeconfig()).await {
            Ok(c) => *client = Some(c),
            Err(e) => {
                debug!(error = %e, "API not yet reachable, deferring manifest apply");
                return;
            }
        }
    }
    let Some(client) = client.as_ref() else { return };

    for file in collect_changed(&paths.manifests_dir(), seen) {
        let content = match tokio::fs::read_to_string(&file).await {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to read manifest");
                seen.remove(&file);
                continue;
            }
        };
        let documents = match parse_documents(&content) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "invalid manifest, skipping");
                continue;
            }
        };
        for document in &documents {
            if let Err(e) = apply_manifest(client, document).await {
                warn!(file = %file.display(), error = %e, "failed to apply manifest, will retry");
                // Forget the mtime so the next tick retries the whole file
                seen.remove(&file);
                break;
            }
        }
    }
}

/// Build a client from the locally-written admin kubeconfig
pub(crate) async fn load_client(kubeconfig: &Path) -> Result<Client> {
    let raw = Kubeconfig::read_from(kubeconfig)
        .map_err(|e| Error::component("manifest-applier", format!("kubeconfig: {e}")))?;
    let config = kube::Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::component("manifest-applier", format!("kubeconfig: {e}")))?;
    Ok(Client::try_from(config)?)
}

/// Files under the manifest dir whose mtime changed since the last pass
fn collect_changed(manifests_dir: &Path, seen: &mut HashMap<PathBuf, SystemTime>) -> Vec<PathBuf> {
    let mut changed = Vec::new();
    let Ok(addons) = std::fs::read_dir(manifests_dir) else {
        return changed;
    };
    for addon in addons.flatten() {
        let Ok(files) = std::fs::read_dir(addon.path()) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            let is_yaml = path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !is_yaml || hidden {
                continue;
            }
            let Ok(modified) = file.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            if seen.get(&path) != Some(&modified) {
                seen.insert(path.clone(), modified);
                changed.push(path);
            }
        }
    }
    changed.sort();
    changed
}

/// Split a multi-document YAML file into JSON values
fn parse_documents(content: &str) -> std::result::Result<Vec<serde_json::Value>, serde_yaml::Error> {
    use serde::Deserialize;

    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(content) {
        let value = serde_json::Value::deserialize(deserializer)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Server-side apply one manifest to the cluster
async fn apply_manifest(client: &Client, manifest: &serde_json::Value) -> Result<()> {
    let kind = manifest
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::component("manifest-applier", "manifest missing kind"))?;
    let api_version = manifest
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::component("manifest-applier", "manifest missing apiVersion"))?;
    let name = manifest
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::component("manifest-applier", "manifest missing metadata.name"))?;
    let namespace = manifest.pointer("/metadata/namespace").and_then(|v| v.as_str());

    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let gvk = kube::api::GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    };
    let api_resource = ApiResource::from_gvk(&gvk);

    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &api_resource),
        None => Api::all_with(client.clone(), &api_resource),
    };

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &params, &Patch::Apply(manifest)).await?;

    debug!(kind = kind, name = name, "applied manifest");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_documents_splits_and_drops_empties() {
        let content = "kind: A\n---\n\n---\nkind: B\n";
        let documents = parse_documents(content).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["kind"], "A");
        assert_eq!(documents[1]["kind"], "B");
    }

    #[test]
    fn test_parse_documents_rejects_broken_yaml() {
        assert!(parse_documents("kind: [unclosed").is_err());
    }

    #[test]
    fn test_collect_changed_tracks_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let addon_dir = dir.path().join("coredns");
        std::fs::create_dir_all(&addon_dir).unwrap();
        let file = addon_dir.join("coredns.yaml");
        std::fs::write(&file, "kind: Deployment\n").unwrap();
        // Temp files and non-yaml are ignored
        std::fs::write(addon_dir.join(".coredns.yaml.tmp"), "x").unwrap();
        std::fs::write(addon_dir.join("notes.txt"), "x").unwrap();

        let mut seen = HashMap::new();
        assert_eq!(collect_changed(dir.path(), &mut seen), vec![file.clone()]);

        // Unchanged on the second pass
        assert!(collect_changed(dir.path(), &mut seen).is_empty());

        // Touching the file surfaces it again
        let later = SystemTime::now() + Duration::from_secs(10);
        let f = std::fs::File::options().append(true).open(&file).unwrap();
        f.set_modified(later).unwrap();
        assert_eq!(collect_changed(dir.path(), &mut seen), vec![file]);
    }

    #[tokio::test]
    async fn test_lifecycle_without_api_server() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path());

        let mut applier = ApplierManager::new(paths.clone());
        applier.init().await.unwrap();
        assert!(paths.manifests_dir().exists());

        // Runs and stops cleanly with no API server anywhere in sight
        applier.run().await.unwrap();
        applier.stop().await.unwrap();
    }
}
