//! Manifest output directory handling for add-on reconcilers
//!
//! Each reconciler owns one subdirectory of the stack manifest directory;
//! whatever it writes there is picked up and applied by the manifest
//! applier bridge.

use std::path::{Path, PathBuf};

/// Writes one add-on's rendered manifests into its own subdirectory
#[derive(Clone, Debug)]
pub struct ManifestsSaver {
    dir: PathBuf,
}

impl ManifestsSaver {
    /// Create the saver, creating the add-on's subdirectory
    ///
    /// Directory creation is the reconciler-construction failure point: an
    /// unwritable manifest dir degrades that one add-on, not the node.
    pub fn new(manifests_dir: &Path, addon: &str) -> std::io::Result<Self> {
        let dir = manifests_dir.join(addon);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory this saver writes into
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one manifest file, replacing any previous content atomically
    pub async fn save(&self, file: &str, content: &str) -> std::io::Result<()> {
        let target = self.dir.join(file);
        let tmp = self.dir.join(format!(".{file}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_writes_into_addon_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let saver = ManifestsSaver::new(dir.path(), "coredns").unwrap();

        saver.save("coredns.yaml", "kind: Deployment\n").await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("coredns/coredns.yaml")).unwrap();
        assert_eq!(written, "kind: Deployment\n");
        assert!(!dir.path().join("coredns/.coredns.yaml.tmp").exists());
    }

    #[test]
    fn test_new_fails_on_unwritable_parent() {
        assert!(ManifestsSaver::new(Path::new("/proc/definitely/not/writable"), "x").is_err());
    }
}
