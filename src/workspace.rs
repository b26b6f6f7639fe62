use std::path::{Path, PathBuf};

use stacked_errors::{Result, StackableErr};
use tokio::fs;
use uuid::Uuid;

use crate::acquire_dir_path;

/// The orchestrator-owned scoped temporary directory. Created with fixed
/// children at [Workspace::create] and removed at the end of the build unless
/// `preserve` is set, matching `BuildConfig::preserve_working_dir`.
///
/// Deliberately does not use the `tempfile` crate; directories are created
/// and removed explicitly the same way the rest of this crate manages paths
/// with `acquire_dir_path` and plain `tokio::fs` calls.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Creates a fresh workspace rooted under `parent` (or `std::env::temp_dir()`
    /// if `None`), with the fixed children every strategy expects to find.
    pub async fn create(parent: Option<&Path>) -> Result<Self> {
        let mut root = parent.map(Path::to_owned).unwrap_or_else(std::env::temp_dir);
        root.push(format!("s2i-{}", Uuid::new_v4()));
        fs::create_dir_all(&root)
            .await
            .stack_err_with(|| format!("Workspace::create({root:?})"))?;

        let ws = Self { root };
        for child in [
            "upload/src",
            "upload/scripts",
            "downloaded-scripts",
            "defaultScripts",
            "artifacts",
            "tmp",
        ] {
            fs::create_dir_all(ws.root.join(child))
                .await
                .stack_err_with(|| format!("Workspace::create child {child:?}"))?;
        }
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upload_src(&self) -> PathBuf {
        self.root.join("upload/src")
    }

    pub fn upload_scripts(&self) -> PathBuf {
        self.root.join("upload/scripts")
    }

    pub fn downloaded_scripts(&self) -> PathBuf {
        self.root.join("downloaded-scripts")
    }

    pub fn artifacts(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Removes the entire workspace tree. Called by the orchestrator on
    /// success, or on failure when `preserve` was not requested.
    pub async fn remove(self) -> Result<()> {
        // re-acquire to surface a clear error if it was already removed/moved
        let root = acquire_dir_path(&self.root)
            .await
            .stack_err("Workspace::remove")?;
        fs::remove_dir_all(root)
            .await
            .stack_err("Workspace::remove")
    }
}
