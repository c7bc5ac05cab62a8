use std::path::{Path, PathBuf};

use crate::errors::RunnerError;

/// A run-exclusive directory under the workspace root.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    run_id: String,
    path: PathBuf,
}

impl Workspace {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the repository is cloned inside the workspace.
    pub fn repo_path(&self) -> PathBuf {
        self.path.join("repo")
    }
}

/// Allocates and removes per-run workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic workspace path for a run.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Create a fresh, empty directory for `run_id`.
    pub async fn create(&self, run_id: &str) -> Result<Workspace, RunnerError> {
        let path = self.path_for(run_id);
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(RunnerError::Workspace {
                path,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "run id is not a plain directory name",
                ),
            });
        }

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|source| RunnerError::Workspace {
                    path: path.clone(),
                    source,
                })?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| RunnerError::Workspace {
                path: path.clone(),
                source,
            })?;

        Ok(Workspace {
            run_id: run_id.to_string(),
            path,
        })
    }

    /// Recursively remove a workspace. Callers treat failure as non-fatal.
    pub async fn destroy(&self, workspace: &Workspace) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
