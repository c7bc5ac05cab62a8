use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::models::redact_credentials;
use crate::config::GitIdentity;
use crate::errors::RunnerError;

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Version-control operations a validation run needs.
/// Real implementation: `GitCli`. Test double: `testing::FakeSourceControl`.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Shallow, single-branch clone of `branch` into `target`.
    async fn clone_repo(&self, url: &str, target: &Path, branch: &str) -> Result<(), RunnerError>;

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<(), RunnerError>;

    /// Apply a unified diff. A patch that fails the dry run never touches
    /// the working tree.
    async fn apply_patch(&self, repo: &Path, patch: &str) -> Result<(), RunnerError>;

    /// Hard reset and clean. Best-effort: failures are logged, not returned.
    async fn reset(&self, repo: &Path);

    /// Stage everything and commit. Returns the new commit hash.
    async fn commit(&self, repo: &Path, message: &str) -> Result<String, RunnerError>;

    async fn push(&self, repo: &Path, branch: &str) -> Result<(), RunnerError>;
}

#[derive(Debug)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// `SourceControl` backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_cmd: String,
    identity: GitIdentity,
}

impl GitCli {
    pub fn new(identity: GitIdentity) -> Self {
        Self {
            git_cmd: std::env::var("GIT_CMD").unwrap_or_else(|_| "git".to_string()),
            identity,
        }
    }

    async fn git(
        &self,
        cwd: Option<&Path>,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, RunnerError> {
        let label = format!("git {}", args.first().copied().unwrap_or_default());
        let mut cmd = tokio::process::Command::new(&self.git_cmd);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| RunnerError::Spawn {
                command: label.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RunnerError::Timeout {
                    command: label,
                    secs: timeout.as_secs(),
                });
            }
        };

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: redact_credentials(String::from_utf8_lossy(&output.stderr).trim()),
        })
    }
}

/// Temporary patch file inside the repository, removed when dropped.
struct PatchFile {
    path: PathBuf,
}

impl PatchFile {
    async fn write(repo: &Path, patch: &str) -> Result<Self, RunnerError> {
        let path = repo.join(format!(".patch-runner-{}.patch", uuid::Uuid::new_v4()));
        let mut contents = patch.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| RunnerError::PatchApply(format!("failed to write patch file: {}", e)))?;
        Ok(Self { path })
    }

    fn as_arg(&self) -> String {
        self.path.to_string_lossy().to_string()
    }
}

impl Drop for PatchFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(&self, url: &str, target: &Path, branch: &str) -> Result<(), RunnerError> {
        let target_arg = target.to_string_lossy().to_string();
        let args = [
            "clone",
            "--depth",
            "1",
            "--branch",
            branch,
            "--single-branch",
            url,
            target_arg.as_str(),
        ];
        let output = self.git(None, &args, CLONE_TIMEOUT).await.map_err(|e| match e {
            RunnerError::Timeout { secs, .. } => {
                RunnerError::Clone(format!("timed out after {}s", secs))
            }
            other => RunnerError::Clone(other.to_string()),
        })?;
        if !output.success {
            return Err(RunnerError::Clone(output.stderr));
        }
        Ok(())
    }

    async fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<(), RunnerError> {
        let to_checkout_error = |message: String| RunnerError::Checkout {
            branch: branch.to_string(),
            message,
        };

        let fetch = self
            .git(Some(repo), &["fetch", "origin", branch], CLONE_TIMEOUT)
            .await
            .map_err(|e| to_checkout_error(e.to_string()))?;
        if !fetch.success {
            return Err(to_checkout_error(fetch.stderr));
        }

        let checkout = self
            .git(Some(repo), &["checkout", branch], LOCAL_TIMEOUT)
            .await
            .map_err(|e| to_checkout_error(e.to_string()))?;
        if !checkout.success {
            return Err(to_checkout_error(checkout.stderr));
        }
        Ok(())
    }

    async fn apply_patch(&self, repo: &Path, patch: &str) -> Result<(), RunnerError> {
        let patch_file = PatchFile::write(repo, patch).await?;
        let arg = patch_file.as_arg();

        let check = self
            .git(Some(repo), &["apply", "--check", &arg], LOCAL_TIMEOUT)
            .await?;
        if !check.success {
            return Err(RunnerError::PatchApply(check.stderr));
        }

        let apply = self.git(Some(repo), &["apply", &arg], LOCAL_TIMEOUT).await?;
        if !apply.success {
            return Err(RunnerError::PatchApply(apply.stderr));
        }
        Ok(())
    }

    async fn reset(&self, repo: &Path) {
        for args in [&["reset", "--hard", "HEAD"][..], &["clean", "-fd"][..]] {
            match self.git(Some(repo), args, LOCAL_TIMEOUT).await {
                Ok(out) if out.success => {}
                Ok(out) => tracing::warn!(command = ?args, stderr = %out.stderr, "git reset step failed"),
                Err(e) => tracing::warn!(command = ?args, error = %e, "git reset step failed"),
            }
        }
    }

    async fn commit(&self, repo: &Path, message: &str) -> Result<String, RunnerError> {
        let commit_err = |e: RunnerError| RunnerError::Commit(e.to_string());

        for (key, value) in [
            ("user.name", self.identity.name.as_str()),
            ("user.email", self.identity.email.as_str()),
        ] {
            self.git(Some(repo), &["config", key, value], LOCAL_TIMEOUT)
                .await
                .map_err(commit_err)?;
        }

        let add = self
            .git(Some(repo), &["add", "-A"], LOCAL_TIMEOUT)
            .await
            .map_err(commit_err)?;
        if !add.success {
            return Err(RunnerError::Commit(add.stderr));
        }

        let status = self
            .git(Some(repo), &["status", "--porcelain"], LOCAL_TIMEOUT)
            .await
            .map_err(commit_err)?;
        if status.success && status.stdout.is_empty() {
            return Err(RunnerError::Commit("nothing to commit".to_string()));
        }

        let commit = self
            .git(Some(repo), &["commit", "-m", message], LOCAL_TIMEOUT)
            .await
            .map_err(commit_err)?;
        if !commit.success {
            let detail = if commit.stderr.is_empty() {
                commit.stdout
            } else {
                commit.stderr
            };
            return Err(RunnerError::Commit(detail));
        }

        let head = self
            .git(Some(repo), &["rev-parse", "HEAD"], LOCAL_TIMEOUT)
            .await
            .map_err(commit_err)?;
        if !head.success || head.stdout.is_empty() {
            return Err(RunnerError::Commit(format!(
                "could not resolve HEAD: {}",
                head.stderr
            )));
        }
        Ok(head.stdout)
    }

    async fn push(&self, repo: &Path, branch: &str) -> Result<(), RunnerError> {
        let output = self
            .git(Some(repo), &["push", "origin", branch], PUSH_TIMEOUT)
            .await
            .map_err(|e| match e {
                RunnerError::Timeout { secs, .. } => {
                    RunnerError::Push(format!("timed out after {}s", secs))
                }
                other => RunnerError::Push(other.to_string()),
            })?;
        if !output.success {
            return Err(RunnerError::Push(output.stderr));
        }
        Ok(())
    }
}
