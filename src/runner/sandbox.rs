use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ExecConfig, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::{StreamExt, TryStreamExt};

use super::workspace::Workspace;
use crate::config::SandboxConfig;
use crate::errors::RunnerError;

/// Primary language of a repository, as far as sandbox selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    Java,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Java => "java",
        }
    }

    /// First marker file wins; repositories with no marker are treated as Python.
    pub fn detect(repo_path: &Path) -> Self {
        const MARKERS: &[(&str, Language)] = &[
            ("package.json", Language::JavaScript),
            ("requirements.txt", Language::Python),
            ("setup.py", Language::Python),
            ("pom.xml", Language::Java),
        ];
        MARKERS
            .iter()
            .find(|(file, _)| repo_path.join(file).exists())
            .map(|(_, lang)| *lang)
            .unwrap_or(Language::Python)
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Python => "python:3.11-slim",
            Self::JavaScript => "node:18-alpine",
            Self::Java => "openjdk:17-slim",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::JavaScript),
            "java" => Ok(Self::Java),
            _ => Err(format!("Unknown language: {}", s)),
        }
    }
}

/// A running sandbox owned by exactly one validation run.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxHandle {
    pub id: String,
    pub image: String,
    pub language: Language,
    /// Default working directory of commands: the repository checkout.
    pub workdir: String,
}

impl SandboxHandle {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Resolve a user-supplied working directory against the checkout.
    pub fn resolve_dir(&self, dir: &str) -> String {
        if dir.starts_with('/') {
            dir.to_string()
        } else {
            format!("{}/{}", self.workdir.trim_end_matches('/'), dir)
        }
    }
}

/// Per-command options for execution inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    /// Absolute path inside the sandbox; defaults to the repository checkout.
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// A process started in the background inside a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedExec {
    pub id: String,
}

/// Creates and drives isolated execution environments.
/// Real implementation: `DockerSandbox`. Test double: `testing::FakeSandbox`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(
        &self,
        language: Language,
        workspace: &Workspace,
    ) -> Result<SandboxHandle, RunnerError>;

    /// Run `command` through `sh -c` and wait for it to finish.
    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, RunnerError>;

    /// Start `command` through `sh -c` without waiting for it.
    async fn exec_detached(
        &self,
        sandbox: &SandboxHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<DetachedExec, RunnerError>;

    async fn is_running(
        &self,
        sandbox: &SandboxHandle,
        exec: &DetachedExec,
    ) -> Result<bool, RunnerError>;

    /// Stop then remove. Removing a sandbox that is already gone succeeds.
    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<(), RunnerError>;
}

/// `SandboxProvider` backed by the local Docker daemon.
pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    pub fn connect(config: SandboxConfig) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| RunnerError::Sandbox {
            operation: "connect",
            message: e.to_string(),
        })?;
        Ok(Self { docker, config })
    }

    fn image_for(&self, language: Language) -> String {
        image_for(&self.config, language)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BollardError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        tracing::info!(image = %image, "Pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn remove_if_exists(&self, name: &str) -> Result<(), BollardError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub fn image_for(config: &SandboxConfig, language: Language) -> String {
    config
        .images
        .get(language.as_str())
        .cloned()
        .unwrap_or_else(|| language.default_image().to_string())
}

pub fn container_name(run_id: &str) -> String {
    format!("patch-runner-{}", run_id)
}

/// Container definition for a run: idle process, workspace mounted
/// read/write, no network, memory capped.
pub fn container_body(
    config: &SandboxConfig,
    image: &str,
    workspace: &Workspace,
) -> ContainerCreateBody {
    let mount = config.mount_point.trim_end_matches('/');
    let (bind, working_dir) = match &config.workspace_volume {
        Some(volume) => (
            format!("{}:{}:rw", volume, mount),
            format!("{}/{}/repo", mount, workspace.run_id()),
        ),
        None => (
            format!("{}:{}:rw", workspace.path().display(), mount),
            format!("{}/repo", mount),
        ),
    };

    ContainerCreateBody {
        image: Some(image.to_string()),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        working_dir: Some(working_dir),
        labels: Some(HashMap::from([(
            "patch-runner.run-id".to_string(),
            workspace.run_id().to_string(),
        )])),
        host_config: Some(HostConfig {
            binds: Some(vec![bind]),
            network_mode: Some(config.network_mode.clone()),
            memory: Some(config.memory_bytes()),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

fn exec_config(command: &str, opts: &ExecOptions, attach: bool) -> ExecConfig {
    let env: Vec<String> = opts
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    ExecConfig {
        cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
        env: (!env.is_empty()).then_some(env),
        working_dir: opts.working_dir.clone(),
        attach_stdout: Some(attach),
        attach_stderr: Some(attach),
        ..ExecConfig::default()
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn sandbox_error(operation: &'static str) -> impl Fn(BollardError) -> RunnerError {
    move |e| RunnerError::Sandbox {
        operation,
        message: e.to_string(),
    }
}

fn command_label(command: &str) -> String {
    command.chars().take(80).collect()
}

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn create(
        &self,
        language: Language,
        workspace: &Workspace,
    ) -> Result<SandboxHandle, RunnerError> {
        let image = self.image_for(language);
        let name = container_name(workspace.run_id());
        let creation_error = |e: BollardError| RunnerError::SandboxCreation {
            image: image.clone(),
            message: e.to_string(),
        };

        self.ensure_image(&image).await.map_err(creation_error)?;
        self.remove_if_exists(&name).await.map_err(creation_error)?;

        let body = container_body(&self.config, &image, workspace);
        let workdir = body.working_dir.clone().unwrap_or_default();
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(creation_error)?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            let _ = self.remove_if_exists(&created.id).await;
            return Err(creation_error(e));
        }

        Ok(SandboxHandle {
            id: created.id,
            image,
            language,
            workdir,
        })
    }

    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput, RunnerError> {
        let exec = self
            .docker
            .create_exec(&sandbox.id, exec_config(command, opts, true))
            .await
            .map_err(sandbox_error("create_exec"))?;

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None::<StartExecOptions>)
                .await
                .map_err(sandbox_error("start_exec"))?
            {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(sandbox_error("exec_output"))? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        _ => {}
                    }
                }
            }
            Ok::<_, RunnerError>((stdout, stderr))
        };

        let (stdout, stderr) = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.map_err(|_| {
                RunnerError::Timeout {
                    command: command_label(command),
                    secs: limit.as_secs(),
                }
            })??,
            None => collect.await?,
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(sandbox_error("inspect_exec"))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn exec_detached(
        &self,
        sandbox: &SandboxHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<DetachedExec, RunnerError> {
        let exec = self
            .docker
            .create_exec(&sandbox.id, exec_config(command, opts, false))
            .await
            .map_err(sandbox_error("create_exec"))?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(sandbox_error("start_exec"))?;
        Ok(DetachedExec { id: exec.id })
    }

    async fn is_running(
        &self,
        _sandbox: &SandboxHandle,
        exec: &DetachedExec,
    ) -> Result<bool, RunnerError> {
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(sandbox_error("inspect_exec"))?;
        Ok(inspect.running.unwrap_or(false))
    }

    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<(), RunnerError> {
        if let Err(e) = self
            .docker
            .stop_container(
                &sandbox.id,
                Some(
                    StopContainerOptionsBuilder::new()
                        .t(self.config.stop_grace_secs)
                        .build(),
                ),
            )
            .await
            && !is_not_found(&e)
        {
            tracing::debug!(sandbox = %sandbox.short_id(), error = %e, "stop_container failed, forcing removal");
        }
        self.remove_if_exists(&sandbox.id)
            .await
            .map_err(sandbox_error("remove_container"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::workspace::WorkspaceManager;
    use std::fs;

    #[test]
    fn test_detect_language_by_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Language::detect(dir.path()), Language::Python);

        fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
        assert_eq!(Language::detect(dir.path()), Language::Java);

        fs::write(dir.path().join("setup.py"), "").unwrap();
        assert_eq!(Language::detect(dir.path()), Language::Python);

        fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(Language::detect(dir.path()), Language::JavaScript);
    }

    #[test]
    fn test_language_round_trips_through_str() {
        for lang in [Language::Python, Language::JavaScript, Language::Java] {
            assert_eq!(lang.as_str().parse::<Language>().unwrap(), lang);
        }
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_image_table_and_overrides() {
        let mut config = SandboxConfig::default();
        assert_eq!(image_for(&config, Language::Python), "python:3.11-slim");
        assert_eq!(image_for(&config, Language::JavaScript), "node:18-alpine");
        assert_eq!(image_for(&config, Language::Java), "openjdk:17-slim");

        config
            .images
            .insert("python".into(), "python:3.12-slim".into());
        assert_eq!(image_for(&config, Language::Python), "python:3.12-slim");
        assert_eq!(image_for(&config, Language::Java), "openjdk:17-slim");
    }

    #[tokio::test]
    async fn test_container_body_isolates_the_run() {
        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).create("run-9").await.unwrap();
        let config = SandboxConfig::default();

        let body = container_body(&config, "python:3.11-slim", &ws);
        assert_eq!(body.image.as_deref(), Some("python:3.11-slim"));
        assert_eq!(body.working_dir.as_deref(), Some("/workspace/repo"));
        let host = body.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(
            host.binds.unwrap(),
            vec![format!("{}:/workspace:rw", ws.path().display())]
        );
    }

    #[tokio::test]
    async fn test_container_body_keeps_ceiling_for_bad_memory_setting() {
        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).create("run-8").await.unwrap();
        let config = SandboxConfig {
            memory: "2 gigs".into(),
            ..SandboxConfig::default()
        };

        let host = container_body(&config, "python:3.11-slim", &ws)
            .host_config
            .unwrap();
        assert_eq!(host.memory, Some(2 * 1024 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_container_body_with_named_volume() {
        let root = tempfile::tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).create("run-7").await.unwrap();
        let config = SandboxConfig {
            workspace_volume: Some("runner_workspace".into()),
            ..SandboxConfig::default()
        };

        let body = container_body(&config, "node:18-alpine", &ws);
        assert_eq!(body.working_dir.as_deref(), Some("/workspace/run-7/repo"));
        assert_eq!(
            body.host_config.unwrap().binds.unwrap(),
            vec!["runner_workspace:/workspace:rw".to_string()]
        );
    }

    #[test]
    fn test_exec_config_wraps_command_in_shell() {
        let opts = ExecOptions {
            env: HashMap::from([("MODE".to_string(), "test".to_string())]),
            working_dir: Some("/workspace/repo/src".into()),
            timeout: None,
        };
        let config = exec_config("echo hi && false", &opts, true);
        assert_eq!(
            config.cmd.unwrap(),
            vec!["sh", "-c", "echo hi && false"]
        );
        assert_eq!(config.env.unwrap(), vec!["MODE=test"]);
        assert_eq!(config.working_dir.as_deref(), Some("/workspace/repo/src"));
        assert_eq!(config.attach_stdout, Some(true));
    }

    #[test]
    fn test_exec_output_combined() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "out".into(),
            stderr: "err".into(),
        };
        assert_eq!(out.combined(), "out\nerr");
        assert_eq!(ExecOutput::default().combined(), "");
    }

    #[test]
    fn test_resolve_dir_against_checkout() {
        let handle = SandboxHandle {
            id: "0123456789abcdef".into(),
            image: "python:3.11-slim".into(),
            language: Language::Python,
            workdir: "/workspace/repo".into(),
        };
        assert_eq!(handle.short_id(), "0123456789ab");
        assert_eq!(handle.resolve_dir("src"), "/workspace/repo/src");
        assert_eq!(handle.resolve_dir("/opt/app"), "/opt/app");
    }

    #[test]
    fn test_container_name_is_deterministic() {
        assert_eq!(container_name("abc"), "patch-runner-abc");
    }
}
