//! Drives one validation run from request to terminal status.
//!
//! Phases run strictly in order: workspace, clone, branch checkout, patch,
//! sandbox, the static-check attempt loop (with fixer-assisted retries),
//! optional dynamic execution, then commit and push. Whatever happens, the
//! sandbox and workspace are torn down before the terminal status is
//! published, and the callback (if any) fires after that.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tracing::Instrument;

use super::callback::{CallbackClient, CallbackPayload};
use super::engine::ExecutionEngine;
use super::fixer::{FixRequest, Fixer, LlmFixer};
use super::metrics::RunnerMetrics;
use super::models::{RunResult, RunStatus, ValidationRequest, ValidationRun, truncate_chars};
use super::registry::{InMemoryRunStore, RunRecord, RunStore};
use super::repo::{GitCli, SourceControl};
use super::sandbox::{DockerSandbox, Language, SandboxHandle, SandboxProvider};
use super::static_check::StaticValidator;
use super::workspace::{Workspace, WorkspaceManager};
use crate::config::RunnerConfig;
use crate::errors::RunnerError;

/// Resources a run has acquired so far; released on every exit path.
#[derive(Default)]
struct RunResources {
    workspace: Option<Workspace>,
    sandbox: Option<SandboxHandle>,
}

/// How the attempt loop ended.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LoopOutcome {
    Passed,
    Exhausted,
    FixerGaveUp,
}

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    sandbox: Arc<dyn SandboxProvider>,
    repo: Arc<dyn SourceControl>,
    fixer: Arc<dyn Fixer>,
    workspaces: WorkspaceManager,
    metrics: Arc<RunnerMetrics>,
    callback: CallbackClient,
    max_attempts: u32,
    exec_timeout: Duration,
    run_log_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        config: &RunnerConfig,
        sandbox: Arc<dyn SandboxProvider>,
        repo: Arc<dyn SourceControl>,
        fixer: Arc<dyn Fixer>,
    ) -> Self {
        Self {
            store: Arc::new(InMemoryRunStore::new()),
            sandbox,
            repo,
            fixer,
            workspaces: WorkspaceManager::new(&config.workspace_root),
            metrics: Arc::new(RunnerMetrics::new()),
            callback: CallbackClient::new(config.callback_api_key.clone()),
            max_attempts: config.max_attempts.max(1),
            exec_timeout: Duration::from_secs(config.exec_timeout_secs),
            run_log_dir: config.run_log_dir.clone(),
        }
    }

    /// Wire up the production collaborators: Docker, the git CLI and the
    /// LLM gateway.
    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        let sandbox = DockerSandbox::connect(config.sandbox.clone())
            .context("Failed to connect to the Docker daemon")?;
        let fixer =
            LlmFixer::new(config.llm.clone()).context("Failed to build the LLM gateway client")?;
        Ok(Self::new(
            config,
            Arc::new(sandbox),
            Arc::new(GitCli::new(config.git_identity.clone())),
            Arc::new(fixer),
        ))
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<RunnerMetrics> {
        &self.metrics
    }

    /// Validate and register a request as a new pending run.
    pub fn submit(&self, request: ValidationRequest) -> Result<Arc<RunRecord>, RunnerError> {
        request.validate().map_err(RunnerError::InvalidRequest)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let branch = request.branch.clone();
        let repo_id = request.repo_id.clone();
        let mut record = RunRecord::new(ValidationRun::new(run_id, request));
        if let Some(dir) = &self.run_log_dir {
            record = record.with_log_file(dir);
        }
        let record = Arc::new(record);
        self.store.insert(Arc::clone(&record));
        self.metrics.record_started();
        record.info(format!(
            "Validation triggered for repo: {} on branch '{}'",
            repo_id, branch
        ));
        Ok(record)
    }

    /// Submit a request and drive it on a background task.
    pub fn start(self: &Arc<Self>, request: ValidationRequest) -> Result<Arc<RunRecord>, RunnerError> {
        let record = self.submit(request)?;
        let span = tracing::info_span!("validation", run_id = %record.run_id());
        let this = Arc::clone(self);
        let task_record = Arc::clone(&record);
        tokio::spawn(async move { this.run(task_record).await }.instrument(span));
        Ok(record)
    }

    /// Drive a submitted run to its terminal status.
    pub async fn run(&self, record: Arc<RunRecord>) -> RunStatus {
        record.start();
        let mut resources = RunResources::default();

        let outcome = AssertUnwindSafe(self.drive(&record, &mut resources))
            .catch_unwind()
            .await;

        let (status, result) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                record.error(format!("Exception occurred: {}", e));
                (RunStatus::Error, error_result(&record, e.to_string()))
            }
            Err(panic) => {
                let message = format!("Internal error: {}", panic_message(panic.as_ref()));
                record.error(&message);
                (RunStatus::Error, error_result(&record, message))
            }
        };

        record.set_progress("Cleaning up");
        self.release(&record, resources).await;

        record.info(format!("Validation complete: {}", status.as_str()));
        if record.finish(status, result) {
            self.metrics.record_finished(status == RunStatus::Completed);
        }

        self.send_callback(&record).await;
        status
    }

    async fn drive(
        &self,
        record: &RunRecord,
        resources: &mut RunResources,
    ) -> Result<(RunStatus, RunResult), RunnerError> {
        let (run_id, request) = record.read(|run| (run.run_id.clone(), run.request.clone()));
        let branch = request.branch.clone();

        record.set_progress("Setting up workspace");
        let workspace = self.workspaces.create(&run_id).await?;
        record.update(|run| run.workspace = Some(workspace.path().to_path_buf()));
        record.info(format!("Workspace created: {}", workspace.path().display()));
        let repo_path = workspace.repo_path();
        let workspace = resources.workspace.insert(workspace);

        record.set_progress("Cloning repository");
        record.debug(format!(
            "Cloning repository: {} (branch: {})",
            request.repo_url, branch
        ));
        self.repo
            .clone_repo(&request.clone_url(), &repo_path, &branch)
            .await?;
        record.info(format!("Repository cloned to {}", repo_path.display()));

        if branch != "main" {
            record.set_progress(format!("Checking out branch: {}", branch));
            if let Err(e) = self.repo.checkout_branch(&repo_path, &branch).await {
                record.error(format!("Failed to checkout branch {}: {}", branch, e));
                return Ok((
                    RunStatus::Error,
                    RunResult {
                        success: false,
                        error: Some(format!(
                            "Branch '{}' not found or checkout failed",
                            branch
                        )),
                        ..Default::default()
                    },
                ));
            }
            record.info(format!("Successfully checked out branch: {}", branch));
        }

        record.set_progress("Applying patch");
        self.repo.apply_patch(&repo_path, &request.patch).await?;
        record.info("Patch applied successfully");

        let language = Language::detect(&repo_path);
        record.info(format!("Detected language: {}", language));
        record.set_progress(format!("Creating {} sandbox", language));
        let sandbox = self.sandbox.create(language, workspace).await?;
        record.update(|run| run.sandbox_id = Some(sandbox.id.clone()));
        record.info(format!(
            "Sandbox created: {} ({})",
            sandbox.short_id(),
            sandbox.image
        ));
        let sandbox = resources.sandbox.insert(sandbox);

        let outcome = self
            .attempt_loop(record, &request, sandbox, &repo_path)
            .await;
        let (attempts, errors) = record.read(|run| (run.attempts, run.errors.clone()));

        if outcome != LoopOutcome::Passed {
            return Ok((
                RunStatus::Failed,
                RunResult {
                    success: false,
                    attempts,
                    errors,
                    ..Default::default()
                },
            ));
        }

        let mut execution = None;
        if let Some(config) = request.execution.as_ref().filter(|c| c.is_active()) {
            record.set_progress("Running execution validation");
            record.info(format!("Execution strategy: {}", config.strategy.kind()));
            let result = ExecutionEngine::new(self.sandbox.as_ref(), sandbox)
                .execute(config)
                .await;
            if !result.success {
                record.error(format!(
                    "Execution failed: {}",
                    result.error.as_deref().unwrap_or("success criteria not met")
                ));
                return Ok((
                    RunStatus::Failed,
                    RunResult {
                        success: false,
                        attempts,
                        errors,
                        execution: Some(result),
                        ..Default::default()
                    },
                ));
            }
            record.info("Execution validation passed");
            execution = Some(result);
        } else if request.execution.is_some() {
            record.info("Execution disabled");
        }

        record.set_progress("Committing changes");
        let commit = self
            .repo
            .commit(&repo_path, &request.commit_message)
            .await?;
        record.info(format!("Changes committed: {}", &commit[..commit.len().min(8)]));

        record.set_progress("Pushing to origin");
        if let Err(e) = self.repo.push(&repo_path, &branch).await {
            record.error(e.to_string());
            return Ok((
                RunStatus::Error,
                RunResult {
                    success: false,
                    commit: Some(commit),
                    branch: Some(branch),
                    attempts,
                    errors,
                    error: Some(e.to_string()),
                    execution,
                },
            ));
        }
        record.info("Changes pushed to origin");

        Ok((
            RunStatus::Completed,
            RunResult {
                success: true,
                commit: Some(commit),
                branch: Some(branch),
                attempts,
                errors,
                error: None,
                execution,
            },
        ))
    }

    async fn attempt_loop(
        &self,
        record: &RunRecord,
        request: &ValidationRequest,
        sandbox: &SandboxHandle,
        repo_path: &Path,
    ) -> LoopOutcome {
        let validator = StaticValidator::new(self.sandbox.as_ref(), sandbox, self.exec_timeout);

        for attempt in 1..=self.max_attempts {
            record.update(|run| run.attempts = attempt);
            record.set_progress(format!(
                "Validation attempt {}/{}",
                attempt, self.max_attempts
            ));

            let error = match validator.validate(attempt).await {
                Ok(()) => {
                    record.info("Validation passed");
                    return LoopOutcome::Passed;
                }
                Err(error) => error,
            };

            record.error(format!(
                "Validation failed at {:?} step: {}",
                error.step,
                truncate_chars(&error.message, 200)
            ));
            record.update(|run| run.errors.push(error.clone()));

            if attempt == self.max_attempts {
                record.warn("Max attempts reached");
                return LoopOutcome::Exhausted;
            }

            record.set_progress("Asking LLM to fix error");
            let fix = self
                .fixer
                .fix(FixRequest {
                    error_message: &error.message,
                    original_patch: &request.patch,
                    repo_path,
                })
                .await;
            self.metrics.record_fix_attempt(fix.is_ok());

            let corrected = match fix {
                Ok(patch) => patch,
                Err(e) => {
                    record.error(format!("LLM failed to generate fix: {}", e));
                    return LoopOutcome::FixerGaveUp;
                }
            };
            record.info("LLM generated corrected patch");

            record.set_progress("Applying LLM-corrected patch");
            record.debug("Resetting repository to clean state");
            self.repo.reset(repo_path).await;
            if let Err(e) = self.repo.apply_patch(repo_path, &corrected).await {
                record.error(format!("Corrected patch rejected: {}", e));
                return LoopOutcome::FixerGaveUp;
            }
        }
        LoopOutcome::Exhausted
    }

    /// Tear down the sandbox, then the workspace. Failures are logged only.
    async fn release(&self, record: &RunRecord, resources: RunResources) {
        if let Some(sandbox) = resources.sandbox {
            match self.sandbox.destroy(&sandbox).await {
                Ok(()) => record.info(format!("Sandbox cleaned up: {}", sandbox.short_id())),
                Err(e) => record.warn(format!(
                    "Failed to cleanup sandbox {}: {}",
                    sandbox.short_id(),
                    e
                )),
            }
        }
        if let Some(workspace) = resources.workspace {
            match self.workspaces.destroy(&workspace).await {
                Ok(()) => record.info(format!(
                    "Workspace cleaned up: {}",
                    workspace.path().display()
                )),
                Err(e) => record.warn(format!("Failed to cleanup workspace: {}", e)),
            }
        }
    }

    async fn send_callback(&self, record: &RunRecord) {
        let (url, run_id, repo_id, status, result) = record.read(|run| {
            (
                run.request.callback_url.clone(),
                run.run_id.clone(),
                run.request.repo_id.clone(),
                run.status,
                run.result.clone(),
            )
        });
        let Some(url) = url else {
            return;
        };

        let payload = CallbackPayload {
            run_id: &run_id,
            repo_id: &repo_id,
            status,
            result: result.as_ref(),
        };
        match self.callback.send(&url, &payload).await {
            Ok(()) => record.debug("Callback sent successfully"),
            Err(e) => record.warn(format!("Callback failed: {}", e)),
        }
    }
}

fn error_result(record: &RunRecord, error: String) -> RunResult {
    record.read(|run| RunResult {
        success: false,
        attempts: run.attempts,
        errors: run.errors.clone(),
        error: Some(error),
        ..Default::default()
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
