//! In-memory doubles for the runner's external collaborators.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::fixer::{FixRequest, Fixer};
use super::repo::SourceControl;
use super::sandbox::{
    DetachedExec, ExecOptions, ExecOutput, Language, SandboxHandle, SandboxProvider,
};
use super::workspace::Workspace;
use crate::errors::{FixerError, RunnerError};

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_http(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[derive(Debug, Clone)]
pub enum FakeExec {
    Output(ExecOutput),
    Fail(String),
    Panic,
}

struct ExecRule {
    pattern: String,
    /// Played in order; the last entry repeats.
    outputs: VecDeque<FakeExec>,
}

/// Sandbox that answers commands from scripted rules instead of a container.
///
/// The first rule whose pattern occurs in the command answers it; commands
/// with no matching rule succeed with empty output.
#[derive(Default)]
pub struct FakeSandbox {
    rules: Mutex<Vec<ExecRule>>,
    calls: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
    live: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    created: AtomicUsize,
    create_error: Option<String>,
    detached_running: bool,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self {
            detached_running: true,
            ..Default::default()
        }
    }

    pub fn failing_create(message: &str) -> Self {
        Self {
            create_error: Some(message.to_string()),
            ..Self::new()
        }
    }

    /// Detached processes report as exited when inspected.
    pub fn with_exited_processes(mut self) -> Self {
        self.detached_running = false;
        self
    }

    fn push(&self, pattern: &str, exec: FakeExec) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.outputs.push_back(exec),
            None => rules.push(ExecRule {
                pattern: pattern.to_string(),
                outputs: VecDeque::from([exec]),
            }),
        }
    }

    pub fn on(self, pattern: &str, exit_code: i64, stdout: &str, stderr: &str) -> Self {
        self.push(
            pattern,
            FakeExec::Output(ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    pub fn on_error(self, pattern: &str, message: &str) -> Self {
        self.push(pattern, FakeExec::Fail(message.to_string()));
        self
    }

    pub fn on_panic(self, pattern: &str) -> Self {
        self.push(pattern, FakeExec::Panic);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn detached_calls(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    fn answer(&self, command: &str) -> FakeExec {
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|r| command.contains(&r.pattern)) else {
            return FakeExec::Output(ExecOutput::default());
        };
        if rule.outputs.len() > 1 {
            rule.outputs.pop_front().unwrap()
        } else {
            rule.outputs.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(
        &self,
        language: Language,
        workspace: &Workspace,
    ) -> Result<SandboxHandle, RunnerError> {
        if let Some(message) = &self.create_error {
            return Err(RunnerError::SandboxCreation {
                image: language.default_image().to_string(),
                message: message.clone(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{}-{}", workspace.run_id(), n);
        self.live.lock().unwrap().push(id.clone());
        Ok(SandboxHandle {
            id,
            image: language.default_image().to_string(),
            language,
            workdir: "/workspace/repo".to_string(),
        })
    }

    async fn exec(
        &self,
        _sandbox: &SandboxHandle,
        command: &str,
        _opts: &ExecOptions,
    ) -> Result<ExecOutput, RunnerError> {
        self.calls.lock().unwrap().push(command.to_string());
        match self.answer(command) {
            FakeExec::Output(out) => Ok(out),
            FakeExec::Fail(message) => Err(RunnerError::Sandbox {
                operation: "exec",
                message,
            }),
            FakeExec::Panic => panic!("injected sandbox panic for '{}'", command),
        }
    }

    async fn exec_detached(
        &self,
        _sandbox: &SandboxHandle,
        command: &str,
        _opts: &ExecOptions,
    ) -> Result<DetachedExec, RunnerError> {
        let mut detached = self.detached.lock().unwrap();
        detached.push(command.to_string());
        Ok(DetachedExec {
            id: format!("exec-{}", detached.len()),
        })
    }

    async fn is_running(
        &self,
        _sandbox: &SandboxHandle,
        _exec: &DetachedExec,
    ) -> Result<bool, RunnerError> {
        Ok(self.detached_running)
    }

    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<(), RunnerError> {
        self.live.lock().unwrap().retain(|id| id != &sandbox.id);
        self.destroyed.lock().unwrap().push(sandbox.id.clone());
        Ok(())
    }
}

/// Fixer that replays a queue of answers and records what it was asked.
#[derive(Default)]
pub struct ScriptedFixer {
    answers: Mutex<VecDeque<Result<String, FixerError>>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedFixer {
    pub fn new(answers: Vec<Result<String, FixerError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// `(error_message, original_patch)` for each request, in order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fixer for ScriptedFixer {
    async fn fix(&self, request: FixRequest<'_>) -> Result<String, FixerError> {
        self.requests.lock().unwrap().push((
            request.error_message.to_string(),
            request.original_patch.to_string(),
        ));
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(FixerError::MalformedPatch))
    }
}

/// Source control that works on the local directory only.
#[derive(Default)]
pub struct FakeSourceControl {
    pub clone_error: Option<String>,
    pub checkout_error: Option<String>,
    /// Patches containing this text fail to apply.
    pub reject_patch_containing: Option<String>,
    pub commit_error: Option<String>,
    pub push_error: Option<String>,
    pub panic_on_commit: bool,
    /// Files written into the clone target.
    pub files: HashMap<String, String>,
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) applied: Mutex<Vec<String>>,
}

impl FakeSourceControl {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn clone_repo(&self, _url: &str, target: &Path, branch: &str) -> Result<(), RunnerError> {
        self.record(&format!("clone {}", branch));
        if let Some(message) = &self.clone_error {
            return Err(RunnerError::Clone(message.clone()));
        }
        std::fs::create_dir_all(target).unwrap();
        for (name, content) in &self.files {
            std::fs::write(target.join(name), content).unwrap();
        }
        Ok(())
    }

    async fn checkout_branch(&self, _repo: &Path, branch: &str) -> Result<(), RunnerError> {
        self.record(&format!("checkout {}", branch));
        match &self.checkout_error {
            Some(message) => Err(RunnerError::Checkout {
                branch: branch.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn apply_patch(&self, _repo: &Path, patch: &str) -> Result<(), RunnerError> {
        self.record("apply");
        if let Some(marker) = &self.reject_patch_containing
            && patch.contains(marker.as_str())
        {
            return Err(RunnerError::PatchApply("patch does not apply".into()));
        }
        self.applied.lock().unwrap().push(patch.to_string());
        Ok(())
    }

    async fn reset(&self, _repo: &Path) {
        self.record("reset");
    }

    async fn commit(&self, _repo: &Path, message: &str) -> Result<String, RunnerError> {
        self.record(&format!("commit {}", message));
        if self.panic_on_commit {
            panic!("injected commit panic");
        }
        match &self.commit_error {
            Some(message) => Err(RunnerError::Commit(message.clone())),
            None => Ok("0123456789abcdef0123456789abcdef01234567".to_string()),
        }
    }

    async fn push(&self, _repo: &Path, branch: &str) -> Result<(), RunnerError> {
        self.record(&format!("push {}", branch));
        match &self.push_error {
            Some(message) => Err(RunnerError::Push(message.clone())),
            None => Ok(()),
        }
    }
}
