//! Dynamic execution of a patched repository inside its sandbox.
//!
//! The engine dispatches on the execution strategy, runs the configured
//! command, and turns whatever it observed into an `ExecutionResult`.
//! Sandbox faults are folded into a failed result; nothing escapes as an
//! error.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use super::criteria::{self, Observation};
use super::execution::{
    DaemonSpec, ExecutionConfig, ExecutionResult, HealthCheckConfig, HealthProbe, ScriptSpec,
    ServiceSpec, Strategy, StrategyKind, SuccessCriteria, TestSpec,
};
use super::models::truncate_chars;
use super::sandbox::{ExecOptions, SandboxHandle, SandboxProvider};
use crate::errors::RunnerError;

const SCRIPT_OUTPUT_CHARS: usize = 1000;
const TEST_OUTPUT_CHARS: usize = 2000;
const HEALTH_OUTPUT_CHARS: usize = 200;
const DEFAULT_STARTUP_WAIT_SECS: u64 = 3;
const DEFAULT_DAEMON_RUNTIME_SECS: f64 = 5.0;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_SETTLE: Duration = Duration::from_secs(1);

static PYTEST_PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("valid regex"));
static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("valid regex"));
static JEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Tests:(.*)$").expect("valid regex"));
static JEST_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) total").expect("valid regex"));

/// Pass/fail counts parsed from test-runner output.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TestCounts {
    pub run: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    pub fn pass_rate(&self) -> f64 {
        f64::from(self.passed) / f64::from(self.run.max(1))
    }
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text).and_then(|c| c[1].parse().ok())
}

/// Parse test counts for the frameworks we understand; anything else
/// yields zero counts.
pub fn parse_test_counts(output: &str, framework: Option<&str>) -> TestCounts {
    match framework {
        Some("pytest") => {
            let passed = capture_u32(&PYTEST_PASSED, output).unwrap_or(0);
            let failed = capture_u32(&PYTEST_FAILED, output).unwrap_or(0);
            TestCounts {
                run: passed + failed,
                passed,
                failed,
            }
        }
        Some("jest") => {
            let Some(summary) = JEST_SUMMARY.captures(output).map(|c| c[1].to_string()) else {
                return TestCounts::default();
            };
            let passed = capture_u32(&PYTEST_PASSED, &summary).unwrap_or(0);
            let failed = capture_u32(&PYTEST_FAILED, &summary).unwrap_or(0);
            let run = capture_u32(&JEST_TOTAL, &summary).unwrap_or(passed + failed);
            TestCounts {
                run,
                passed,
                failed,
            }
        }
        _ => TestCounts::default(),
    }
}

/// Test-suite verdict: a clean exit, and either no criteria, no failures,
/// or a pass rate at or above the configured threshold (default 1.0).
fn tests_succeeded(exit_code: i64, counts: &TestCounts, criteria: Option<&SuccessCriteria>) -> bool {
    if exit_code != 0 {
        return false;
    }
    match criteria {
        None => true,
        Some(_) if counts.failed == 0 => true,
        Some(c) => counts.pass_rate() >= c.test_pass_rate.unwrap_or(1.0),
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Outcome of a health probe: whether it passed and a short description.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthOutcome {
    pub passed: bool,
    pub detail: String,
}

impl HealthOutcome {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Runs one execution config against one sandbox.
pub struct ExecutionEngine<'a> {
    sandbox: &'a dyn SandboxProvider,
    handle: &'a SandboxHandle,
    http: reqwest::Client,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(sandbox: &'a dyn SandboxProvider, handle: &'a SandboxHandle) -> Self {
        Self {
            sandbox,
            handle,
            http: reqwest::Client::new(),
        }
    }

    fn exec_options(&self, config: &ExecutionConfig, timeout: Option<Duration>) -> ExecOptions {
        ExecOptions {
            env: config.env.clone(),
            working_dir: config
                .working_dir
                .as_deref()
                .map(|dir| self.handle.resolve_dir(dir)),
            timeout,
        }
    }

    /// Run `config`. Disabled configs succeed immediately without
    /// touching the sandbox.
    pub async fn execute(&self, config: &ExecutionConfig) -> ExecutionResult {
        if !config.is_active() {
            tracing::info!("Execution disabled");
            return ExecutionResult::new(StrategyKind::None, true);
        }

        let kind = config.strategy.kind();
        tracing::info!(strategy = %kind, "Starting execution");
        let started = Instant::now();

        let outcome = match &config.strategy {
            Strategy::None => Ok(ExecutionResult::new(StrategyKind::None, true)),
            Strategy::Script(spec) => self.run_script(config, spec).await,
            Strategy::Service(spec) => self.run_service(config, spec).await,
            Strategy::Test(spec) => self.run_tests(config, spec).await,
            Strategy::Daemon(spec) => self.run_daemon(config, spec).await,
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(strategy = %kind, error = %e, "Execution error");
                ExecutionResult {
                    runtime_seconds: Some(started.elapsed().as_secs_f64()),
                    ..ExecutionResult::failed(kind, e.to_string())
                }
            }
        }
    }

    async fn run_script(
        &self,
        config: &ExecutionConfig,
        spec: &ScriptSpec,
    ) -> Result<ExecutionResult, RunnerError> {
        let cmd = command_line(&spec.command, &spec.args);
        tracing::debug!(command = %cmd, "Executing script");

        let started = Instant::now();
        let opts = self.exec_options(config, Some(Duration::from_secs(spec.timeout_secs)));
        let output = self.sandbox.exec(self.handle, &cmd, &opts).await?;
        let runtime = started.elapsed().as_secs_f64();
        tracing::info!(exit_code = output.exit_code, runtime_secs = runtime, "Script completed");

        let outcome = criteria::evaluate(
            config.success_if.as_ref(),
            &Observation {
                exit_code: Some(output.exit_code),
                stdout: &output.stdout,
                stderr: &output.stderr,
                runtime_secs: runtime,
                ..Default::default()
            },
        );

        Ok(ExecutionResult {
            exit_code: Some(output.exit_code),
            stdout: Some(truncate_chars(&output.stdout, SCRIPT_OUTPUT_CHARS)),
            stderr: Some(truncate_chars(&output.stderr, SCRIPT_OUTPUT_CHARS)),
            runtime_seconds: Some(runtime),
            criteria_met: Some(outcome.criteria_met),
            ..ExecutionResult::new(StrategyKind::Script, outcome.success)
        })
    }

    async fn run_service(
        &self,
        config: &ExecutionConfig,
        spec: &ServiceSpec,
    ) -> Result<ExecutionResult, RunnerError> {
        let cmd = command_line(&spec.command, &spec.args);
        tracing::debug!(command = %cmd, "Starting service");

        let started = Instant::now();
        self.sandbox
            .exec_detached(self.handle, &cmd, &self.exec_options(config, None))
            .await?;

        let wait = spec.startup_wait_secs.unwrap_or(DEFAULT_STARTUP_WAIT_SECS);
        tracing::info!(wait_secs = wait, "Service started, waiting for startup");
        tokio::time::sleep(Duration::from_secs(wait)).await;

        let health = match &spec.health_check {
            Some(check) => {
                let outcome = self.health_check(check).await;
                if outcome.passed {
                    tracing::info!(detail = %outcome.detail, "Health check passed");
                } else {
                    tracing::error!(detail = %outcome.detail, "Health check failed");
                }
                Some(outcome)
            }
            None => None,
        };

        if let Some(shutdown) = &spec.shutdown_command {
            tracing::debug!(command = %shutdown, "Shutting down service");
            if let Err(e) = self
                .sandbox
                .exec(self.handle, shutdown, &ExecOptions::with_timeout(SHUTDOWN_TIMEOUT))
                .await
            {
                tracing::warn!(error = %e, "Service shutdown command failed");
            }
            tokio::time::sleep(SHUTDOWN_SETTLE).await;
        }

        let runtime = started.elapsed().as_secs_f64();
        let success = health.as_ref().is_none_or(|h| h.passed);
        let mut criteria_met = BTreeMap::new();
        if let Some(h) = &health {
            criteria_met.insert("health_check_passes".to_string(), h.passed);
        }

        Ok(ExecutionResult {
            service_started: Some(true),
            health_check_passed: health.as_ref().map(|h| h.passed),
            health_check_response: health.map(|h| h.detail),
            runtime_seconds: Some(runtime),
            criteria_met: Some(criteria_met),
            ..ExecutionResult::new(StrategyKind::Service, success)
        })
    }

    async fn run_tests(
        &self,
        config: &ExecutionConfig,
        spec: &TestSpec,
    ) -> Result<ExecutionResult, RunnerError> {
        let cmd = command_line(&spec.test_command, &spec.args);
        tracing::debug!(
            command = %cmd,
            framework = spec.framework.as_deref().unwrap_or("default"),
            "Running tests"
        );

        let started = Instant::now();
        let opts = self.exec_options(config, Some(Duration::from_secs(spec.timeout_secs)));
        let output = self.sandbox.exec(self.handle, &cmd, &opts).await?;
        let runtime = started.elapsed().as_secs_f64();

        let counts = parse_test_counts(&output.stdout, spec.framework.as_deref());
        tracing::info!(
            passed = counts.passed,
            run = counts.run,
            failed = counts.failed,
            "Tests finished"
        );

        let criteria = config.success_if.as_ref();
        let success = tests_succeeded(output.exit_code, &counts, criteria);
        let mut criteria_met = BTreeMap::from([("exit_code_0".to_string(), output.exit_code == 0)]);
        if let Some(threshold) = criteria.and_then(|c| c.test_pass_rate) {
            criteria_met.insert(
                "test_pass_rate".to_string(),
                counts.failed == 0 || counts.pass_rate() >= threshold,
            );
        }

        Ok(ExecutionResult {
            exit_code: Some(output.exit_code),
            tests_run: Some(counts.run),
            tests_passed: Some(counts.passed),
            tests_failed: Some(counts.failed),
            test_output: Some(truncate_chars(&output.stdout, TEST_OUTPUT_CHARS)),
            runtime_seconds: Some(runtime),
            criteria_met: Some(criteria_met),
            ..ExecutionResult::new(StrategyKind::Test, success)
        })
    }

    async fn run_daemon(
        &self,
        config: &ExecutionConfig,
        spec: &DaemonSpec,
    ) -> Result<ExecutionResult, RunnerError> {
        let min_runtime = config
            .success_if
            .as_ref()
            .and_then(|c| c.runs_for_at_least)
            .or(spec.min_runtime_secs.map(|s| s as f64))
            .unwrap_or(DEFAULT_DAEMON_RUNTIME_SECS)
            .max(0.0);
        let wait = Duration::try_from_secs_f64(min_runtime).map_err(|e| {
            RunnerError::InvalidRequest(format!(
                "Daemon minimum runtime {}s is out of range: {}",
                min_runtime, e
            ))
        })?;

        let cmd = command_line(&spec.command, &spec.args);
        tracing::debug!(command = %cmd, "Starting daemon");

        let started = Instant::now();
        let exec = self
            .sandbox
            .exec_detached(self.handle, &cmd, &self.exec_options(config, None))
            .await?;

        tracing::info!(min_runtime_secs = min_runtime, "Daemon started, verifying it stays up");
        tokio::time::sleep(wait).await;

        let still_running = self.sandbox.is_running(self.handle, &exec).await?;
        let runtime = started.elapsed().as_secs_f64();
        if still_running {
            tracing::info!(runtime_secs = runtime, "Daemon still running");
        } else {
            tracing::error!(runtime_secs = runtime, "Daemon stopped early");
        }

        Ok(ExecutionResult {
            runtime_seconds: Some(runtime),
            criteria_met: Some(BTreeMap::from([("still_running".to_string(), still_running)])),
            ..ExecutionResult::new(StrategyKind::Daemon, still_running)
        })
    }

    /// Probe a started service. Every probe is bounded by the check's timeout.
    pub async fn health_check(&self, check: &HealthCheckConfig) -> HealthOutcome {
        let limit = Duration::from_secs(check.timeout_secs);
        match &check.probe {
            HealthProbe::Http {
                url,
                expected_status,
                expected_body_contains,
            } => self.http_probe(url, *expected_status, expected_body_contains, limit).await,
            HealthProbe::Tcp { host, port } => tcp_probe(host, *port, limit).await,
            HealthProbe::Command { command } => {
                match self
                    .sandbox
                    .exec(self.handle, command, &ExecOptions::with_timeout(limit))
                    .await
                {
                    Ok(output) => HealthOutcome {
                        passed: output.exit_code == 0,
                        detail: truncate_chars(&output.combined(), HEALTH_OUTPUT_CHARS),
                    },
                    Err(e) => HealthOutcome::fail(e.to_string()),
                }
            }
        }
    }

    async fn http_probe(
        &self,
        url: &str,
        expected_status: Option<u16>,
        expected_body: &[String],
        limit: Duration,
    ) -> HealthOutcome {
        let resp = match self.http.get(url).timeout(limit).send().await {
            Ok(resp) => resp,
            Err(e) => return HealthOutcome::fail(e.to_string()),
        };

        let status = resp.status().as_u16();
        if let Some(expected) = expected_status
            && status != expected
        {
            return HealthOutcome::fail(format!("Status {}, expected {}", status, expected));
        }

        if !expected_body.is_empty() {
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => return HealthOutcome::fail(e.to_string()),
            };
            if let Some(missing) = expected_body.iter().find(|s| !body.contains(s.as_str())) {
                return HealthOutcome::fail(format!("Body missing: {}", missing));
            }
        }
        HealthOutcome::pass(format!("Status {}", status))
    }
}

async fn tcp_probe(host: &str, port: u16, limit: Duration) -> HealthOutcome {
    match tokio::time::timeout(limit, tokio::net::TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => HealthOutcome::pass(format!("Port {} open", port)),
        Ok(Err(e)) => HealthOutcome::fail(format!("Port {} closed: {}", port, e)),
        Err(_) => HealthOutcome::fail(format!("Port {} timed out after {}s", port, limit.as_secs())),
    }
}
