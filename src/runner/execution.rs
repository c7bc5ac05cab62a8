//! Dynamic-execution configuration and result types.
//!
//! On the wire an execution config is a flat object with a `strategy` tag
//! and optional per-strategy fields. In memory it is a sum type: each
//! strategy carries only the fields it uses, and a config that names an
//! unknown strategy or omits a required field is rejected while parsing.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    None,
    Script,
    Service,
    Test,
    Daemon,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Script => "script",
            Self::Service => "service",
            Self::Test => "test",
            Self::Daemon => "daemon",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run a command to completion and judge it by its output.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSpec {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

/// Start a long-running command, probe it, then shut it down.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub command: String,
    pub args: Vec<String>,
    pub startup_wait_secs: Option<u64>,
    pub health_check: Option<HealthCheckConfig>,
    pub shutdown_command: Option<String>,
}

/// Run a test suite and parse pass/fail counts from its output.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub test_command: String,
    pub args: Vec<String>,
    pub framework: Option<String>,
    pub timeout_secs: u64,
}

/// Start a process and check that it is still alive after a while.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSpec {
    pub command: String,
    pub args: Vec<String>,
    pub min_runtime_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Strategy {
    #[default]
    None,
    Script(ScriptSpec),
    Service(ServiceSpec),
    Test(TestSpec),
    Daemon(DaemonSpec),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::None => StrategyKind::None,
            Self::Script(_) => StrategyKind::Script,
            Self::Service(_) => StrategyKind::Service,
            Self::Test(_) => StrategyKind::Test,
            Self::Daemon(_) => StrategyKind::Daemon,
        }
    }
}

/// How to decide whether a dynamic execution succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriteria {
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub exit_code_not: Option<Vec<i64>>,
    #[serde(default)]
    pub stdout_contains: Option<Vec<String>>,
    #[serde(default)]
    pub stdout_not_contains: Option<Vec<String>>,
    #[serde(default)]
    pub stderr_empty: Option<bool>,
    #[serde(default)]
    pub stderr_contains: Option<Vec<String>>,
    #[serde(default)]
    pub runs_for_at_least: Option<f64>,
    #[serde(default)]
    pub health_check_passes: Option<bool>,
    #[serde(default)]
    pub test_pass_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthProbe {
    Http {
        url: String,
        expected_status: Option<u16>,
        expected_body_contains: Vec<String>,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Command {
        command: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHealthCheck", into = "RawHealthCheck")]
pub struct HealthCheckConfig {
    pub probe: HealthProbe,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawExecutionConfig", into = "RawExecutionConfig")]
pub struct ExecutionConfig {
    pub enabled: bool,
    pub strategy: Strategy,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub success_if: Option<SuccessCriteria>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: Strategy::None,
            env: HashMap::new(),
            working_dir: None,
            success_if: None,
            description: None,
            tags: Vec::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn is_active(&self) -> bool {
        self.enabled && !matches!(self.strategy, Strategy::None)
    }
}

// ── Wire format ───────────────────────────────────────────────────────

fn default_strategy() -> String {
    "none".to_string()
}

fn default_script_timeout() -> u64 {
    30
}

fn default_test_timeout() -> u64 {
    300
}

fn default_health_type() -> String {
    "http".to_string()
}

fn default_expected_status() -> Option<u16> {
    Some(200)
}

fn default_health_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawExecutionConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default = "default_script_timeout")]
    timeout: u64,
    #[serde(default)]
    startup_wait: Option<u64>,
    #[serde(default)]
    health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    shutdown_command: Option<String>,
    #[serde(default)]
    test_command: Option<String>,
    #[serde(default)]
    test_framework: Option<String>,
    #[serde(default = "default_test_timeout")]
    test_timeout: u64,
    #[serde(default)]
    min_runtime: Option<u64>,
    #[serde(default)]
    success_if: Option<SuccessCriteria>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

fn require(field: Option<String>, name: &str, strategy: &str) -> Result<String, String> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("strategy '{}' requires '{}'", strategy, name))
}

impl TryFrom<RawExecutionConfig> for ExecutionConfig {
    type Error = String;

    fn try_from(raw: RawExecutionConfig) -> Result<Self, Self::Error> {
        let args = raw.args.unwrap_or_default();
        let strategy = match raw.strategy.as_str() {
            "none" => Strategy::None,
            "script" => Strategy::Script(ScriptSpec {
                command: require(raw.command, "command", "script")?,
                args,
                timeout_secs: raw.timeout,
            }),
            "service" => Strategy::Service(ServiceSpec {
                command: require(raw.command, "command", "service")?,
                args,
                startup_wait_secs: raw.startup_wait,
                health_check: raw.health_check,
                shutdown_command: raw.shutdown_command,
            }),
            "test" => Strategy::Test(TestSpec {
                test_command: require(raw.test_command, "test_command", "test")?,
                args,
                framework: raw.test_framework,
                timeout_secs: raw.test_timeout,
            }),
            "daemon" => Strategy::Daemon(DaemonSpec {
                command: require(raw.command, "command", "daemon")?,
                args,
                min_runtime_secs: raw.min_runtime,
            }),
            other => return Err(format!("Unknown strategy: {}", other)),
        };

        Ok(Self {
            enabled: raw.enabled,
            strategy,
            env: raw.env.unwrap_or_default(),
            working_dir: raw.working_dir,
            success_if: raw.success_if,
            description: raw.description,
            tags: raw.tags.unwrap_or_default(),
        })
    }
}

impl From<ExecutionConfig> for RawExecutionConfig {
    fn from(config: ExecutionConfig) -> Self {
        let mut raw = RawExecutionConfig {
            enabled: config.enabled,
            strategy: config.strategy.kind().as_str().to_string(),
            command: None,
            args: None,
            env: (!config.env.is_empty()).then_some(config.env),
            working_dir: config.working_dir,
            timeout: default_script_timeout(),
            startup_wait: None,
            health_check: None,
            shutdown_command: None,
            test_command: None,
            test_framework: None,
            test_timeout: default_test_timeout(),
            min_runtime: None,
            success_if: config.success_if,
            description: config.description,
            tags: (!config.tags.is_empty()).then_some(config.tags),
        };
        match config.strategy {
            Strategy::None => {}
            Strategy::Script(s) => {
                raw.command = Some(s.command);
                raw.args = Some(s.args);
                raw.timeout = s.timeout_secs;
            }
            Strategy::Service(s) => {
                raw.command = Some(s.command);
                raw.args = Some(s.args);
                raw.startup_wait = s.startup_wait_secs;
                raw.health_check = s.health_check;
                raw.shutdown_command = s.shutdown_command;
            }
            Strategy::Test(t) => {
                raw.test_command = Some(t.test_command);
                raw.args = Some(t.args);
                raw.test_framework = t.framework;
                raw.test_timeout = t.timeout_secs;
            }
            Strategy::Daemon(d) => {
                raw.command = Some(d.command);
                raw.args = Some(d.args);
                raw.min_runtime = d.min_runtime_secs;
            }
        }
        raw
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawHealthCheck {
    #[serde(rename = "type", default = "default_health_type")]
    kind: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default = "default_expected_status")]
    expected_status: Option<u16>,
    #[serde(default)]
    expected_body_contains: Option<Vec<String>>,
    #[serde(default = "default_health_timeout")]
    timeout: u64,
}

impl TryFrom<RawHealthCheck> for HealthCheckConfig {
    type Error = String;

    fn try_from(raw: RawHealthCheck) -> Result<Self, Self::Error> {
        let probe = match raw.kind.as_str() {
            "http" => HealthProbe::Http {
                url: raw.url.ok_or("http health check requires 'url'")?,
                expected_status: raw.expected_status,
                expected_body_contains: raw.expected_body_contains.unwrap_or_default(),
            },
            "tcp" => HealthProbe::Tcp {
                host: raw.host.unwrap_or_else(|| "localhost".to_string()),
                port: raw.port.ok_or("tcp health check requires 'port'")?,
            },
            "command" => HealthProbe::Command {
                command: raw.command.ok_or("command health check requires 'command'")?,
            },
            other => return Err(format!("Unknown health check type: {}", other)),
        };
        Ok(Self {
            probe,
            timeout_secs: raw.timeout,
        })
    }
}

impl From<HealthCheckConfig> for RawHealthCheck {
    fn from(config: HealthCheckConfig) -> Self {
        let mut raw = RawHealthCheck {
            kind: String::new(),
            url: None,
            host: None,
            port: None,
            command: None,
            expected_status: None,
            expected_body_contains: None,
            timeout: config.timeout_secs,
        };
        match config.probe {
            HealthProbe::Http {
                url,
                expected_status,
                expected_body_contains,
            } => {
                raw.kind = "http".to_string();
                raw.url = Some(url);
                raw.expected_status = expected_status;
                raw.expected_body_contains = Some(expected_body_contains);
            }
            HealthProbe::Tcp { host, port } => {
                raw.kind = "tcp".to_string();
                raw.host = Some(host);
                raw.port = Some(port);
            }
            HealthProbe::Command { command } => {
                raw.kind = "command".to_string();
                raw.command = Some(command);
            }
        }
        raw
    }
}

// ── Results ───────────────────────────────────────────────────────────

/// Outcome of one dynamic-execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub strategy: StrategyKind,
    pub success: bool,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub runtime_seconds: Option<f64>,
    pub service_started: Option<bool>,
    pub health_check_passed: Option<bool>,
    pub health_check_response: Option<String>,
    pub tests_run: Option<u32>,
    pub tests_passed: Option<u32>,
    pub tests_failed: Option<u32>,
    pub test_output: Option<String>,
    pub error: Option<String>,
    pub criteria_met: Option<BTreeMap<String, bool>>,
}

impl ExecutionResult {
    pub fn new(strategy: StrategyKind, success: bool) -> Self {
        Self {
            strategy,
            success,
            exit_code: None,
            stdout: None,
            stderr: None,
            runtime_seconds: None,
            service_started: None,
            health_check_passed: None,
            health_check_response: None,
            tests_run: None,
            tests_passed: None,
            tests_failed: None,
            test_output: None,
            error: None,
            criteria_met: None,
        }
    }

    pub fn failed(strategy: StrategyKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(strategy, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_script_config() {
        let config: ExecutionConfig = serde_json::from_value(json!({
            "enabled": true,
            "strategy": "script",
            "command": "python",
            "args": ["main.py"],
            "success_if": {"exit_code": 0, "stdout_contains": ["ok"]}
        }))
        .unwrap();
        assert!(config.is_active());
        match &config.strategy {
            Strategy::Script(spec) => {
                assert_eq!(spec.command, "python");
                assert_eq!(spec.args, vec!["main.py"]);
                assert_eq!(spec.timeout_secs, 30);
            }
            other => panic!("Expected script strategy, got {:?}", other),
        }
        let criteria = config.success_if.unwrap();
        assert_eq!(criteria.exit_code, Some(0));
        assert_eq!(criteria.stdout_contains.unwrap(), vec!["ok"]);
    }

    #[test]
    fn test_parse_service_config_with_http_health_check() {
        let config: ExecutionConfig = serde_json::from_value(json!({
            "enabled": true,
            "strategy": "service",
            "command": "python",
            "args": ["app.py"],
            "startup_wait": 5,
            "health_check": {"type": "http", "url": "http://localhost:5000/health"},
            "shutdown_command": "pkill -f app.py"
        }))
        .unwrap();
        let Strategy::Service(spec) = config.strategy else {
            panic!("Expected service strategy");
        };
        assert_eq!(spec.startup_wait_secs, Some(5));
        let health = spec.health_check.unwrap();
        assert_eq!(health.timeout_secs, 10);
        assert_eq!(
            health.probe,
            HealthProbe::Http {
                url: "http://localhost:5000/health".into(),
                expected_status: Some(200),
                expected_body_contains: vec![],
            }
        );
    }

    #[test]
    fn test_missing_strategy_defaults_to_none() {
        let config: ExecutionConfig = serde_json::from_value(json!({"enabled": false})).unwrap();
        assert_eq!(config.strategy, Strategy::None);
        assert!(!config.is_active());
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = serde_json::from_value::<ExecutionConfig>(json!({
            "enabled": true,
            "strategy": "benchmark",
            "command": "x"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Unknown strategy: benchmark"));
    }

    #[test]
    fn test_script_without_command_is_rejected() {
        let err = serde_json::from_value::<ExecutionConfig>(json!({
            "enabled": true,
            "strategy": "script"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("requires 'command'"));
    }

    #[test]
    fn test_unknown_health_check_type_is_rejected() {
        let err = serde_json::from_value::<HealthCheckConfig>(json!({"type": "udp", "port": 1}))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown health check type"));
    }

    #[test]
    fn test_tcp_health_check_defaults_host() {
        let health: HealthCheckConfig =
            serde_json::from_value(json!({"type": "tcp", "port": 8080, "timeout": 3})).unwrap();
        assert_eq!(
            health.probe,
            HealthProbe::Tcp {
                host: "localhost".into(),
                port: 8080
            }
        );
        assert_eq!(health.timeout_secs, 3);
    }

    #[test]
    fn test_config_serializes_back_to_flat_form() {
        let config = ExecutionConfig {
            enabled: true,
            strategy: Strategy::Test(TestSpec {
                test_command: "pytest".into(),
                args: vec!["-q".into()],
                framework: Some("pytest".into()),
                timeout_secs: 120,
            }),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["strategy"], "test");
        assert_eq!(value["test_command"], "pytest");
        assert_eq!(value["test_timeout"], 120);
        let back: ExecutionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_failed_result_carries_error() {
        let result = ExecutionResult::failed(StrategyKind::Daemon, "boom");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(serde_json::to_value(&result).unwrap()["strategy"], "daemon");
    }
}
