use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::errors::ConfigError;

/// Commit identity used when the runner commits a validated patch.
#[derive(Debug, Clone, PartialEq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "Test Runner Bot".to_string(),
            email: "runner@codecontext.local".to_string(),
        }
    }
}

/// Connection settings for the chat-completion gateway used by the fixer.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://llm-gateway:3010".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            timeout_secs: 60,
        }
    }
}

/// Configuration for the per-run sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub memory: String,
    pub network_mode: String,
    pub mount_point: String,
    pub stop_grace_secs: i32,
    /// Language name → image overrides on top of the built-in table.
    pub images: HashMap<String, String>,
    /// Named volume that holds the workspace root. When unset the host
    /// workspace directory is bind-mounted instead.
    pub workspace_volume: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY.to_string(),
            network_mode: "none".to_string(),
            mount_point: "/workspace".to_string(),
            stop_grace_secs: 5,
            images: HashMap::new(),
            workspace_volume: None,
        }
    }
}

impl SandboxConfig {
    /// Memory ceiling in bytes, as the container runtime expects it. An
    /// unparsable setting falls back to the 2 GiB default; the ceiling is
    /// never lifted.
    pub fn memory_bytes(&self) -> i64 {
        parse_memory(&self.memory).unwrap_or_else(|| {
            tracing::warn!(
                memory = %self.memory,
                "Unparsable sandbox memory limit; using {}",
                DEFAULT_MEMORY
            );
            DEFAULT_MEMORY_BYTES
        })
    }
}

const DEFAULT_MEMORY: &str = "2g";
const DEFAULT_MEMORY_BYTES: i64 = 2 * 1024 * 1024 * 1024;

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s?([kmgt])?i?b?$").expect("valid regex")
});

/// Parse a Docker-style memory string (`512m`, `2g`, `2gb`, `2GiB`, `1024`)
/// into bytes. Zero and overflowing values are rejected.
pub fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let caps = MEMORY_RE.captures(&value)?;
    let n: i64 = caps[1].parse().ok()?;
    let shift = match caps.get(2).map(|m| m.as_str()) {
        None => 0,
        Some("k") => 10,
        Some("m") => 20,
        Some("g") => 30,
        Some(_) => 40,
    };
    n.checked_mul(1i64 << shift).filter(|bytes| *bytes > 0)
}

/// Raw TOML structure for the runner config file.
#[derive(Debug, Deserialize)]
struct RunnerToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    memory: Option<String>,
    network_mode: Option<String>,
    mount_point: Option<String>,
    stop_grace_secs: Option<i32>,
    workspace_volume: Option<String>,
    images: Option<HashMap<String, String>>,
}

/// Runtime configuration for the runner service.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub host: String,
    pub port: u16,
    /// Expected `X-API-Key` value. `None` disables authentication.
    pub api_key: Option<String>,
    pub llm: LlmConfig,
    pub max_attempts: u32,
    /// Default timeout for commands run inside the sandbox.
    pub exec_timeout_secs: u64,
    pub workspace_root: PathBuf,
    pub git_identity: GitIdentity,
    /// Sent as `X-API-Key` on webhook callbacks.
    pub callback_api_key: Option<String>,
    pub sandbox: SandboxConfig,
    /// Each run also writes its log to `{run_id}.log` here when set.
    pub run_log_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            api_key: None,
            llm: LlmConfig::default(),
            max_attempts: 3,
            exec_timeout_secs: 600,
            workspace_root: PathBuf::from("/workspace"),
            git_identity: GitIdentity::default(),
            callback_api_key: None,
            sandbox: SandboxConfig::default(),
            run_log_dir: None,
        }
    }
}

impl RunnerConfig {
    /// Build the configuration from the process environment, loading `.env`
    /// first when present, then apply an optional TOML file on top.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if let Some(path) = config_file {
            config.apply_file(path)?;
        }
        Ok(config)
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = non_empty("RUNNER_HOST") {
            config.host = host;
        }
        if let Some(port) = non_empty("RUNNER_PORT") {
            config.port = parse_env("RUNNER_PORT", &port)?;
        }
        config.api_key = non_empty("RUNNER_API_KEY");

        if let Some(url) = non_empty("LLM_GATEWAY_URL") {
            config.llm.gateway_url = url.trim_end_matches('/').to_string();
        }
        config.llm.api_key = non_empty("LLM_GATEWAY_API_KEY");
        if let Some(model) = non_empty("LLM_MODEL") {
            config.llm.model = model;
        }

        if let Some(attempts) = non_empty("MAX_VALIDATION_ATTEMPTS") {
            let attempts: u32 = parse_env("MAX_VALIDATION_ATTEMPTS", &attempts)?;
            if attempts == 0 {
                return Err(ConfigError::InvalidEnv {
                    var: "MAX_VALIDATION_ATTEMPTS",
                    value: "0".to_string(),
                });
            }
            config.max_attempts = attempts;
        }
        if let Some(timeout) = non_empty("SANDBOX_TIMEOUT") {
            config.exec_timeout_secs = parse_env("SANDBOX_TIMEOUT", &timeout)?;
        }
        if let Some(root) = non_empty("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        config.sandbox.workspace_volume = non_empty("WORKSPACE_VOLUME_NAME");
        config.run_log_dir = non_empty("RUNNER_RUN_LOG_DIR").map(PathBuf::from);

        if let Some(name) = non_empty("GIT_AUTHOR_NAME") {
            config.git_identity.name = name;
        }
        if let Some(email) = non_empty("GIT_AUTHOR_EMAIL") {
            config.git_identity.email = email;
        }
        config.callback_api_key = non_empty("CALLBACK_API_KEY").or_else(|| non_empty("RAG_API_KEY"));

        Ok(config)
    }

    /// Overlay the `[sandbox]` section of a TOML file onto this configuration.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let toml: RunnerToml = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(section) = toml.sandbox {
            if let Some(memory) = section.memory {
                if parse_memory(&memory).is_none() {
                    return Err(ConfigError::InvalidSetting {
                        path: path.to_path_buf(),
                        key: "sandbox.memory",
                        value: memory,
                    });
                }
                self.sandbox.memory = memory;
            }
            if let Some(network_mode) = section.network_mode {
                self.sandbox.network_mode = network_mode;
            }
            if let Some(mount_point) = section.mount_point {
                self.sandbox.mount_point = mount_point;
            }
            if let Some(grace) = section.stop_grace_secs {
                self.sandbox.stop_grace_secs = grace;
            }
            if let Some(volume) = section.workspace_volume {
                self.sandbox.workspace_volume = Some(volume);
            }
            if let Some(images) = section.images {
                self.sandbox.images.extend(images);
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.port, 8001);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.exec_timeout_secs, 600);
        assert_eq!(config.workspace_root, PathBuf::from("/workspace"));
        assert!(config.api_key.is_none());
        assert_eq!(config.sandbox.memory, "2g");
        assert_eq!(config.sandbox.network_mode, "none");
        assert_eq!(config.git_identity, GitIdentity::default());
        assert!(config.run_log_dir.is_none());
    }

    #[test]
    fn test_runner_config_reads_env() {
        let config = RunnerConfig::from_lookup(lookup_from(&[
            ("RUNNER_PORT", "9000"),
            ("RUNNER_API_KEY", "secret"),
            ("LLM_GATEWAY_URL", "http://gw:1/"),
            ("MAX_VALIDATION_ATTEMPTS", "5"),
            ("WORKSPACE_ROOT", "/tmp/ws"),
            ("WORKSPACE_VOLUME_NAME", "runner_ws"),
            ("GIT_AUTHOR_NAME", "Bot"),
            ("RAG_API_KEY", "cb-key"),
            ("RUNNER_RUN_LOG_DIR", "/var/log/runner/runs"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.llm.gateway_url, "http://gw:1");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(config.sandbox.workspace_volume.as_deref(), Some("runner_ws"));
        assert_eq!(config.git_identity.name, "Bot");
        assert_eq!(config.git_identity.email, "runner@codecontext.local");
        assert_eq!(config.callback_api_key.as_deref(), Some("cb-key"));
        assert_eq!(config.run_log_dir, Some(PathBuf::from("/var/log/runner/runs")));
    }

    #[test]
    fn test_runner_config_rejects_bad_port() {
        let err = RunnerConfig::from_lookup(lookup_from(&[("RUNNER_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "RUNNER_PORT", .. }));
    }

    #[test]
    fn test_runner_config_rejects_zero_attempts() {
        let err = RunnerConfig::from_lookup(lookup_from(&[("MAX_VALIDATION_ATTEMPTS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_apply_file_overrides_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(
            &path,
            r#"
[sandbox]
memory = "4g"
stop_grace_secs = 10

[sandbox.images]
python = "python:3.12-slim"
"#,
        )
        .unwrap();

        let mut config = RunnerConfig::default();
        config.apply_file(&path).unwrap();
        assert_eq!(config.sandbox.memory, "4g");
        assert_eq!(config.sandbox.stop_grace_secs, 10);
        assert_eq!(config.sandbox.network_mode, "none"); // default
        assert_eq!(config.sandbox.images.get("python").unwrap(), "python:3.12-slim");
    }

    #[test]
    fn test_apply_file_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        let mut config = RunnerConfig::default();
        assert!(matches!(config.apply_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_apply_file_missing() {
        let mut config = RunnerConfig::default();
        let err = config.apply_file(Path::new("/nonexistent/runner.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_apply_file_rejects_unparsable_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "[sandbox]\nmemory = \"plenty\"\n").unwrap();

        let mut config = RunnerConfig::default();
        let err = config.apply_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { key: "sandbox.memory", .. }));
        assert_eq!(config.sandbox.memory, "2g");
    }

    #[test]
    fn test_apply_file_accepts_docker_unit_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.toml");
        fs::write(&path, "[sandbox]\nmemory = \"2gb\"\n").unwrap();

        let mut config = RunnerConfig::default();
        config.apply_file(&path).unwrap();
        assert_eq!(config.sandbox.memory_bytes(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_memory_ceiling_is_never_lifted() {
        let sandbox = SandboxConfig {
            memory: "unbounded".to_string(),
            ..SandboxConfig::default()
        };
        assert_eq!(sandbox.memory_bytes(), DEFAULT_MEMORY_BYTES);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("2gb"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("256 mb"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory("0g"), None);
        assert_eq!(parse_memory("99999999999t"), None);
        assert_eq!(parse_memory(""), None);
    }
}
