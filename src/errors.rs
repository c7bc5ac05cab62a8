//! Typed error hierarchy for the patch runner.
//!
//! Three top-level enums cover the three failure domains:
//! - `RunnerError`: infrastructure failures while driving a validation run
//! - `FixerError`: failures talking to the patch-repair service
//! - `ConfigError`: invalid runtime configuration

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the infrastructure a validation run depends on.
///
/// Everything here is fatal to the run that hit it; content-level failures
/// (syntax errors, failing tests) are recorded as attempt errors instead.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to prepare workspace at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Git clone failed: {0}")]
    Clone(String),

    #[error("Branch '{branch}' not found or checkout failed: {message}")]
    Checkout { branch: String, message: String },

    #[error("Patch does not apply: {0}")]
    PatchApply(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Push failed: {0}")]
    Push(String),

    #[error("Failed to create sandbox with image {image}: {message}")]
    SandboxCreation { image: String, message: String },

    #[error("Sandbox operation '{operation}' failed: {message}")]
    Sandbox {
        operation: &'static str,
        message: String,
    },

    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors from the external patch-repair (LLM) service.
#[derive(Debug, Error)]
pub enum FixerError {
    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM did not return valid patch format")]
    MalformedPatch,
}

/// Errors while assembling the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {key} in {path}: '{value}'")]
    InvalidSetting {
        path: PathBuf,
        key: &'static str,
        value: String,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}
