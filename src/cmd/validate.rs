//! One-shot validation command: `patch-runner validate <request.json>`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use patch_runner::config::RunnerConfig;
use patch_runner::runner::models::{RunStatus, ValidationRequest};
use patch_runner::runner::orchestrator::Orchestrator;

/// Read and check a request file without touching any external service.
pub fn load_request(path: &Path) -> Result<ValidationRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    let request: ValidationRequest = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse request file {}", path.display()))?;
    request
        .validate()
        .map_err(|reason| anyhow::anyhow!("Invalid validation request: {}", reason))?;
    Ok(request)
}

/// Run a single validation in the foreground and print the final snapshot.
/// Returns whether the run completed.
pub async fn cmd_validate(request_path: &Path, config: Option<&Path>) -> Result<bool> {
    let request = load_request(request_path)?;
    let config = RunnerConfig::load(config).context("Failed to load configuration")?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    let record = orchestrator.submit(request)?;
    let status = orchestrator.run(record.clone()).await;

    let snapshot = serde_json::to_string_pretty(&record.snapshot())?;
    println!("{}", snapshot);
    Ok(status == RunStatus::Completed)
}
