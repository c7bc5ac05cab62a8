//! HTTP service command: `patch-runner serve`.

use std::path::Path;

use anyhow::{Context, Result};

use patch_runner::config::RunnerConfig;

pub async fn cmd_serve(host: Option<String>, port: Option<u16>, config: Option<&Path>) -> Result<()> {
    let mut config = RunnerConfig::load(config).context("Failed to load configuration")?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    patch_runner::server::start_server(config).await
}
