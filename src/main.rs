use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use patch_runner::logging::{self, LogSettings};

mod cmd;

#[derive(Parser)]
#[command(name = "patch-runner")]
#[command(
    version,
    about = "Sandboxed patch-validation runner with an LLM-assisted fix loop"
)]
pub struct Cli {
    /// Debug-level logging when RUST_LOG is unset
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the validation HTTP API
    Serve {
        /// Bind address (overrides RUNNER_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides RUNNER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate one request file in the foreground and print the result
    Validate {
        /// Path to a JSON validation request
        request: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_guard = logging::init(&LogSettings::from_env(cli.verbose));

    match &cli.command {
        Commands::Serve { host, port, config } => {
            cmd::cmd_serve(host.clone(), *port, config.as_deref()).await?;
        }
        Commands::Validate { request, config } => {
            let completed = cmd::cmd_validate(request, config.as_deref()).await?;
            if !completed {
                drop(log_guard);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
