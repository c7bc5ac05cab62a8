//! Process-wide `tracing` subscriber setup.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "patch_runner=info,tower_http=info";
const VERBOSE_FILTER: &str = "patch_runner=debug,tower_http=debug";
const LOG_FILE_PREFIX: &str = "patch-runner.log";

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub json: bool,
    /// Daily-rolling log files go here instead of stderr.
    pub dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env(verbose: bool) -> Self {
        Self::from_lookup(verbose, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(verbose: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_filter = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
        Self {
            default_filter: default_filter.to_string(),
            json: lookup("RUNNER_LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            dir: lookup("RUNNER_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file output is flushed.
pub fn init(settings: &LogSettings) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.default_filter));

    let (writer, guard) = match &settings.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let ansi = settings.dir.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.json {
        registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init()
    };
    if let Err(e) = installed {
        eprintln!("Logging already initialized: {}", e);
    }
    guard
}
