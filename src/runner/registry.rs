//! Run registry: the only state shared between validation runs.
//!
//! Each run lives in a `RunRecord` owned by the orchestrator task that
//! drives it. Pollers read snapshots; streamers subscribe to the record's
//! event channel, which carries a notification for every appended log line
//! and a final one when the run reaches a terminal status.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use super::models::{
    LogEntry, LogLevel, RunDetails, RunResult, RunSnapshot, RunStatus, ValidationRun,
    now_rfc3339, redact_credentials,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Log(LogEntry),
    Finished(RunStatus),
}

/// A run's state plus its event channel.
pub struct RunRecord {
    state: RwLock<ValidationRun>,
    events: broadcast::Sender<RunEvent>,
    log_file: Option<Mutex<RollingFileAppender>>,
}

impl RunRecord {
    pub fn new(run: ValidationRun) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(run),
            events,
            log_file: None,
        }
    }

    /// Also append every log line to `{dir}/{run_id}.log`. A file that
    /// cannot be opened is reported and the run continues without it.
    pub fn with_log_file(mut self, dir: &Path) -> Self {
        let run_id = self.run_id();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(&run_id)
            .filename_suffix("log")
            .build(dir);
        match appender {
            Ok(appender) => self.log_file = Some(Mutex::new(appender)),
            Err(e) => tracing::warn!(
                run_id = %run_id,
                dir = %dir.display(),
                "Failed to open run log file: {}",
                e
            ),
        }
        self
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ValidationRun> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ValidationRun> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&ValidationRun) -> R) -> R {
        f(&self.read_state())
    }

    /// Mutate the run. Only the owning orchestrator calls this.
    pub fn update<R>(&self, f: impl FnOnce(&mut ValidationRun) -> R) -> R {
        f(&mut self.write_state())
    }

    pub fn run_id(&self) -> String {
        self.read(|run| run.run_id.clone())
    }

    pub fn status(&self) -> RunStatus {
        self.read(|run| run.status)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.read(|run| run.snapshot())
    }

    pub fn details(&self, recent: usize) -> RunDetails {
        self.read(|run| run.details(recent))
    }

    /// Log entries from position `from` onwards.
    pub fn logs_since(&self, from: usize) -> Vec<LogEntry> {
        self.read(|run| run.logs.get(from..).map(<[_]>::to_vec).unwrap_or_default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Append a log line, mirror it to `tracing` and notify streamers.
    /// Credentials embedded in URLs are redacted first.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = redact_credentials(message.as_ref());
        let entry = self.update(|run| {
            let entry = LogEntry {
                seq: run.logs.len(),
                timestamp: now_rfc3339(),
                level,
                message,
            };
            run.logs.push(entry.clone());
            entry
        });

        let run_id = self.run_id();
        match level {
            LogLevel::Debug => tracing::debug!(run_id = %run_id, "{}", entry.message),
            LogLevel::Info => tracing::info!(run_id = %run_id, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(run_id = %run_id, "{}", entry.message),
            LogLevel::Error => tracing::error!(run_id = %run_id, "{}", entry.message),
        }
        self.write_log_file(&entry);
        let _ = self.events.send(RunEvent::Log(entry));
    }

    fn write_log_file(&self, entry: &LogEntry) {
        let Some(file) = &self.log_file else {
            return;
        };
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        let line = format!(
            "{} - {} - {}\n",
            entry.timestamp,
            entry.level.as_str(),
            entry.message
        );
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
            tracing::debug!("Failed to write run log file: {}", e);
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn set_progress(&self, progress: impl Into<String>) {
        let progress = progress.into();
        self.info(format!("Progress: {}", progress));
        self.update(|run| run.progress = progress);
    }

    /// Move the run to a non-terminal status. Returns false if illegal.
    pub fn start(&self) -> bool {
        self.update(|run| run.transition(RunStatus::Running))
    }

    /// Publish the terminal status and result, stamp completion and wake
    /// streamers. Returns false if the run was already terminal.
    pub fn finish(&self, status: RunStatus, result: RunResult) -> bool {
        let finished = self.update(|run| {
            if !run.transition(status) {
                return false;
            }
            run.result = Some(result);
            run.completed_at = Some(now_rfc3339());
            true
        });
        if finished {
            let _ = self.events.send(RunEvent::Finished(status));
        }
        finished
    }
}

/// Keyed store of runs. Swappable for a shared backing store.
pub trait RunStore: Send + Sync {
    fn insert(&self, record: Arc<RunRecord>);
    fn get(&self, run_id: &str) -> Option<Arc<RunRecord>>;
    fn list(&self) -> Vec<Arc<RunRecord>>;

    fn active_count(&self) -> usize {
        self.list()
            .iter()
            .filter(|r| !r.status().is_terminal())
            .count()
    }

    /// Snapshots of the `limit` most recently started runs, newest first.
    fn recent(&self, limit: usize) -> Vec<RunSnapshot> {
        let mut snapshots: Vec<RunSnapshot> = self.list().iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        snapshots.truncate(limit);
        snapshots
    }
}

/// Process-local `RunStore`. Runs are kept until restart.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<String, Arc<RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    fn insert(&self, record: Arc<RunRecord>) {
        self.runs.insert(record.run_id(), record);
    }

    fn get(&self, run_id: &str) -> Option<Arc<RunRecord>> {
        self.runs.get(run_id).map(|entry| Arc::clone(entry.value()))
    }

    fn list(&self) -> Vec<Arc<RunRecord>> {
        self.runs.iter().map(|entry| Arc::clone(entry.value())).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Log(LogEntry),
    Finished(RunStatus),
}

struct StreamState {
    record: Arc<RunRecord>,
    rx: broadcast::Receiver<RunEvent>,
    next_seq: usize,
    pending: std::collections::VecDeque<LogEntry>,
    deadline: tokio::time::Instant,
    done: bool,
}

/// Every log line of a run, past and future, in order. Ends after the
/// run's terminal status (emitted last) or once `ceiling` has elapsed.
pub fn log_stream(record: Arc<RunRecord>, ceiling: Duration) -> impl Stream<Item = StreamItem> {
    // Subscribe before reading the backlog so no line falls in between.
    let rx = record.subscribe();
    let state = StreamState {
        record,
        rx,
        next_seq: 0,
        pending: Default::default(),
        deadline: tokio::time::Instant::now() + ceiling,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(entry) = st.pending.pop_front() {
                return Some((StreamItem::Log(entry), st));
            }
            if st.done {
                return None;
            }

            // Status before backlog: every line logged ahead of the
            // terminal transition is then already in the backlog.
            let status = st.record.status();
            let backlog = st.record.logs_since(st.next_seq);
            if !backlog.is_empty() {
                st.next_seq += backlog.len();
                st.pending.extend(backlog);
                continue;
            }

            if status.is_terminal() {
                st.done = true;
                return Some((StreamItem::Finished(status), st));
            }

            match tokio::time::timeout_at(st.deadline, st.rx.recv()).await {
                Err(_) => return None,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    st.done = true;
                }
                // Log lines are re-read from the record, so a lagged
                // receiver only needs to loop.
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            }
        }
    })
}
