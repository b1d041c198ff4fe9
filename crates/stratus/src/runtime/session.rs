//! Process sessions: one install→build→start pipeline per repository.
//!
//! A session owns the child processes it spawns. The install and build
//! stages run to completion in order; the start stage is the long-running
//! application server whose exit (outside of a requested teardown) marks the
//! session as failed. Sessions never restart themselves; restart is a
//! caller-driven action.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::repository::RepositoryRecord;

use super::error::RuntimeError;
use super::logs::{LogSink, LogStream};

/// Lifecycle state of a process session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session created, pipeline not yet running.
    Pending,
    /// Install command is running.
    Installing,
    /// Build command is running.
    Building,
    /// Start command is being spawned.
    Starting,
    /// Application server is up.
    Running,
    /// Deliberately stopped by a teardown.
    Stopped,
    /// A stage failed, the spawn failed, or the server crashed.
    Failed,
}

impl SessionState {
    /// Whether the session may still have a live process.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Installing => write!(f, "installing"),
            SessionState::Building => write!(f, "building"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// A spawned pipeline for one repository.
pub struct ProcessSession {
    repository_id: String,
    state: RwLock<SessionState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    exit_code: RwLock<Option<i32>>,
    /// PID of the currently running stage child, for signal delivery.
    current_pid: Mutex<Option<u32>>,
    /// Set by teardown before any signal is sent, so the pipeline can tell a
    /// requested stop from a crash.
    shutdown: AtomicBool,
    pipeline: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<LogSink>,
}

/// One pipeline stage: the state it runs under and its shell command.
#[derive(Debug, Clone)]
struct Stage {
    state: SessionState,
    command: String,
}

impl ProcessSession {
    /// Spawn the pipeline for `config`, working inside `source_dir`.
    ///
    /// The first stage's child process is created before this returns, so an
    /// OS-level spawn failure surfaces synchronously to the caller. The rest
    /// of the pipeline runs in a background task; the caller is expected to
    /// hold the repository's registry slot lock.
    pub async fn spawn(
        config: &RepositoryRecord,
        sink: Arc<LogSink>,
        source_dir: &Path,
    ) -> Result<Arc<Self>, RuntimeError> {
        let stages = build_stages(config)?;
        let work_dir = stage_work_dir(source_dir, &config.root_directory);

        let session = Arc::new(Self {
            repository_id: config.id.clone(),
            state: RwLock::new(SessionState::Pending),
            started_at: RwLock::new(None),
            exit_code: RwLock::new(None),
            current_pid: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            pipeline: Mutex::new(None),
            sink,
        });

        let first = &stages[0];
        session.set_state(first.state).await;
        session
            .sink
            .append(
                LogStream::System,
                format!("{} stage: {}", first.state, first.command),
            )
            .await;

        let first_child = spawn_stage_child(&first.command, &work_dir, config)
            .map_err(|source| RuntimeError::SpawnFailed {
                id: config.id.clone(),
                source,
            })?;
        *session.current_pid.lock().await = first_child.id();
        if first.state == SessionState::Starting {
            session.mark_running().await;
        }

        info!(
            "Spawned {} stage for repository {} (pid {:?})",
            first.state,
            config.id,
            first_child.id()
        );

        let handle = tokio::spawn(run_pipeline(
            session.clone(),
            first_child,
            stages,
            work_dir,
            config.clone(),
        ));
        *session.pipeline.lock().await = Some(handle);

        Ok(session)
    }

    /// Request termination: SIGTERM to the current stage's process group,
    /// SIGKILL after the grace period. Idempotent; a second call is a no-op.
    pub async fn teardown(&self, grace: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);

        let handle = self.pipeline.lock().await.take();
        let Some(mut handle) = handle else {
            // Already torn down, or the pipeline never detached from spawn.
            return;
        };

        if !handle.is_finished() {
            self.signal_current(libc::SIGTERM).await;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    "Repository {} did not stop within {:?}, sending SIGKILL",
                    self.repository_id, grace
                );
                self.signal_current(libc::SIGKILL).await;
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!(
                        "Pipeline for repository {} is unresponsive, aborting",
                        self.repository_id
                    );
                    handle.abort();
                    self.finish(SessionState::Stopped, None).await;
                }
            }
        } else {
            let _ = handle.await;
        }

        self.sink.close().await;
        debug!("Teardown complete for repository {}", self.repository_id);
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().await
    }

    pub async fn exit_code(&self) -> Option<i32> {
        *self.exit_code.read().await
    }

    /// Whether the session still counts as holding a live process.
    pub async fn is_live(&self) -> bool {
        self.state().await.is_live()
    }

    pub fn sink(&self) -> &Arc<LogSink> {
        &self.sink
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn mark_running(&self) {
        self.set_state(SessionState::Running).await;
        *self.started_at.write().await = Some(Utc::now());
    }

    /// Transition to a terminal state unless one was already reached.
    async fn finish(&self, state: SessionState, code: Option<i32>) {
        {
            let mut guard = self.state.write().await;
            if !guard.is_live() {
                return;
            }
            *guard = state;
        }
        if code.is_some() {
            *self.exit_code.write().await = code;
        }
    }

    async fn signal_current(&self, signal: libc::c_int) {
        let pid = *self.current_pid.lock().await;
        if let Some(pid) = pid {
            // Stages run in their own process group; signal the whole group
            // so children of the shell are reached too.
            unsafe {
                libc::kill(-(pid as libc::pid_t), signal);
            }
        }
    }
}

/// Drive the pipeline after the first child was spawned synchronously.
async fn run_pipeline(
    session: Arc<ProcessSession>,
    first_child: Child,
    stages: Vec<Stage>,
    work_dir: PathBuf,
    config: RepositoryRecord,
) {
    let mut carried = Some(first_child);

    for stage in &stages {
        let is_start = stage.state == SessionState::Starting;

        let child = match carried.take() {
            Some(child) => child,
            None => {
                session.set_state(stage.state).await;
                session
                    .sink
                    .append(
                        LogStream::System,
                        format!("{} stage: {}", stage.state, stage.command),
                    )
                    .await;
                match spawn_stage_child(&stage.command, &work_dir, &config) {
                    Ok(child) => {
                        *session.current_pid.lock().await = child.id();
                        if is_start {
                            session.mark_running().await;
                        }
                        child
                    }
                    Err(e) => {
                        session
                            .sink
                            .append(
                                LogStream::System,
                                format!("{} stage could not be spawned: {}", stage.state, e),
                            )
                            .await;
                        session.finish(SessionState::Failed, None).await;
                        return;
                    }
                }
            }
        };

        let code = wait_with_output(child, &session).await;
        *session.current_pid.lock().await = None;

        if session.shutdown.load(Ordering::SeqCst) {
            session
                .sink
                .append(LogStream::System, "stopped by request")
                .await;
            session.finish(SessionState::Stopped, code).await;
            return;
        }

        if is_start {
            // The server is not supposed to exit on its own.
            let error = RuntimeError::ProcessCrashed {
                id: session.repository_id.clone(),
                code,
            };
            warn!("{}", error);
            session
                .sink
                .append(LogStream::System, error.to_string())
                .await;
            session.finish(SessionState::Failed, code).await;
            return;
        }

        if code != Some(0) {
            let error = RuntimeError::StageFailed {
                id: session.repository_id.clone(),
                stage: stage.state,
                code,
            };
            warn!("{}", error);
            session
                .sink
                .append(LogStream::System, error.to_string())
                .await;
            session.finish(SessionState::Failed, code).await;
            return;
        }
    }
}

/// Wait for a stage child while forwarding its output to the sink.
async fn wait_with_output(mut child: Child, session: &Arc<ProcessSession>) -> Option<i32> {
    let stdout_task = child.stdout.take().map(|stream| {
        let sink = session.sink.clone();
        tokio::spawn(forward_stream(stream, sink, LogStream::Stdout))
    });
    let stderr_task = child.stderr.take().map(|stream| {
        let sink = session.sink.clone();
        tokio::spawn(forward_stream(stream, sink, LogStream::Stderr))
    });

    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(
                "Error waiting for stage process of repository {}: {}",
                session.repository_id, e
            );
            None
        }
    };

    // Drain remaining output; the readers finish at EOF.
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    code
}

async fn forward_stream<R>(stream: R, sink: Arc<LogSink>, kind: LogStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.append(kind, line).await;
    }
}

/// Build the ordered stage list; empty install/build commands are skipped.
fn build_stages(config: &RepositoryRecord) -> Result<Vec<Stage>, RuntimeError> {
    let mut stages = Vec::with_capacity(3);
    if !config.install_command.trim().is_empty() {
        stages.push(Stage {
            state: SessionState::Installing,
            command: config.install_command.clone(),
        });
    }
    if !config.build_command.trim().is_empty() {
        stages.push(Stage {
            state: SessionState::Building,
            command: config.build_command.clone(),
        });
    }
    if config.start_command.trim().is_empty() {
        return Err(RuntimeError::ConfigInvalid {
            id: config.id.clone(),
            reason: "start command must not be empty".to_string(),
        });
    }
    stages.push(Stage {
        state: SessionState::Starting,
        command: config.start_command.clone(),
    });
    Ok(stages)
}

/// Working directory for stage children: the root directory inside the
/// fetched source tree.
fn stage_work_dir(source_dir: &Path, root_directory: &str) -> PathBuf {
    let relative = root_directory.trim_start_matches('/');
    if relative.is_empty() {
        source_dir.to_path_buf()
    } else {
        source_dir.join(relative)
    }
}

fn spawn_stage_child(
    command: &str,
    work_dir: &Path,
    config: &RepositoryRecord,
) -> std::io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .env("STRATUS_REPOSITORY_ID", &config.id)
        .env("PORT", config.port.to_string());

    // Repository variables win over the inherited host environment.
    for (key, value) in &config.environment {
        cmd.env(key, value);
    }

    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::logs::LogSink;
    use tempfile::TempDir;

    fn test_config(install: &str, build: &str, start: &str) -> RepositoryRecord {
        RepositoryRecord {
            id: "repo-1".to_string(),
            install_command: install.to_string(),
            build_command: build.to_string(),
            start_command: start.to_string(),
            root_directory: "/".to_string(),
            ..RepositoryRecord::default()
        }
    }

    async fn test_sink(dir: &TempDir) -> Arc<LogSink> {
        Arc::new(LogSink::open("repo-1", dir.path()).await.unwrap())
    }

    async fn wait_for_state(
        session: &Arc<ProcessSession>,
        want: SessionState,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if session.state().await == want {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_pipeline_reaches_running_and_stops_on_teardown() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("echo installing", "echo building", "sleep 30");

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();

        assert!(wait_for_state(&session, SessionState::Running, Duration::from_secs(5)).await);
        assert!(session.started_at().await.is_some());

        session.teardown(Duration::from_secs(5)).await;
        assert_eq!(session.state().await, SessionState::Stopped);

        let history = session.sink().history().await.unwrap();
        assert!(history.contains("installing"));
        assert!(history.contains("building"));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("", "", "sleep 30");

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();

        session.teardown(Duration::from_secs(5)).await;
        assert_eq!(session.state().await, SessionState::Stopped);

        // Second call must be a no-op, not an error or a hang.
        session.teardown(Duration::from_secs(5)).await;
        assert_eq!(session.state().await, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_failing_install_never_reaches_start() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("false", "", "sleep 30");

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();

        assert!(wait_for_state(&session, SessionState::Failed, Duration::from_secs(5)).await);
        assert!(session.started_at().await.is_none());

        let history = session.sink().history().await.unwrap();
        let failures = history
            .lines()
            .filter(|line| line.contains("stage failed"))
            .count();
        assert_eq!(failures, 1);
        assert!(!history.contains("starting stage"));
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("", "", "exit 3");

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();

        assert!(wait_for_state(&session, SessionState::Failed, Duration::from_secs(5)).await);
        assert_eq!(session.exit_code().await, Some(3));

        let history = session.sink().history().await.unwrap();
        assert!(history.contains("exited unexpectedly"));
    }

    #[tokio::test]
    async fn test_teardown_preempts_inflight_install() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("sleep 30", "", "sleep 30");

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();
        assert_eq!(session.state().await, SessionState::Installing);

        session.teardown(Duration::from_secs(5)).await;
        assert_eq!(session.state().await, SessionState::Stopped);
        assert!(session.started_at().await.is_none());
    }

    #[tokio::test]
    async fn test_repository_environment_wins_over_host() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;

        // SAFETY: test-local env mutation before any child is spawned.
        unsafe { std::env::set_var("STRATUS_TEST_VALUE", "host") };
        let mut config = test_config("", "", "echo value=$STRATUS_TEST_VALUE");
        config
            .environment
            .insert("STRATUS_TEST_VALUE".to_string(), "repo".to_string());

        let session = ProcessSession::spawn(&config, sink, dir.path())
            .await
            .unwrap();
        assert!(wait_for_state(&session, SessionState::Failed, Duration::from_secs(5)).await);

        let history = session.sink().history().await.unwrap();
        assert!(history.contains("value=repo"));
    }

    #[tokio::test]
    async fn test_empty_start_command_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = test_sink(&dir).await;
        let config = test_config("echo hi", "", "");

        let result = ProcessSession::spawn(&config, sink, dir.path()).await;
        assert!(matches!(result, Err(RuntimeError::ConfigInvalid { .. })));
    }
}
