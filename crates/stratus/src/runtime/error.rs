//! Runtime error taxonomy.

use serde::Serialize;
use thiserror::Error;

use super::session::SessionState;

/// Errors produced by the repository runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Malformed command or path; fails the operation before any process is
    /// touched.
    #[error("invalid configuration for repository {id}: {reason}")]
    ConfigInvalid { id: String, reason: String },

    /// Spawn attempted while a session is already registered for the id.
    /// The per-repository lock makes this a guard, not an expected path.
    #[error("repository {0} already has a registered session")]
    AlreadyRunning(String),

    /// The OS failed to create the child process.
    #[error("failed to spawn process for repository {id}: {source}")]
    SpawnFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// An install/build/start command exited non-zero.
    #[error("{stage} stage failed for repository {id} (exit code {code:?})")]
    StageFailed {
        id: String,
        stage: SessionState,
        code: Option<i32>,
    },

    /// The start-stage process exited after reaching Running.
    #[error("process for repository {id} exited unexpectedly (exit code {code:?})")]
    ProcessCrashed { id: String, code: Option<i32> },

    /// One or more teardown steps failed; cleanup continued regardless.
    #[error("teardown for repository {} completed with {} failed step(s)", .0.repository_id, .0.failures.len())]
    TeardownPartialFailure(TeardownReport),

    /// A source-control or proxy collaborator call failed.
    #[error("collaborator call failed: {0}")]
    CollaboratorUnavailable(String),

    /// Persistence-layer failure inside a runtime operation.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of the six-step deletion teardown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub repository_id: String,
    pub failures: Vec<TeardownStepFailure>,
}

/// One failed teardown step.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownStepFailure {
    pub step: &'static str,
    pub error: String,
}

impl TeardownReport {
    pub fn new(repository_id: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            failures: Vec::new(),
        }
    }

    /// Record a step outcome, logging failures without aborting.
    pub fn record<T, E: std::fmt::Display>(
        &mut self,
        step: &'static str,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(
                    "Teardown step '{}' failed for repository {}: {}",
                    step,
                    self.repository_id,
                    e
                );
                self.failures.push(TeardownStepFailure {
                    step,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
