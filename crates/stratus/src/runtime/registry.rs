//! In-memory registry of live process sessions.
//!
//! Every repository id maps to a slot whose async mutex serializes spawn,
//! restart, and teardown for that repository. A separate lock-free mirror of
//! currently installed sessions keeps status and log reads from ever waiting
//! behind a slow teardown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use log::info;
use tokio::sync::Mutex;

use super::error::RuntimeError;
use super::session::ProcessSession;

/// Mutable per-repository state, guarded by the slot mutex.
#[derive(Default)]
pub struct SlotState {
    session: Option<Arc<ProcessSession>>,
}

impl SlotState {
    pub fn session(&self) -> Option<&Arc<ProcessSession>> {
        self.session.as_ref()
    }
}

/// One repository's slot. Holding the lock gives exclusive rights to change
/// which session (if any) is installed for that repository.
pub struct RepoSlot {
    pub state: Mutex<SlotState>,
}

impl RepoSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
        }
    }
}

/// Registry of repository slots and their installed sessions.
#[derive(Default)]
pub struct RuntimeRegistry {
    slots: DashMap<String, Arc<RepoSlot>>,
    /// Mirror of installed sessions for lock-free reads.
    live: DashMap<String, Arc<ProcessSession>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the slot for a repository id.
    pub fn slot(&self, repository_id: &str) -> Arc<RepoSlot> {
        self.slots
            .entry(repository_id.to_string())
            .or_insert_with(|| Arc::new(RepoSlot::new()))
            .clone()
    }

    /// Look up the installed session without touching any slot lock.
    pub fn get(&self, repository_id: &str) -> Option<Arc<ProcessSession>> {
        self.live.get(repository_id).map(|s| s.clone())
    }

    /// Install a session into a locked slot. Rejects the call if a live
    /// session is already installed.
    pub fn install_session(
        &self,
        repository_id: &str,
        state: &mut SlotState,
        session: Arc<ProcessSession>,
    ) -> Result<(), RuntimeError> {
        if state.session.is_some() {
            return Err(RuntimeError::AlreadyRunning(repository_id.to_string()));
        }
        state.session = Some(session.clone());
        self.live.insert(repository_id.to_string(), session);
        Ok(())
    }

    /// Remove the installed session from a locked slot, returning it so the
    /// caller can tear it down.
    pub fn detach_session(
        &self,
        repository_id: &str,
        state: &mut SlotState,
    ) -> Option<Arc<ProcessSession>> {
        self.live.remove(repository_id);
        state.session.take()
    }

    /// Drop the slot itself. Only used after repository deletion, once the
    /// slot lock has been released.
    pub fn remove_slot(&self, repository_id: &str) {
        self.live.remove(repository_id);
        self.slots.remove(repository_id);
    }

    /// Ids of repositories with an installed session.
    pub fn ids(&self) -> Vec<String> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Tear down every installed session concurrently. Used on shutdown.
    pub async fn shutdown_all(&self, grace: Duration) {
        let ids = self.ids();
        if ids.is_empty() {
            return;
        }
        info!("Shutting down {} running session(s)", ids.len());

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            let slot = self.slot(&id);
            let registry_live = &self.live;
            tasks.push(async move {
                let mut state = slot.state.lock().await;
                registry_live.remove(&id);
                if let Some(session) = state.session.take() {
                    drop(state);
                    session.teardown(grace).await;
                }
            });
        }
        join_all(tasks).await;
    }
}
