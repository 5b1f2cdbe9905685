//! Bounded configuration test sessions
//!
//! A session races the backend's test of the candidate configuration against
//! a local deadline inside one task. Whichever arm finishes first decides the
//! outcome; the other arm is dropped, which kills a still running test
//! command. The session state lives in a watch channel and only ever leaves
//! `Running` once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use uuid::Uuid;

use safenet_core::{ApplyError, Result, SessionState, SessionStatus};

use crate::backend::ConfigBackend;

/// Grace period on top of the backend's own timeout
pub const DEFAULT_TIMEOUT_BUFFER: Duration = Duration::from_secs(5);

/// Per-host slot allowing a single attempt or session at a time
#[derive(Debug, Default)]
pub struct SessionGate {
    holder: Mutex<Option<Uuid>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the attempt or session holding the slot, if any
    pub fn holder(&self) -> Option<Uuid> {
        *self.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.holder().is_some()
    }

    /// Claim the slot for `id`. It stays taken until the returned
    /// [`GateSlot`] is dropped.
    pub fn reserve(self: &Arc<Self>, id: Uuid) -> Result<GateSlot> {
        let mut holder = self.lock();
        if let Some(current) = *holder {
            return Err(ApplyError::SessionAlreadyRunning {
                session_id: current.to_string(),
            }
            .into());
        }
        *holder = Some(id);
        debug!("Gate reserved by {}", id);
        Ok(GateSlot {
            gate: Arc::clone(self),
            id,
        })
    }

    fn release(&self, id: Uuid) {
        let mut holder = self.lock();
        if *holder == Some(id) {
            *holder = None;
            debug!("Gate released by {}", id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on a [`SessionGate`], released on drop
#[derive(Debug)]
pub struct GateSlot {
    gate: Arc<SessionGate>,
    id: Uuid,
}

impl GateSlot {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for GateSlot {
    fn drop(&mut self) {
        self.gate.release(self.id);
    }
}

/// Starts test sessions against a backend
#[derive(Clone)]
pub struct ConfigTestSession {
    backend: Arc<dyn ConfigBackend>,
    gate: Arc<SessionGate>,
    timeout_buffer: Duration,
}

impl ConfigTestSession {
    pub fn new(backend: Arc<dyn ConfigBackend>, gate: Arc<SessionGate>) -> Self {
        Self {
            backend,
            gate,
            timeout_buffer: DEFAULT_TIMEOUT_BUFFER,
        }
    }

    pub fn with_timeout_buffer(mut self, buffer: Duration) -> Self {
        self.timeout_buffer = buffer;
        self
    }

    pub fn gate(&self) -> &Arc<SessionGate> {
        &self.gate
    }

    /// Reserve the gate and launch a session.
    ///
    /// Fails with `SessionAlreadyRunning` while the gate is held, including
    /// while an earlier session's backend test is still finishing.
    pub fn start(&self, timeout_seconds: u64) -> Result<SessionHandle> {
        let id = Uuid::new_v4();
        let slot = Arc::new(self.gate.reserve(id)?);
        Ok(self.launch(id, slot, timeout_seconds))
    }

    /// Launch a session under a slot the caller already holds. The session
    /// keeps its share of the slot until the backend test has finished or
    /// been cancelled.
    pub fn start_with(&self, slot: Arc<GateSlot>, timeout_seconds: u64) -> SessionHandle {
        self.launch(Uuid::new_v4(), slot, timeout_seconds)
    }

    fn launch(&self, id: Uuid, slot: Arc<GateSlot>, timeout_seconds: u64) -> SessionHandle {
        let (tx, rx) = watch::channel(SessionState::running());
        let started_at = Utc::now();
        let deadline = Duration::from_secs(timeout_seconds) + self.timeout_buffer;
        info!(
            "Started test session {} ({}s, deadline {:?})",
            id, timeout_seconds, deadline
        );

        let backend = self.backend.clone();
        tokio::spawn(async move {
            let (status, detail) = tokio::select! {
                result = backend.try_candidate(timeout_seconds) => match result {
                    Ok(()) => (SessionStatus::Succeeded, None),
                    Err(e) => (SessionStatus::Failed, Some(e.to_string())),
                },
                _ = tokio::time::sleep(deadline) => {
                    warn!("Test session {} timed out, cancelling the backend test", id);
                    (
                        SessionStatus::TimedOut,
                        Some(format!("no result from backend within {:?}", deadline)),
                    )
                }
            };

            // The losing arm is gone by now
            drop(slot);

            if resolve(&tx, status, detail) {
                info!("Test session {} resolved: {:?}", id, status);
            } else {
                debug!("Test session {} was already resolved", id);
            }
        });

        SessionHandle {
            id,
            timeout_seconds,
            started_at,
            state: rx,
        }
    }
}

/// Move the session out of `Running`. Only the first caller succeeds.
fn resolve(
    tx: &watch::Sender<SessionState>,
    status: SessionStatus,
    detail: Option<String>,
) -> bool {
    tx.send_if_modified(|state| {
        if state.status != SessionStatus::Running {
            return false;
        }
        *state = SessionState::resolved(status, detail);
        true
    })
}

/// Caller's view of a started session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    timeout_seconds: u64,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Wait until the session leaves `Running`
    pub async fn wait(&mut self) -> SessionState {
        let resolved = self
            .state
            .wait_for(|state| state.status.is_terminal())
            .await
            .map(|state| state.clone());
        resolved.unwrap_or_else(|_| self.state.borrow().clone())
    }
}
