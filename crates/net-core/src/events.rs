//! Events emitted while a safe-apply attempt progresses

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{SessionStatus, WorkflowState};

/// Event broadcast to UI and audit listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StateChanged {
        attempt_id: Uuid,
        state: WorkflowState,
    },
    SessionStarted {
        attempt_id: Uuid,
        session_id: Uuid,
        timeout_seconds: u64,
    },
    SessionResolved {
        attempt_id: Uuid,
        session_id: Uuid,
        status: SessionStatus,
    },
    RoutesRestored {
        attempt_id: Uuid,
        restored: usize,
        failed: usize,
    },
}

impl WorkflowEvent {
    pub fn attempt_id(&self) -> Uuid {
        match self {
            WorkflowEvent::StateChanged { attempt_id, .. }
            | WorkflowEvent::SessionStarted { attempt_id, .. }
            | WorkflowEvent::SessionResolved { attempt_id, .. }
            | WorkflowEvent::RoutesRestored { attempt_id, .. } => *attempt_id,
        }
    }
}
