//! Session and workflow states

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a configuration test session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Observable state of a session, published through a watch channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Backend error text for failed sessions
    pub detail: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn running() -> Self {
        Self {
            status: SessionStatus::Running,
            detail: None,
            finished_at: None,
        }
    }

    pub fn resolved(status: SessionStatus, detail: Option<String>) -> Self {
        Self {
            status,
            detail,
            finished_at: Some(Utc::now()),
        }
    }
}

/// States of the apply-confirmation workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Testing,
    AwaitingConfirmation,
    TestFailed,
    TimedOutReverted,
    AppliedPermanently,
    KeptTemporary,
    Reverted,
    PersistenceFailed,
    RevertFailed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WorkflowState::Testing | WorkflowState::AwaitingConfirmation
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, next),
            (Testing, TestFailed)
                | (Testing, TimedOutReverted)
                | (Testing, AwaitingConfirmation)
                | (AwaitingConfirmation, AppliedPermanently)
                | (AwaitingConfirmation, KeptTemporary)
                | (AwaitingConfirmation, Reverted)
                | (AwaitingConfirmation, PersistenceFailed)
                | (AwaitingConfirmation, RevertFailed)
        )
    }

    /// What a terminal state means for the host
    pub fn network_state(&self) -> NetworkState {
        match self {
            WorkflowState::Testing | WorkflowState::AwaitingConfirmation => NetworkState::Pending,
            WorkflowState::TestFailed => NetworkState::Unchanged,
            WorkflowState::TimedOutReverted | WorkflowState::Reverted => NetworkState::RolledBack,
            WorkflowState::AppliedPermanently => NetworkState::Active,
            WorkflowState::KeptTemporary => NetworkState::Temporary,
            WorkflowState::PersistenceFailed | WorkflowState::RevertFailed => NetworkState::Unknown,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WorkflowState::Testing => "testing",
            WorkflowState::AwaitingConfirmation => "awaiting confirmation",
            WorkflowState::TestFailed => "test failed",
            WorkflowState::TimedOutReverted => "timed out and reverted",
            WorkflowState::AppliedPermanently => "applied permanently",
            WorkflowState::KeptTemporary => "kept temporarily",
            WorkflowState::Reverted => "reverted",
            WorkflowState::PersistenceFailed => "persistence failed",
            WorkflowState::RevertFailed => "revert failed",
        };
        f.write_str(text)
    }
}

/// Whether a network change is in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkState {
    /// Still being tested or waiting for the operator
    Pending,
    /// Active and persisted
    Active,
    /// Active until the next reboot or reload
    Temporary,
    /// Back to the previous configuration
    RolledBack,
    /// The candidate was rejected before it took effect
    Unchanged,
    /// A persist or revert failed part way
    Unknown,
}
