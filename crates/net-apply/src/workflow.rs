//! Apply-confirmation workflow
//!
//! ```text
//! Testing -> TestFailed | TimedOutReverted | AwaitingConfirmation
//! AwaitingConfirmation -> AppliedPermanently | KeptTemporary | Reverted
//!                       | PersistenceFailed | RevertFailed
//! ```
//!
//! `begin` stages the requested changes, snapshots routes and runs a test
//! session. A successful test yields a [`PendingConfirmation`] which must be
//! handed back through exactly one of [`ApplyConfirmationWorkflow::apply_permanently`],
//! [`ApplyConfirmationWorkflow::keep_temporary`] or
//! [`ApplyConfirmationWorkflow::revert`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use uuid::Uuid;

use safenet_config::{ensure_renderer, EngineSettings, LayeredConfigWriter, RestoreSummary, StoreBackup};
use safenet_core::{
    ApplyError, NetworkConstruct, NetworkState, ParentInfo, Result, RouteSnapshot, SessionStatus,
    WorkflowEvent, WorkflowState,
};
use safenet_event_bus::EventBus;

use crate::backend::{ConfigBackend, NetplanBackend};
use crate::journal::AttemptJournal;
use crate::routes::{IpRouteTable, RestoreReport, RouteGuardian, RouteTable};
use crate::session::{ConfigTestSession, GateSlot, SessionGate};

/// One change to the configuration store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstructChange {
    /// Create or replace the file of a construct
    Upsert {
        construct: NetworkConstruct,
        parent: ParentInfo,
        content: String,
    },
    /// Remove every file of a construct
    Remove { construct: NetworkConstruct },
}

impl ConstructChange {
    pub fn construct(&self) -> &NetworkConstruct {
        match self {
            ConstructChange::Upsert { construct, .. } | ConstructChange::Remove { construct } => {
                construct
            }
        }
    }
}

/// Request to stage and test a set of changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub changes: Vec<ConstructChange>,
    /// Seconds the backend keeps the candidate before reverting it
    pub timeout_seconds: u64,
    /// Snapshot routes and restore the ones lost after confirmation
    pub preserve_routes: bool,
}

impl ApplyRequest {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            changes: Vec::new(),
            timeout_seconds,
            preserve_routes: true,
        }
    }

    /// Empty request using the configured test duration and route policy
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.test_timeout_seconds).with_preserve_routes(settings.preserve_routes)
    }

    pub fn upsert(
        mut self,
        construct: NetworkConstruct,
        parent: ParentInfo,
        content: impl Into<String>,
    ) -> Self {
        self.changes.push(ConstructChange::Upsert {
            construct,
            parent,
            content: content.into(),
        });
        self
    }

    pub fn remove(mut self, construct: NetworkConstruct) -> Self {
        self.changes.push(ConstructChange::Remove { construct });
        self
    }

    pub fn with_preserve_routes(mut self, preserve: bool) -> Self {
        self.preserve_routes = preserve;
        self
    }
}

/// Terminal result of an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    TestFailed {
        attempt_id: Uuid,
        reason: String,
    },
    TimedOutReverted {
        attempt_id: Uuid,
        timeout_seconds: u64,
    },
    AppliedPermanently {
        attempt_id: Uuid,
        routes: Option<RestoreReport>,
    },
    KeptTemporary {
        attempt_id: Uuid,
        routes: Option<RestoreReport>,
    },
    Reverted {
        attempt_id: Uuid,
        files: RestoreSummary,
    },
    PersistenceFailed {
        attempt_id: Uuid,
        reason: String,
    },
    RevertFailed {
        attempt_id: Uuid,
        reason: String,
    },
}

impl ApplyOutcome {
    pub fn attempt_id(&self) -> Uuid {
        match self {
            ApplyOutcome::TestFailed { attempt_id, .. }
            | ApplyOutcome::TimedOutReverted { attempt_id, .. }
            | ApplyOutcome::AppliedPermanently { attempt_id, .. }
            | ApplyOutcome::KeptTemporary { attempt_id, .. }
            | ApplyOutcome::Reverted { attempt_id, .. }
            | ApplyOutcome::PersistenceFailed { attempt_id, .. }
            | ApplyOutcome::RevertFailed { attempt_id, .. } => *attempt_id,
        }
    }

    pub fn state(&self) -> WorkflowState {
        match self {
            ApplyOutcome::TestFailed { .. } => WorkflowState::TestFailed,
            ApplyOutcome::TimedOutReverted { .. } => WorkflowState::TimedOutReverted,
            ApplyOutcome::AppliedPermanently { .. } => WorkflowState::AppliedPermanently,
            ApplyOutcome::KeptTemporary { .. } => WorkflowState::KeptTemporary,
            ApplyOutcome::Reverted { .. } => WorkflowState::Reverted,
            ApplyOutcome::PersistenceFailed { .. } => WorkflowState::PersistenceFailed,
            ApplyOutcome::RevertFailed { .. } => WorkflowState::RevertFailed,
        }
    }

    pub fn network_state(&self) -> NetworkState {
        self.state().network_state()
    }

    /// Failure carried by this outcome, if any
    pub fn error(&self) -> Option<ApplyError> {
        match self {
            ApplyOutcome::TestFailed { reason, .. } => Some(ApplyError::InvalidConfiguration {
                reason: reason.clone(),
            }),
            ApplyOutcome::TimedOutReverted {
                timeout_seconds, ..
            } => Some(ApplyError::ConnectivityLost {
                timeout_seconds: *timeout_seconds,
            }),
            ApplyOutcome::PersistenceFailed { reason, .. } => {
                Some(ApplyError::PersistenceFailure {
                    reason: reason.clone(),
                })
            }
            ApplyOutcome::RevertFailed { reason, .. } => Some(ApplyError::RevertFailure {
                reason: reason.clone(),
            }),
            ApplyOutcome::AppliedPermanently { routes, .. }
            | ApplyOutcome::KeptTemporary { routes, .. } => {
                routes.as_ref().and_then(RestoreReport::partial_failure)
            }
            ApplyOutcome::Reverted { .. } => None,
        }
    }

    /// Whether the operator's intent was carried out
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::AppliedPermanently { .. }
                | ApplyOutcome::KeptTemporary { .. }
                | ApplyOutcome::Reverted { .. }
        )
    }

    /// Operator-facing description
    pub fn describe(&self) -> String {
        match self {
            ApplyOutcome::TestFailed { reason, .. } => format!(
                "The configuration was rejected and never took effect: {}. Fix it and try again.",
                reason
            ),
            ApplyOutcome::TimedOutReverted {
                timeout_seconds, ..
            } => format!(
                "Connectivity was lost while testing. The previous configuration was restored after {} seconds.",
                timeout_seconds
            ),
            ApplyOutcome::AppliedPermanently { routes, .. } => {
                format!("The configuration is active and persisted.{}", route_note(routes))
            }
            ApplyOutcome::KeptTemporary { routes, .. } => format!(
                "The configuration is active until the next reboot or reload.{}",
                route_note(routes)
            ),
            ApplyOutcome::Reverted { .. } => {
                "The previous configuration was restored.".to_string()
            }
            ApplyOutcome::PersistenceFailed { reason, .. } => format!(
                "The tested configuration could not be persisted: {}. Check the host state before retrying.",
                reason
            ),
            ApplyOutcome::RevertFailed { reason, .. } => format!(
                "Reverting failed: {}. The host may be in neither the old nor the new state.",
                reason
            ),
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn route_note(routes: &Option<RestoreReport>) -> String {
    match routes {
        Some(report) if !report.failed.is_empty() => format!(
            " {} route(s) could not be restored.",
            report.failed.len()
        ),
        Some(report) if !report.restored.is_empty() => {
            format!(" {} route(s) were restored.", report.restored.len())
        }
        _ => String::new(),
    }
}

/// A tested attempt waiting for the operator.
///
/// Consumed by exactly one confirmation call on the workflow. Holds the
/// host's session gate until then.
#[derive(Debug)]
#[must_use = "a pending confirmation must be applied, kept or reverted"]
pub struct PendingConfirmation {
    attempt_id: Uuid,
    session_id: Uuid,
    tested_at: DateTime<Utc>,
    backup: StoreBackup,
    snapshot: Option<RouteSnapshot>,
    slot: Arc<GateSlot>,
}

impl PendingConfirmation {
    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn tested_at(&self) -> DateTime<Utc> {
        self.tested_at
    }

    pub fn snapshot(&self) -> Option<&RouteSnapshot> {
        self.snapshot.as_ref()
    }
}

/// Result of the test phase
#[derive(Debug)]
pub enum TestPhase {
    /// The backend rejected the candidate
    Failed(ApplyOutcome),
    /// The local deadline won the race
    TimedOut(ApplyOutcome),
    /// The candidate held, the operator must decide
    AwaitingConfirmation(PendingConfirmation),
}

impl TestPhase {
    pub fn state(&self) -> WorkflowState {
        match self {
            TestPhase::Failed(outcome) | TestPhase::TimedOut(outcome) => outcome.state(),
            TestPhase::AwaitingConfirmation(_) => WorkflowState::AwaitingConfirmation,
        }
    }

    pub fn into_pending(self) -> Option<PendingConfirmation> {
        match self {
            TestPhase::AwaitingConfirmation(pending) => Some(pending),
            _ => None,
        }
    }
}

/// Drives one safe-apply attempt at a time for a host
pub struct ApplyConfirmationWorkflow {
    writer: LayeredConfigWriter,
    backend: Arc<dyn ConfigBackend>,
    guardian: RouteGuardian,
    session: ConfigTestSession,
    renderer: String,
    event_bus: Option<Arc<EventBus>>,
    journal: Option<AttemptJournal>,
}

impl ApplyConfirmationWorkflow {
    pub fn new(
        writer: LayeredConfigWriter,
        backend: Arc<dyn ConfigBackend>,
        routes: Arc<dyn RouteTable>,
        gate: Arc<SessionGate>,
    ) -> Self {
        let session = ConfigTestSession::new(backend.clone(), gate);
        Self {
            writer,
            backend,
            guardian: RouteGuardian::new(routes),
            session,
            renderer: EngineSettings::default().renderer,
            event_bus: None,
            journal: None,
        }
    }

    /// Netplan and iproute2 backed workflow
    pub fn from_settings(settings: &EngineSettings, gate: Arc<SessionGate>) -> Self {
        let mut workflow = Self::new(
            LayeredConfigWriter::from_settings(settings),
            Arc::new(NetplanBackend::from_settings(settings)),
            Arc::new(IpRouteTable::from_settings(settings)),
            gate,
        )
        .with_timeout_buffer(Duration::from_secs(settings.timeout_buffer_seconds))
        .with_renderer(settings.renderer.clone());

        if let Some(dir) = &settings.journal_dir {
            workflow = workflow.with_journal_dir(dir.clone());
        }
        workflow
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_journal_dir(mut self, dir: PathBuf) -> Self {
        self.journal = Some(AttemptJournal::new(dir));
        self
    }

    pub fn with_timeout_buffer(mut self, buffer: Duration) -> Self {
        self.session = self.session.with_timeout_buffer(buffer);
        self
    }

    pub fn with_renderer(mut self, renderer: impl Into<String>) -> Self {
        self.renderer = renderer.into();
        self
    }

    pub fn writer(&self) -> &LayeredConfigWriter {
        &self.writer
    }

    /// Stage `request` and test it.
    ///
    /// Fails with `SessionAlreadyRunning` while another attempt holds the
    /// gate, before anything is backed up or written. Staging errors restore
    /// the store and are returned as `Err`, no session is started in that
    /// case. Everything after the session starts
    /// is reported through the returned phase.
    pub async fn begin(&self, request: ApplyRequest) -> Result<TestPhase> {
        let attempt_id = Uuid::new_v4();
        // Held until the attempt reaches a terminal state
        let slot = Arc::new(self.session.gate().reserve(attempt_id)?);
        info!(
            "Starting attempt {} with {} change(s)",
            attempt_id,
            request.changes.len()
        );

        let backup = self.writer.backup().await?;
        if let Err(e) = self.stage(&request.changes).await {
            error!("Staging for attempt {} failed: {}", attempt_id, e);
            self.rollback_staging(&backup).await;
            return Err(e);
        }

        let snapshot = if request.preserve_routes {
            Some(match self.guardian.snapshot(attempt_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Could not snapshot routes for attempt {}: {}", attempt_id, e);
                    RouteSnapshot::empty(attempt_id)
                }
            })
        } else {
            None
        };

        self.enter(attempt_id, WorkflowState::Testing, "testing candidate configuration")
            .await;

        let mut handle = self
            .session
            .start_with(slot.clone(), request.timeout_seconds);
        let session_id = handle.id();
        self.publish(WorkflowEvent::SessionStarted {
            attempt_id,
            session_id,
            timeout_seconds: request.timeout_seconds,
        })
        .await;

        let resolved = handle.wait().await;
        self.publish(WorkflowEvent::SessionResolved {
            attempt_id,
            session_id,
            status: resolved.status,
        })
        .await;

        let phase = match resolved.status {
            SessionStatus::Succeeded => TestPhase::AwaitingConfirmation(PendingConfirmation {
                attempt_id,
                session_id,
                tested_at: resolved.finished_at.unwrap_or_else(Utc::now),
                backup,
                snapshot,
                slot,
            }),
            SessionStatus::TimedOut => TestPhase::TimedOut(ApplyOutcome::TimedOutReverted {
                attempt_id,
                timeout_seconds: request.timeout_seconds,
            }),
            SessionStatus::Failed | SessionStatus::Running => {
                TestPhase::Failed(ApplyOutcome::TestFailed {
                    attempt_id,
                    reason: resolved
                        .detail
                        .unwrap_or_else(|| "test did not complete".to_string()),
                })
            }
        };

        let message = match &phase {
            TestPhase::AwaitingConfirmation(_) => "candidate held, waiting for confirmation".to_string(),
            TestPhase::Failed(outcome) | TestPhase::TimedOut(outcome) => outcome.describe(),
        };
        self.transition(attempt_id, WorkflowState::Testing, phase.state(), &message)
            .await;
        Ok(phase)
    }

    /// Make the tested configuration durable, then restore lost routes
    pub async fn apply_permanently(&self, pending: PendingConfirmation) -> ApplyOutcome {
        let attempt_id = pending.attempt_id;
        let outcome = match self.backend.apply().await {
            Ok(()) => {
                let routes = self.restore_routes(&pending).await;
                ApplyOutcome::AppliedPermanently { attempt_id, routes }
            }
            Err(e) => {
                error!("Persisting attempt {} failed: {}", attempt_id, e);
                ApplyOutcome::PersistenceFailed {
                    attempt_id,
                    reason: e.to_string(),
                }
            }
        };
        self.finish(outcome).await
    }

    /// Leave the tested configuration active without persisting it
    pub async fn keep_temporary(&self, pending: PendingConfirmation) -> ApplyOutcome {
        let routes = self.restore_routes(&pending).await;
        let outcome = ApplyOutcome::KeptTemporary {
            attempt_id: pending.attempt_id,
            routes,
        };
        self.finish(outcome).await
    }

    /// Go back to the configuration that was in place before the attempt
    pub async fn revert(&self, pending: PendingConfirmation) -> ApplyOutcome {
        let attempt_id = pending.attempt_id;
        let outcome = match self.reapply_backup(&pending.backup).await {
            Ok(files) => ApplyOutcome::Reverted { attempt_id, files },
            Err(e) => {
                error!("Reverting attempt {} failed: {}", attempt_id, e);
                ApplyOutcome::RevertFailed {
                    attempt_id,
                    reason: e.to_string(),
                }
            }
        };
        self.finish(outcome).await
    }

    async fn stage(&self, changes: &[ConstructChange]) -> Result<()> {
        for change in changes {
            match change {
                ConstructChange::Upsert {
                    construct,
                    parent,
                    content,
                } => {
                    let handle = self.writer.handle_for(construct, *parent)?;
                    self.writer
                        .cleanup_stale_files(&construct.name, construct.kind())
                        .await?;
                    let content = ensure_renderer(content, &self.renderer);
                    self.writer.write(&handle, &content).await?;
                }
                ConstructChange::Remove { construct } => {
                    self.writer.remove(construct).await?;
                }
            }
        }
        Ok(())
    }

    async fn rollback_staging(&self, backup: &StoreBackup) {
        if let Err(e) = self.writer.restore(backup).await {
            error!("Could not restore store backup {}: {}", backup.id, e);
        }
    }

    async fn reapply_backup(&self, backup: &StoreBackup) -> Result<RestoreSummary> {
        let files = self.writer.restore(backup).await?;
        self.backend.apply().await?;
        Ok(files)
    }

    async fn restore_routes(&self, pending: &PendingConfirmation) -> Option<RestoreReport> {
        let snapshot = pending.snapshot.as_ref()?;
        let report = self.guardian.restore_missing(snapshot).await;
        self.publish(WorkflowEvent::RoutesRestored {
            attempt_id: pending.attempt_id,
            restored: report.restored.len(),
            failed: report.failed.len(),
        })
        .await;
        Some(report)
    }

    async fn finish(&self, outcome: ApplyOutcome) -> ApplyOutcome {
        let state = outcome.state();
        if outcome.is_success() {
            info!("Attempt {}: {}", outcome.attempt_id(), state);
        } else {
            warn!("Attempt {}: {}", outcome.attempt_id(), state);
        }
        self.transition(
            outcome.attempt_id(),
            WorkflowState::AwaitingConfirmation,
            state,
            &outcome.describe(),
        )
        .await;
        outcome
    }

    async fn transition(
        &self,
        attempt_id: Uuid,
        from: WorkflowState,
        to: WorkflowState,
        message: &str,
    ) {
        if !from.can_transition_to(to) {
            warn!(
                "Attempt {}: unexpected transition {} -> {}",
                attempt_id, from, to
            );
        }
        self.enter(attempt_id, to, message).await;
    }

    async fn enter(&self, attempt_id: Uuid, state: WorkflowState, message: &str) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(attempt_id, state, message).await {
                warn!("Could not journal attempt {}: {}", attempt_id, e);
            }
        }
        self.publish(WorkflowEvent::StateChanged { attempt_id, state })
            .await;
    }

    async fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            if let Err(e) = bus.publish(event).await {
                warn!("Failed to publish workflow event: {}", e);
            }
        }
    }
}
