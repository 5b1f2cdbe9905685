//! Safe network apply engine
//!
//! Tests a staged configuration under a bounded session, asks the operator
//! to confirm it and preserves routes across the change.

pub mod backend;
pub mod command;
pub mod journal;
pub mod routes;
pub mod session;
pub mod workflow;

#[cfg(test)]
mod tests;

pub use backend::{ConfigBackend, NetplanBackend};
pub use command::{CommandOutput, CommandRunner};
pub use journal::AttemptJournal;
pub use routes::{parse_routes, IpRouteTable, RestoreReport, RouteFailure, RouteGuardian, RouteTable};
pub use session::{ConfigTestSession, GateSlot, SessionGate, SessionHandle, DEFAULT_TIMEOUT_BUFFER};
pub use workflow::{
    ApplyConfirmationWorkflow, ApplyOutcome, ApplyRequest, ConstructChange, PendingConfirmation,
    TestPhase,
};
