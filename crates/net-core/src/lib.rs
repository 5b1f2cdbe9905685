//! Safe network apply core
//!
//! Data model, topology analysis, load-order priorities, route model and
//! error taxonomy shared by the configuration store and the apply engine.

pub mod error;
pub mod events;
pub mod priority;
pub mod registry;
pub mod route;
pub mod state;
pub mod topology;
pub mod types;

pub use error::{ApplyError, NetworkError, StoreError, SystemError, TopologyError};
pub use events::WorkflowEvent;
pub use priority::{priority_for, priority_for_parent, ParentInfo, Placement};
pub use registry::ConstructRegistry;
pub use route::{RouteDestination, RouteEntry, RouteSnapshot};
pub use state::{NetworkState, SessionState, SessionStatus, WorkflowState};
pub use topology::{InterfaceTopologyAnalyzer, ParentHint, TopologyAnalysis};
pub use types::*;

/// Result type for safe network apply operations
pub type Result<T> = std::result::Result<T, NetworkError>;
