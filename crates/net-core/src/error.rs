//! Error types for safe network apply operations

use thiserror::Error;

/// Main error type for safe network apply operations
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Configuration store error: {0}")]
    Store(#[from] StoreError),

    #[error("System error: {0}")]
    System(#[from] SystemError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Violations of the construct data model
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Invalid interface name: {name}")]
    InvalidName { name: String },

    #[error("Construct {name} is a {existing} and cannot become a {requested}")]
    KindChange {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Parent {parent} of {name} is not defined")]
    UnknownParent { name: String, parent: String },

    #[error("Construct {name} requires a parent")]
    MissingParent { name: String },

    #[error("Parent chain of {name} forms a cycle through {through}")]
    Cycle { name: String, through: String },

    #[error("Unknown construct: {name}")]
    UnknownConstruct { name: String },

    #[error("Construct {name} is still the parent of {dependent}")]
    InUse { name: String, dependent: String },

    #[error("Invalid VLAN id {id} for {name}")]
    InvalidVlanId { name: String, id: String },
}

/// Layered configuration store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup of {path} is corrupt (checksum mismatch)")]
    ChecksumMismatch { path: String },

    #[error("Invalid configuration document for {name}: {reason}")]
    InvalidDocument { name: String, reason: String },
}

/// System operation errors
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Command execution failed: {command}")]
    CommandFailed { command: String },

    #[error("Command {command} exited with {code:?}: {stderr}")]
    CommandExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {command}")]
    CommandTimeout { command: String },

    #[error("Unparseable route: {line}")]
    RouteParse { line: String },
}

/// Safe-apply failure taxonomy.
///
/// `InvalidConfiguration`, `PersistenceFailure` and `RevertFailure` are
/// returned to the caller as part of an outcome. `ConnectivityLost` is
/// informational, the backend has already reverted. `RouteRestorationPartialFailure`
/// is only ever logged and reported, it never fails a workflow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Candidate configuration rejected: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Connectivity lost during test, configuration reverted after {timeout_seconds}s")]
    ConnectivityLost { timeout_seconds: u64 },

    #[error("Failed to persist configuration: {reason}")]
    PersistenceFailure { reason: String },

    #[error("Failed to revert configuration: {reason}")]
    RevertFailure { reason: String },

    #[error("{failed} route(s) could not be restored")]
    RouteRestorationPartialFailure { failed: usize },

    #[error("A configuration test session is already running: {session_id}")]
    SessionAlreadyRunning { session_id: String },
}

impl ApplyError {
    /// Severity used when surfacing the error to an operator, higher is worse
    pub fn severity(&self) -> u8 {
        match self {
            ApplyError::RouteRestorationPartialFailure { .. } => 1,
            ApplyError::ConnectivityLost { .. } => 2,
            ApplyError::InvalidConfiguration { .. } => 3,
            ApplyError::SessionAlreadyRunning { .. } => 3,
            ApplyError::PersistenceFailure { .. } => 4,
            ApplyError::RevertFailure { .. } => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_failure_is_most_severe() {
        let revert = ApplyError::RevertFailure {
            reason: "netplan apply failed".to_string(),
        };
        let others = [
            ApplyError::InvalidConfiguration {
                reason: "bad yaml".to_string(),
            },
            ApplyError::ConnectivityLost {
                timeout_seconds: 60,
            },
            ApplyError::PersistenceFailure {
                reason: "disk full".to_string(),
            },
            ApplyError::RouteRestorationPartialFailure { failed: 2 },
        ];

        for other in &others {
            assert!(revert.severity() > other.severity(), "{:?}", other);
        }
    }

    #[test]
    fn test_error_conversion() {
        let err: NetworkError = TopologyError::UnknownConstruct {
            name: "eth9".to_string(),
        }
        .into();
        assert!(matches!(err, NetworkError::Topology(_)));
        assert_eq!(
            err.to_string(),
            "Topology error: Unknown construct: eth9"
        );
    }
}
