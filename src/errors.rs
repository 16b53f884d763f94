//! Typed error hierarchy for the supervisory loop.
//!
//! Each subsystem gets its own enum so callers can match on error *kind*
//! (the orchestration loop needs this to compare consecutive iteration
//! errors by string, and the broker needs it to decide what fails closed).
//! `ProgrammatorError` composes all of them for the CLI boundary.

use thiserror::Error;

/// Errors from the work-item store (component A).
#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("ticket not found: {id}")]
    TicketNotFound { id: String },

    #[error("phase not found: {name}")]
    PhaseNotFound { name: String },

    #[error("identifier escapes tickets directory: {id}")]
    PathEscape { id: String },

    #[error("external command '{cmd}' exited with status {status}")]
    ExternalCommand { cmd: String, status: i32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the permission broker (component C).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to persist allow-list at {path}: {source}")]
    AllowListWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no interactive handler registered")]
    NoHandler,
}

/// Errors from the agent invoker (component D).
#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent invocation timed out")]
    Timeout,

    #[error("agent invocation cancelled")]
    Cancelled,

    #[error("failed to decode stream line: {line}: {source}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("agent exited with non-zero status {code}")]
    NonZeroExit { code: i32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from configuration resolution (component J).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error composing every subsystem, used at the CLI boundary.
#[derive(Debug, Error)]
pub enum ProgrammatorError {
    #[error(transparent)]
    WorkItem(#[from] WorkItemError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Invoker(#[from] InvokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_error_ticket_not_found_carries_id() {
        let err = WorkItemError::TicketNotFound {
            id: "TKT-1".into(),
        };
        assert!(err.to_string().contains("TKT-1"));
    }

    #[test]
    fn invoker_error_non_zero_exit_carries_code() {
        let err = InvokerError::NonZeroExit { code: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn programmator_error_converts_from_work_item_error() {
        let inner = WorkItemError::PhaseNotFound {
            name: "Implement".into(),
        };
        let err: ProgrammatorError = inner.into();
        assert!(matches!(err, ProgrammatorError::WorkItem(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkItemError::PathEscape { id: "x".into() });
        assert_std_error(&InvokerError::Timeout);
        assert_std_error(&BrokerError::NoHandler);
        assert_std_error(&ConfigError::Invalid("x".into()));
    }
}
