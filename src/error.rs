//! Engine Errors
//!
//! Error taxonomy shared by every layer of the engine:
//!
//! - [`DefinitionError`]: the graph cannot be interpreted (fatal, non-retryable)
//! - [`EngineError::Evaluation`]: a guard or a behavior failed while running
//! - [`StoreError`]: persistence failures, including optimistic-lock conflicts
//!
//! A failed command always returns the originating error; the context
//! (execution id, node id) travels inside the variant.

use thiserror::Error;

pub use crate::store::StoreError;

/// Errors caused by a process graph that cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("no outgoing sequence flow of node '{node_id}' could be selected (execution {execution_id}) and no default flow is defined")]
    NoOutgoingFlow {
        node_id: String,
        execution_id: String,
    },

    #[error("node '{node_id}' does not support triggering (execution {execution_id})")]
    NotTriggerable {
        node_id: String,
        execution_id: String,
    },

    #[error("process '{process_id}' has no node '{node_id}'")]
    UnknownNode { process_id: String, node_id: String },

    #[error("scope '{scope}' of process '{process_id}' has no start event")]
    MissingStartEvent { process_id: String, scope: String },
}

/// Top-level error returned by every engine command.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("evaluation failed at node '{node_id}' (execution {execution_id}): {message}")]
    Evaluation {
        node_id: String,
        execution_id: String,
        message: String,
    },

    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("process definition '{0}' is not deployed")]
    DefinitionNotFound(String),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("process instance '{0}' not found")]
    ProcessInstanceNotFound(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("no job handler registered for type '{0}'")]
    UnknownJobHandler(String),

    #[error("no variable type can store the value of '{0}'")]
    UnsupportedVariableType(String),

    #[error("job handler failed: {0}")]
    JobFailed(String),

    #[error("command exceeded the limit of {limit} agenda operations")]
    OperationLimitExceeded { limit: usize },

    #[error("transaction listener failed: {0}")]
    Listener(String),

    #[error("job worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Returns true when the error is a version conflict at commit time.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::Store(StoreError::OptimisticLock { .. }))
    }

    /// Returns true for errors caused by the process graph itself.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, Self::Definition(_))
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_message_carries_context() {
        let err = EngineError::from(DefinitionError::NoOutgoingFlow {
            node_id: "gw".to_string(),
            execution_id: "7".to_string(),
        });
        let message = err.to_string();
        assert!(message.contains("gw"));
        assert!(message.contains("7"));
        assert!(err.is_definition_error());
        assert!(!err.is_optimistic_lock());
    }

    #[test]
    fn test_optimistic_lock_detection() {
        let err = EngineError::from(StoreError::OptimisticLock {
            entity: "job",
            id: "3".to_string(),
        });
        assert!(err.is_optimistic_lock());
        assert!(err.to_string().contains("job '3'"));
    }

    #[test]
    fn test_evaluation_error_display() {
        let err = EngineError::Evaluation {
            node_id: "check".to_string(),
            execution_id: "12".to_string(),
            message: "unknown variable 'x'".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "evaluation failed at node 'check' (execution 12): unknown variable 'x'"
        );
    }
}
