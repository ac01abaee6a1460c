//! Listeners
//!
//! Two listener kinds hook into the engine:
//!
//! - [`ExecutionListener`]: registered on the engine, notified before and
//!   after node entry, flow transitions, execution ends and after every
//!   transaction phase
//! - [`TransactionListener`]: registered on one command context for one
//!   transaction phase
//!
//! Listener failures are logged and never roll back the primary transaction.

use std::error::Error;
use std::fmt;

use super::context::CommandContext;

pub type ListenerError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPhase {
    Before,
    After,
}

/// Lifecycle phases of a command's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    /// Agenda drained, store not yet written
    Committing,
    /// Store commit succeeded
    Committed,
    /// The command failed, nothing written yet
    RollingBack,
    /// Work discarded
    RolledBack,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling-back",
            Self::RolledBack => "rolled-back",
        };
        write!(f, "{}", name)
    }
}

/// Something observable that happened inside a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    NodeEntered {
        process_instance_id: String,
        execution_id: String,
        node_id: String,
    },
    FlowTaken {
        process_instance_id: String,
        execution_id: String,
        flow_id: String,
        source_id: String,
        target_id: String,
    },
    ExecutionEnded {
        process_instance_id: String,
        execution_id: String,
        reason: String,
    },
    Transaction {
        command: &'static str,
        phase: TransactionPhase,
    },
}

/// Engine-wide observer.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, phase: EventPhase, event: &EngineEvent) -> Result<(), ListenerError>;
}

/// Work bound to one transaction phase of one command.
///
/// Committed and rolled-back listeners run inside a fresh command context of
/// their own.
pub trait TransactionListener: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext) -> Result<(), ListenerError>;

    /// Undo hook used when a later listener of the same batch fails.
    fn compensate(&self, _ctx: &mut CommandContext) -> Result<(), ListenerError> {
        Ok(())
    }
}
