//! Process Execution Module
//!
//! The interpreter that moves process instances through their graphs.
//!
//! # Architecture
//!
//! - [`engine`]: Public entry point; deploys processes and runs commands
//! - [`command`]: Every engine operation as a command
//! - [`context`]: Per-command state and the transaction boundary
//! - [`agenda`]: Queue of pending interpreter operations
//! - [`operations`]: The agenda loop and tree transitions
//! - [`behavior`]: What each node kind does
//! - [`deployment`]: Indexed, deployed process graphs
//! - [`delegate`]: Service task handler boundary
//! - [`listener`]: Execution and transaction listeners

pub mod agenda;
pub mod behavior;
pub mod command;
pub mod context;
pub mod delegate;
pub mod deployment;
pub mod engine;
pub mod listener;
mod operations;

pub use agenda::Operation;
pub use behavior::Behavior;
pub use command::{
    ClaimJobCmd, Command, DeleteProcessInstanceCmd, ExecuteJobCmd, ReportJobFailureCmd, ScheduleJobCmd,
    SetJobRetriesCmd, SetVariableCmd, StartProcessCmd, TriggerExecutionCmd, UnlockJobCmd,
};
pub use context::CommandContext;
pub use delegate::{DelegateExecution, FnTaskHandler, HandlerResult, TaskHandler};
pub use engine::{ProcessEngine, ProcessEngineBuilder, ProcessInstanceState};
pub use listener::{
    EngineEvent, EventPhase, ExecutionListener, ListenerError, TransactionListener, TransactionPhase,
};
