//! Runtime State Module
//!
//! Data that lives while process instances run.
//!
//! - [`execution`]: Execution nodes and the per-instance execution tree
//! - [`variables`]: Variable values, the type registry, scope storage
//! - [`history`]: Records appended after commits

pub mod execution;
pub mod history;
pub mod variables;

pub use execution::{Execution, ExecutionRef, ExecutionTree};
pub use history::{HistoricActivityInstance, HistoricProcessInstance, HistoricVariableUpdate, HistoryEvent};
pub use variables::{VariableInstance, VariableStore, VariableType, VariableTypes, VariableValue};
