//! ProcRunner - Business Process Execution Engine
//!
//! An embeddable engine that runs process graphs: sequence flows, exclusive,
//! parallel and inclusive gateways, wait states, embedded sub-processes,
//! timers and asynchronous continuations. Every API call runs as a command in
//! its own transaction boundary over an optimistic-locking store, and
//! deferred work is kept as durable, retryable jobs.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`process`]: Process definitions, YAML loading, validation, guards
//! - [`execution`]: The engine, commands, agenda and node behaviors
//! - [`runtime`]: Execution tree, variables and history records
//! - [`jobs`]: Job records, retry policy and the job executor
//! - [`store`]: Persistence with optimistic locking, snapshots
//! - [`monitoring`]: Execution timeline
//! - [`config`], [`clock`], [`error`]: Ambient plumbing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use procrunner::{load_process, JobExecutor, ProcessEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a process from YAML
//!     let definition = load_process("order.yaml")?;
//!
//!     // Deploy it on an engine
//!     let engine = ProcessEngine::default();
//!     engine.register_task_fn("charge_card", |execution| {
//!         execution.set_variable("charged", true)?;
//!         Ok(())
//!     });
//!     let id = engine.deploy(definition)?;
//!
//!     // Start an instance and run its jobs
//!     let instance = engine.start_process(&id, BTreeMap::new())?;
//!     JobExecutor::new(engine.clone()).run_until_idle()?;
//!     println!("{:?}", engine.process_instance_state(&instance)?);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod execution;
pub mod jobs;
pub mod monitoring;
pub mod process;
pub mod runtime;
pub mod store;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{DefinitionError, EngineError, EngineResult};
pub use execution::{ProcessEngine, ProcessEngineBuilder, ProcessInstanceState};
pub use jobs::JobExecutor;
pub use process::parser::load_process;
pub use process::ProcessDefinition;
pub use runtime::VariableValue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "ProcRunner";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{FlowNode, NodeKind};

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "ProcRunner");
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = ProcessDefinition::new("p").node(FlowNode::new("start", NodeKind::StartEvent));
        assert_eq!(definition.id, "p");
        assert_eq!(definition.len(), 1);
    }

    #[test]
    fn test_module_exports_engine() {
        let engine = ProcessEngine::new(EngineConfig::default());
        assert!(engine.deployed_processes().is_empty());
    }
}
