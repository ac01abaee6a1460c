//! Task handler boundary: service tasks call a [`TaskHandler`] with a
//! [`DelegateExecution`] view of the execution they run on.

use std::error::Error;

use super::context::CommandContext;
use crate::runtime::{ExecutionRef, VariableValue};
use crate::EngineResult;

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Code run by a service task.
pub trait TaskHandler: Send + Sync {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> HandlerResult;
}

/// Adapts a closure to [`TaskHandler`].
pub struct FnTaskHandler<F>(pub F);

impl<F> TaskHandler for FnTaskHandler<F>
where
    F: Fn(&mut DelegateExecution<'_>) -> HandlerResult + Send + Sync,
{
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> HandlerResult {
        (self.0)(execution)
    }
}

/// The execution a handler runs on, with scoped variable access.
pub struct DelegateExecution<'c> {
    ctx: &'c mut CommandContext,
    execution: ExecutionRef,
    node_id: String,
}

impl<'c> DelegateExecution<'c> {
    pub(crate) fn new(ctx: &'c mut CommandContext, execution: ExecutionRef, node_id: String) -> Self {
        Self {
            ctx,
            execution,
            node_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.execution.execution_id
    }

    pub fn process_instance_id(&self) -> &str {
        &self.execution.process_instance_id
    }

    pub fn current_activity_id(&self) -> &str {
        &self.node_id
    }

    pub fn business_key(&self) -> Option<String> {
        self.ctx
            .tree(&self.execution.process_instance_id)
            .ok()
            .and_then(|tree| tree.root())
            .and_then(|root| root.business_key.clone())
    }

    /// Looks the variable up along the scope chain.
    pub fn get_variable(&self, name: &str) -> Option<VariableValue> {
        self.ctx.get_variable(&self.execution, name).ok().flatten()
    }

    pub fn variables(&self) -> std::collections::BTreeMap<String, VariableValue> {
        self.ctx.variables(&self.execution).unwrap_or_default()
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<VariableValue>) -> EngineResult<()> {
        self.ctx.set_variable(&self.execution, name, value.into())
    }

    pub fn set_variable_local(&mut self, name: &str, value: impl Into<VariableValue>) -> EngineResult<()> {
        self.ctx.set_variable_local(&self.execution, name, value.into())
    }

    /// The surrounding command context, for nested commands.
    pub fn context(&mut self) -> &mut CommandContext {
        self.ctx
    }
}
