//! Node Behaviors
//!
//! Every node kind maps to one [`Behavior`] variant when a definition is
//! deployed. Capabilities are split into traits:
//!
//! - [`ActivityBehavior`]: entering the node (all variants)
//! - [`TriggerableBehavior`]: resuming a waiting execution
//! - [`InactiveBehavior`]: re-evaluation from the background sweep
//!
//! A variant without a capability returns None from the accessor, so the
//! interpreter never has to guess.

use log::debug;

use super::agenda::Operation;
use super::context::CommandContext;
use super::delegate::DelegateExecution;
use crate::error::{DefinitionError, EngineError, EngineResult};
use crate::process::{FlowNode, NodeKind};
use crate::runtime::ExecutionRef;

/// Entering a node.
pub trait ActivityBehavior: Send + Sync {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()>;
}

/// Resuming an execution that waits in a node.
pub trait TriggerableBehavior: ActivityBehavior {
    fn trigger(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()>;
}

/// Work for executions that sit inactive in a node.
pub trait InactiveBehavior: Send + Sync {
    fn execute_inactive(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()>;
}

/// How outgoing flows are chosen when leaving a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSelection {
    /// First flow whose guard holds, then the default flow
    FirstMatching,
    /// Every flow whose guard holds, the default flow when none does
    AllMatching,
    /// Every flow, guards ignored
    All,
}

/// Join semantics of a converging gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Parallel,
    Inclusive,
}

fn leave(ctx: &mut CommandContext, execution: &ExecutionRef) {
    ctx.plan(Operation::TakeOutgoingFlows {
        target: execution.clone(),
        skip_async: false,
    });
}

/// Leaves immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ActivityBehavior for PassThrough {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        leave(ctx, execution);
        Ok(())
    }
}

/// Waits until triggered.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitState;

impl ActivityBehavior for WaitState {
    fn execute(&self, _ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        debug!("Execution {} waits for a trigger", execution);
        Ok(())
    }
}

impl TriggerableBehavior for WaitState {
    fn trigger(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        leave(ctx, execution);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndEventBehavior {
    pub terminate: bool,
}

impl ActivityBehavior for EndEventBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        if self.terminate {
            ctx.terminate_scope(execution)
        } else {
            ctx.complete_execution(execution)
        }
    }
}

/// Runs a registered task handler, then leaves.
#[derive(Debug, Clone)]
pub struct ServiceTaskBehavior {
    pub handler: String,
}

impl ActivityBehavior for ServiceTaskBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        let node_id = ctx.current_activity(execution)?;
        let handler = ctx.core().task_handler(&self.handler).ok_or_else(|| EngineError::Evaluation {
            node_id: node_id.clone(),
            execution_id: execution.execution_id.clone(),
            message: format!("no task handler registered as '{}'", self.handler),
        })?;

        debug!("Execution {} runs handler '{}' at '{}'", execution, self.handler, node_id);
        let mut delegate = DelegateExecution::new(ctx, execution.clone(), node_id.clone());
        handler
            .execute(&mut delegate)
            .map_err(|e| EngineError::Evaluation {
                node_id,
                execution_id: execution.execution_id.clone(),
                message: e.to_string(),
            })?;

        leave(ctx, execution);
        Ok(())
    }
}

/// Diverges only; flow selection picks one branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExclusiveGatewayBehavior;

impl ActivityBehavior for ExclusiveGatewayBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        leave(ctx, execution);
        Ok(())
    }
}

/// Parallel and inclusive gateways: join on arrival, fork on leave.
#[derive(Debug, Clone, Copy)]
pub struct JoinGatewayBehavior {
    pub kind: JoinKind,
}

impl ActivityBehavior for JoinGatewayBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        ctx.arrive_at_join(execution, self.kind)
    }
}

impl InactiveBehavior for JoinGatewayBehavior {
    fn execute_inactive(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        ctx.reevaluate_join(execution, self.kind)
    }
}

/// Waits for a timer job.
#[derive(Debug, Clone, Copy)]
pub struct TimerEventBehavior {
    pub duration_ms: u64,
}

impl ActivityBehavior for TimerEventBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        ctx.schedule_timer(execution, self.duration_ms)
    }
}

impl TriggerableBehavior for TimerEventBehavior {
    fn trigger(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        ctx.remove_execution_jobs(&execution.execution_id);
        leave(ctx, execution);
        Ok(())
    }
}

/// Opens a child scope at the embedded start event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubProcessBehavior;

impl ActivityBehavior for SubProcessBehavior {
    fn execute(&self, ctx: &mut CommandContext, execution: &ExecutionRef) -> EngineResult<()> {
        ctx.enter_sub_process(execution)
    }
}

/// The behavior bound to one node.
#[derive(Debug, Clone)]
pub enum Behavior {
    NoneStartEvent(PassThrough),
    EndEvent(EndEventBehavior),
    ManualTask(PassThrough),
    UserTask(WaitState),
    ReceiveTask(WaitState),
    ServiceTask(ServiceTaskBehavior),
    ExclusiveGateway(ExclusiveGatewayBehavior),
    ParallelGateway(JoinGatewayBehavior),
    InclusiveGateway(JoinGatewayBehavior),
    TimerEvent(TimerEventBehavior),
    SubProcess(SubProcessBehavior),
}

impl Behavior {
    pub fn for_node(node: &FlowNode) -> Self {
        match &node.kind {
            NodeKind::StartEvent => Self::NoneStartEvent(PassThrough),
            NodeKind::EndEvent { terminate } => Self::EndEvent(EndEventBehavior {
                terminate: *terminate,
            }),
            NodeKind::ManualTask => Self::ManualTask(PassThrough),
            NodeKind::UserTask => Self::UserTask(WaitState),
            NodeKind::ReceiveTask => Self::ReceiveTask(WaitState),
            NodeKind::ServiceTask { handler } => Self::ServiceTask(ServiceTaskBehavior {
                handler: handler.clone(),
            }),
            NodeKind::ExclusiveGateway => Self::ExclusiveGateway(ExclusiveGatewayBehavior),
            NodeKind::ParallelGateway => Self::ParallelGateway(JoinGatewayBehavior {
                kind: JoinKind::Parallel,
            }),
            NodeKind::InclusiveGateway => Self::InclusiveGateway(JoinGatewayBehavior {
                kind: JoinKind::Inclusive,
            }),
            NodeKind::TimerEvent { duration_ms } => Self::TimerEvent(TimerEventBehavior {
                duration_ms: *duration_ms,
            }),
            NodeKind::SubProcess => Self::SubProcess(SubProcessBehavior),
        }
    }

    pub fn activity(&self) -> &dyn ActivityBehavior {
        match self {
            Self::NoneStartEvent(b) | Self::ManualTask(b) => b,
            Self::EndEvent(b) => b,
            Self::UserTask(b) | Self::ReceiveTask(b) => b,
            Self::ServiceTask(b) => b,
            Self::ExclusiveGateway(b) => b,
            Self::ParallelGateway(b) | Self::InclusiveGateway(b) => b,
            Self::TimerEvent(b) => b,
            Self::SubProcess(b) => b,
        }
    }

    pub fn triggerable(&self) -> Option<&dyn TriggerableBehavior> {
        match self {
            Self::UserTask(b) | Self::ReceiveTask(b) => Some(b as &dyn TriggerableBehavior),
            Self::TimerEvent(b) => Some(b as &dyn TriggerableBehavior),
            _ => None,
        }
    }

    pub fn inactive(&self) -> Option<&dyn InactiveBehavior> {
        match self {
            Self::ParallelGateway(b) | Self::InclusiveGateway(b) => Some(b as &dyn InactiveBehavior),
            _ => None,
        }
    }

    pub fn flow_selection(&self) -> FlowSelection {
        match self {
            Self::ExclusiveGateway(_) => FlowSelection::FirstMatching,
            Self::ParallelGateway(_) => FlowSelection::All,
            _ => FlowSelection::AllMatching,
        }
    }

    /// Triggers the node or fails with `NotTriggerable`.
    pub fn trigger(&self, ctx: &mut CommandContext, execution: &ExecutionRef, node_id: &str) -> EngineResult<()> {
        match self.triggerable() {
            Some(behavior) => behavior.trigger(ctx, execution),
            None => Err(DefinitionError::NotTriggerable {
                node_id: node_id.to_string(),
                execution_id: execution.execution_id.clone(),
            }
            .into()),
        }
    }
}
