//! Interpreter Operations
//!
//! The agenda loop and the four operation kinds:
//!
//! 1. Continue process: enter the node an execution points at
//! 2. Take outgoing flows: select flows, fork when more than one is taken
//! 3. Trigger execution: resume a waiting node
//! 4. Execute inactive behaviors: re-check joins of touched instances
//!
//! Plus the tree transitions behaviors build on: joining, completing an
//! execution, completing a scope, terminating, entering a sub-process and
//! scheduling continuation and timer jobs.

use std::sync::Arc;

use chrono::Duration;
use log::{debug, info, warn};
use serde_json::json;

use super::agenda::Operation;
use super::behavior::{FlowSelection, JoinKind};
use super::context::CommandContext;
use super::deployment::DeployedProcess;
use super::listener::{EngineEvent, EventPhase};
use crate::config::{HistoryLevel, JoinPolicy};
use crate::error::{DefinitionError, EngineError, EngineResult};
use crate::jobs::{AsyncPhase, Job, JobKind, ASYNC_CONTINUATION, TIMER_TRIGGER};
use crate::process::{Condition, FlowNode, SequenceFlow};
use crate::runtime::{ExecutionRef, ExecutionTree, HistoryEvent};

impl CommandContext {
    /// Runs operations until the agenda and the pending sweep are exhausted.
    pub(crate) fn run_agenda(&mut self) -> EngineResult<()> {
        let limit = self.core.config.max_operations_per_command;

        loop {
            let operation = match self.agenda.pop() {
                Some(operation) => operation,
                None if !self.pending_sweep.is_empty() => Operation::ExecuteInactiveBehaviors,
                None => return Ok(()),
            };

            self.operations_executed += 1;
            if self.operations_executed > limit {
                self.agenda.clear();
                return Err(EngineError::OperationLimitExceeded { limit });
            }
            self.execute_operation(operation)?;
        }
    }

    fn execute_operation(&mut self, operation: Operation) -> EngineResult<()> {
        if let Some(target) = operation.target() {
            if !self.is_live(target) {
                debug!("Dropping {} for execution {}: no longer live", operation.name(), target);
                return Ok(());
            }
        }

        match operation {
            Operation::ContinueProcess { target, skip_async } => self.continue_process(&target, skip_async),
            Operation::TakeOutgoingFlows { target, skip_async } => self.take_outgoing_flows(&target, skip_async),
            Operation::TriggerExecution { target } => self.trigger_execution(&target),
            Operation::ExecuteInactiveBehaviors => self.execute_inactive_behaviors(),
        }
    }

    fn continue_process(&mut self, target: &ExecutionRef, skip_async: bool) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let node_id = self.current_activity(target)?;
        let node = deployment.require_node(&node_id)?;

        if node.async_before && !skip_async {
            return self.schedule_async_continuation(target, &deployment, node, AsyncPhase::Before);
        }

        let event = EngineEvent::NodeEntered {
            process_instance_id: target.process_instance_id.clone(),
            execution_id: target.execution_id.clone(),
            node_id: node_id.clone(),
        };
        self.fire(EventPhase::Before, &event);

        let now = self.now();
        self.record_history(
            HistoryLevel::Activity,
            HistoryEvent::ActivityStarted {
                process_instance_id: target.process_instance_id.clone(),
                execution_id: target.execution_id.clone(),
                activity_id: node_id.clone(),
                time: now,
            },
        );

        debug!("Execution {} enters '{}' ({})", target, node_id, node.kind.type_name());
        deployment.behavior(&node_id)?.activity().execute(self, target)?;

        self.fire(EventPhase::After, &event);
        Ok(())
    }

    fn take_outgoing_flows(&mut self, target: &ExecutionRef, skip_async: bool) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let node_id = self.current_activity(target)?;
        let node = deployment.require_node(&node_id)?;

        if node.async_after && !skip_async {
            return self.schedule_async_continuation(target, &deployment, node, AsyncPhase::After);
        }

        let outgoing = deployment.outgoing(&node_id);
        if outgoing.is_empty() {
            debug!("Node '{}' has no outgoing flows, execution {} ends", node_id, target);
            return self.complete_execution(target);
        }

        let selection = deployment.behavior(&node_id)?.flow_selection();
        let selected = self.select_flows(target, node, selection, &outgoing)?;

        let now = self.now();
        self.record_history(
            HistoryLevel::Activity,
            HistoryEvent::ActivityEnded {
                process_instance_id: target.process_instance_id.clone(),
                execution_id: target.execution_id.clone(),
                activity_id: node_id.clone(),
                time: now,
            },
        );

        if selected.len() == 1 {
            return self.take_flow(target, selected[0]);
        }

        debug!("Execution {} forks into {} branches at '{}'", target, selected.len(), node_id);
        let branches = self.fork(target, selected.len())?;
        for (branch, flow) in branches.iter().zip(selected) {
            self.take_flow(branch, flow)?;
        }
        Ok(())
    }

    /// Picks the flows to take, in declaration order.
    fn select_flows<'d>(
        &self,
        target: &ExecutionRef,
        node: &FlowNode,
        selection: FlowSelection,
        outgoing: &[(&'d SequenceFlow, Option<&'d Condition>)],
    ) -> EngineResult<Vec<&'d SequenceFlow>> {
        if selection == FlowSelection::All {
            return Ok(outgoing.iter().map(|(flow, _)| *flow).collect());
        }

        let default_flow = node.default_flow.as_deref();
        let mut selected = Vec::new();

        for (flow, condition) in outgoing {
            if default_flow == Some(flow.id.as_str()) {
                continue;
            }
            if self.guard_holds(target, &node.id, *condition)? {
                selected.push(*flow);
                if selection == FlowSelection::FirstMatching {
                    break;
                }
            }
        }

        if selected.is_empty() {
            if let Some((flow, _)) = default_flow.and_then(|d| outgoing.iter().find(|(f, _)| f.id == d)) {
                debug!("No guard holds at '{}', taking default flow '{}'", node.id, flow.id);
                selected.push(*flow);
            }
        }

        if selected.is_empty() {
            return Err(DefinitionError::NoOutgoingFlow {
                node_id: node.id.clone(),
                execution_id: target.execution_id.clone(),
            }
            .into());
        }
        Ok(selected)
    }

    fn guard_holds(&self, target: &ExecutionRef, node_id: &str, condition: Option<&Condition>) -> EngineResult<bool> {
        let Some(condition) = condition else {
            return Ok(true);
        };

        let lookup = |name: &str| self.get_variable(target, name).ok().flatten();
        condition.evaluate(&lookup).map_err(|e| EngineError::Evaluation {
            node_id: node_id.to_string(),
            execution_id: target.execution_id.clone(),
            message: format!("guard '{}': {}", condition, e),
        })
    }

    /// Creates one execution per branch.
    ///
    /// A concurrent execution is reused for the first branch and gets
    /// siblings; a scope execution goes inactive and gets concurrent children.
    fn fork(&mut self, target: &ExecutionRef, branches: usize) -> EngineResult<Vec<ExecutionRef>> {
        let execution = self.execution(target)?.clone();
        let mut created = Vec::with_capacity(branches);

        let (parent, reuse) = match (&execution.parent_id, execution.is_concurrent) {
            (Some(parent_id), true) => (ExecutionRef::new(&target.process_instance_id, parent_id), true),
            _ => (target.clone(), false),
        };

        if reuse {
            created.push(target.clone());
        } else {
            self.execution_mut(target)?.is_active = false;
        }

        while created.len() < branches {
            let child = self.create_child(&parent)?;
            let record = self.execution_mut(&child)?;
            record.is_concurrent = true;
            record.activity_id = execution.activity_id.clone();
            created.push(child);
        }
        Ok(created)
    }

    fn take_flow(&mut self, target: &ExecutionRef, flow: &SequenceFlow) -> EngineResult<()> {
        let event = EngineEvent::FlowTaken {
            process_instance_id: target.process_instance_id.clone(),
            execution_id: target.execution_id.clone(),
            flow_id: flow.id.clone(),
            source_id: flow.source.clone(),
            target_id: flow.target.clone(),
        };
        self.fire(EventPhase::Before, &event);

        let execution = self.execution_mut(target)?;
        execution.activity_id = Some(flow.target.clone());
        execution.is_active = true;

        self.fire(EventPhase::After, &event);
        self.plan(Operation::ContinueProcess {
            target: target.clone(),
            skip_async: false,
        });
        Ok(())
    }

    fn trigger_execution(&mut self, target: &ExecutionRef) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let node_id = self.current_activity(target)?;
        debug!("Triggering execution {} at '{}'", target, node_id);
        deployment.behavior(&node_id)?.trigger(self, target, &node_id)
    }

    /// The background sweep over instances touched since the previous one.
    fn execute_inactive_behaviors(&mut self) -> EngineResult<()> {
        let touched = std::mem::take(&mut self.pending_sweep);

        for process_instance_id in touched {
            let Some(instance) = self.instances.get(&process_instance_id) else {
                continue;
            };
            let deployment = Arc::clone(&instance.deployment);
            let tree = &instance.tree;

            // Executions waiting on their own children are not at a join.
            let waiting: Vec<(ExecutionRef, String)> = tree
                .live_executions()
                .filter(|e| !e.is_active && tree.live_children(&e.id).is_empty())
                .filter_map(|e| e.activity_id.clone().map(|activity| (e.to_ref(), activity)))
                .collect();

            for (execution, activity_id) in waiting {
                if !self.is_live(&execution) || self.execution(&execution)?.is_active {
                    continue;
                }
                if let Some(behavior) = deployment.behavior(&activity_id)?.inactive() {
                    behavior.execute_inactive(self, &execution)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    /// An execution arrives at a converging gateway.
    pub(crate) fn arrive_at_join(&mut self, target: &ExecutionRef, kind: JoinKind) -> EngineResult<()> {
        let node_id = self.current_activity(target)?;
        self.execution_mut(target)?.is_active = false;

        // Concurrent arrivals in separate commands must conflict on the root.
        let tree = self.tree_mut(&target.process_instance_id)?;
        if let Some(root) = tree.concurrency_root(&target.execution_id) {
            tree.force_update(&root);
        }

        self.try_join(target, &node_id, kind, false)
    }

    /// Re-checks an inactive execution waiting at a converging gateway.
    pub(crate) fn reevaluate_join(&mut self, target: &ExecutionRef, kind: JoinKind) -> EngineResult<()> {
        let node_id = self.current_activity(target)?;
        self.try_join(target, &node_id, kind, true)
    }

    fn try_join(&mut self, target: &ExecutionRef, node_id: &str, kind: JoinKind, from_sweep: bool) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let tree = self.tree(&target.process_instance_id)?;
        let execution = tree
            .get(&target.execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))?;
        let root_id = tree
            .concurrency_root(&target.execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))?;

        let joined = if execution.is_concurrent {
            tree.inactive_children_at(&root_id, node_id)
        } else {
            vec![target.execution_id.clone()]
        };

        let ready = match kind {
            JoinKind::Parallel => {
                let expected = deployment.incoming_count(node_id);
                if joined.len() >= expected {
                    true
                } else if from_sweep && !branch_can_reach(tree, &deployment, &root_id, &joined, node_id) {
                    match self.core.config.join_policy {
                        JoinPolicy::ForceJoinWhenUnreachable => {
                            warn!(
                                "Parallel gateway '{}' of instance {}: {} of {} branches arrived and no other branch can reach it, joining",
                                node_id,
                                target.process_instance_id,
                                joined.len(),
                                expected
                            );
                            true
                        }
                        JoinPolicy::WaitForAllBranches => {
                            warn!(
                                "Parallel gateway '{}' of instance {} is stalled: {} of {} branches arrived and no other branch can reach it",
                                node_id,
                                target.process_instance_id,
                                joined.len(),
                                expected
                            );
                            false
                        }
                    }
                } else {
                    false
                }
            }
            JoinKind::Inclusive => !branch_can_reach(tree, &deployment, &root_id, &joined, node_id),
        };

        if !ready {
            debug!(
                "Execution {} waits at '{}' ({} arrived)",
                target,
                node_id,
                joined.len()
            );
            return Ok(());
        }
        self.merge_at_join(target, node_id, &joined)
    }

    /// Ends the joined branches and continues on one execution.
    fn merge_at_join(&mut self, target: &ExecutionRef, node_id: &str, joined: &[String]) -> EngineResult<()> {
        let execution = self.execution(target)?.clone();
        let pi = target.process_instance_id.clone();

        let continuing = match execution.parent_id.as_deref().filter(|_| execution.is_concurrent) {
            None => target.clone(),
            Some(root_id) => {
                let others_live = self
                    .tree(&pi)?
                    .live_children(root_id)
                    .iter()
                    .any(|child| !joined.contains(&child.id));

                if others_live {
                    for id in joined.iter().filter(|id| **id != target.execution_id) {
                        self.end_execution(&ExecutionRef::new(&pi, id), "join")?;
                    }
                    target.clone()
                } else {
                    for id in joined {
                        self.end_execution(&ExecutionRef::new(&pi, id), "join")?;
                    }
                    let root = ExecutionRef::new(&pi, root_id);
                    self.execution_mut(&root)?.activity_id = Some(node_id.to_string());
                    root
                }
            }
        };

        debug!("Joined {} branches at '{}', continuing on {}", joined.len(), node_id, continuing);
        self.execution_mut(&continuing)?.is_active = true;
        self.plan(Operation::TakeOutgoingFlows {
            target: continuing,
            skip_async: false,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// An execution reached the end of its path.
    pub(crate) fn complete_execution(&mut self, target: &ExecutionRef) -> EngineResult<()> {
        let execution = self.execution(target)?.clone();

        match execution.parent_id.filter(|_| execution.is_concurrent) {
            Some(parent_id) => {
                self.end_execution(target, "completed")?;
                let parent = ExecutionRef::new(&target.process_instance_id, parent_id);
                let parent_done =
                    self.is_live(&parent) && self.tree(&parent.process_instance_id)?.live_children(&parent.execution_id).is_empty();
                if parent_done {
                    self.scope_completed(&parent, "completed")?;
                }
                Ok(())
            }
            None => self.scope_completed(target, "completed"),
        }
    }

    /// A scope has no more work: end it and resume whatever entered it.
    fn scope_completed(&mut self, scope: &ExecutionRef, reason: &str) -> EngineResult<()> {
        let parent_id = self.execution(scope)?.parent_id.clone();
        self.end_execution(scope, reason)?;

        if let Some(parent_id) = parent_id {
            let parent = ExecutionRef::new(&scope.process_instance_id, parent_id);
            debug!("Sub-process scope {} completed, resuming {}", scope, parent);
            self.execution_mut(&parent)?.is_active = true;
            self.plan(Operation::TakeOutgoingFlows {
                target: parent,
                skip_async: false,
            });
        }
        Ok(())
    }

    /// Tears down the enclosing scope of `target` and completes it.
    pub(crate) fn terminate_scope(&mut self, target: &ExecutionRef) -> EngineResult<()> {
        let scope_id = self
            .tree(&target.process_instance_id)?
            .scope_chain(&target.execution_id)
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))?;
        let scope = ExecutionRef::new(&target.process_instance_id, scope_id);

        info!("Execution {} terminates scope {}", target, scope);
        self.destroy_scope(&scope, "terminated")?;
        self.scope_completed(&scope, "terminated")
    }

    /// Opens a child scope at the sub-process start event.
    pub(crate) fn enter_sub_process(&mut self, target: &ExecutionRef) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let node_id = self.current_activity(target)?;
        let start_event = deployment.start_event(Some(&node_id))?.id.clone();

        let child = self.create_child(target)?;
        let record = self.execution_mut(&child)?;
        record.is_scope = true;
        record.activity_id = Some(start_event);

        self.execution_mut(target)?.is_active = false;
        debug!("Execution {} enters sub-process '{}' as scope {}", target, node_id, child);
        self.plan(Operation::ContinueProcess {
            target: child,
            skip_async: false,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs created by the interpreter
    // ------------------------------------------------------------------

    fn job_retries(&self, node: &FlowNode) -> u32 {
        node.job_retries.unwrap_or(self.core.config.default_job_retries)
    }

    fn schedule_async_continuation(
        &mut self,
        target: &ExecutionRef,
        deployment: &DeployedProcess,
        node: &FlowNode,
        phase: AsyncPhase,
    ) -> EngineResult<()> {
        let job = Job::new(
            self.next_id(),
            JobKind::AsyncContinuation,
            ASYNC_CONTINUATION,
            json!({ "activity": node.id, "phase": phase }),
            self.job_retries(node),
            self.now(),
        )
        .for_execution(target, deployment.key());

        debug!("Execution {} continues asynchronously {:?} '{}' (job {})", target, phase, node.id, job.id);
        self.schedule_job(job);
        Ok(())
    }

    /// Schedules the timer job of a timer event.
    pub(crate) fn schedule_timer(&mut self, target: &ExecutionRef, duration_ms: u64) -> EngineResult<()> {
        let deployment = self.deployment(&target.process_instance_id)?;
        let node_id = self.current_activity(target)?;
        let node = deployment.require_node(&node_id)?;

        let now = self.now();
        let millis = i64::try_from(duration_ms).unwrap_or(i64::MAX);
        let due = now
            .checked_add_signed(Duration::milliseconds(millis))
            .ok_or_else(|| EngineError::Evaluation {
                node_id: node_id.clone(),
                execution_id: target.execution_id.clone(),
                message: format!("timer duration {}ms is out of range", duration_ms),
            })?;

        let job = Job::new(
            self.next_id(),
            JobKind::Timer,
            TIMER_TRIGGER,
            json!({ "activity": node_id }),
            self.job_retries(node),
            now,
        )
        .for_execution(target, deployment.key())
        .due_at(due);

        debug!("Timer at '{}' for execution {} due {}", node_id, target, due);
        self.schedule_job(job);
        Ok(())
    }
}

/// True when a live branch under `root_id`, other than the joined ones,
/// sits at or can still reach `node_id`.
fn branch_can_reach(
    tree: &ExecutionTree,
    deployment: &DeployedProcess,
    root_id: &str,
    joined: &[String],
    node_id: &str,
) -> bool {
    tree.live_children(root_id)
        .into_iter()
        .filter(|child| !joined.contains(&child.id))
        .any(|child| {
            child
                .activity_id
                .as_deref()
                .map_or(false, |activity| activity == node_id || deployment.can_reach(activity, node_id))
        })
}
