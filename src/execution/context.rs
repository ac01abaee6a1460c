//! Command Context
//!
//! Everything one command works on: the instances it loaded, their variables
//! and jobs, the agenda, buffered history and registered transaction
//! listeners. The context is passed explicitly to every operation and
//! behavior; nothing lives in thread-local state.
//!
//! Loaded records are copies. Nothing reaches the store until [`commit`],
//! which writes one change set carrying the revisions everything was loaded
//! with.
//!
//! [`commit`]: CommandContext::commit

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::agenda::{Agenda, Operation};
use super::command::Command;
use super::deployment::DeployedProcess;
use super::engine::EngineCore;
use super::listener::{EngineEvent, EventPhase, TransactionListener, TransactionPhase};
use crate::config::{EngineConfig, HistoryLevel};
use crate::error::{EngineError, EngineResult};
use crate::jobs::Job;
use crate::runtime::{
    Execution, ExecutionRef, ExecutionTree, HistoricVariableUpdate, HistoryEvent, VariableStore,
    VariableValue,
};
use crate::store::{ChangeSet, EntityChanges};

/// A process instance loaded into the context.
pub(super) struct InstanceState {
    pub(super) deployment: Arc<DeployedProcess>,
    pub(super) tree: ExecutionTree,
    pub(super) variables: VariableStore,
}

/// Jobs touched by the context, with the versions they were loaded at.
#[derive(Debug, Default)]
pub(super) struct JobTable {
    current: BTreeMap<String, Job>,
    original: BTreeMap<String, Job>,
}

impl JobTable {
    /// Starts tracking a job read from the store.
    fn track(&mut self, job: Job) {
        if !self.original.contains_key(&job.id) {
            self.original.insert(job.id.clone(), job.clone());
            self.current.insert(job.id.clone(), job);
        }
    }

    fn insert(&mut self, job: Job) {
        self.current.insert(job.id.clone(), job);
    }

    fn is_known(&self, id: &str) -> bool {
        self.original.contains_key(id) || self.current.contains_key(id)
    }

    fn for_execution(&self, execution_id: &str) -> Vec<String> {
        self.current
            .values()
            .filter(|job| job.execution_id.as_deref() == Some(execution_id))
            .map(|job| job.id.clone())
            .collect()
    }

    fn changes(&self) -> EntityChanges<Job> {
        EntityChanges::diff(&self.original, self.current.values())
    }
}

struct RegisteredListener {
    phase: TransactionPhase,
    listener: Arc<dyn TransactionListener>,
    compensating: bool,
}

/// State of one command between begin and commit.
pub struct CommandContext {
    pub(super) core: Arc<EngineCore>,
    pub(super) command: &'static str,
    pub(super) agenda: Agenda,
    pub(super) instances: BTreeMap<String, InstanceState>,
    pub(super) jobs: JobTable,
    /// Instances touched since the last background sweep
    pub(super) pending_sweep: BTreeSet<String>,
    pub(super) history: Vec<HistoryEvent>,
    transaction_listeners: Vec<RegisteredListener>,
    pub(super) operations_executed: usize,
}

impl CommandContext {
    pub(crate) fn new(core: Arc<EngineCore>, command: &'static str) -> Self {
        Self {
            core,
            command,
            agenda: Agenda::new(),
            instances: BTreeMap::new(),
            jobs: JobTable::default(),
            pending_sweep: BTreeSet::new(),
            history: Vec::new(),
            transaction_listeners: Vec::new(),
            operations_executed: 0,
        }
    }

    pub(crate) fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Name of the outermost command.
    pub fn command_name(&self) -> &'static str {
        self.command
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.core.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn next_id(&self) -> String {
        self.core.store.next_id()
    }

    /// Operations run so far by this command.
    pub fn operations_executed(&self) -> usize {
        self.operations_executed
    }

    fn history_enabled(&self, level: HistoryLevel) -> bool {
        self.core.config.history_level >= level
    }

    pub(super) fn record_history(&mut self, level: HistoryLevel, event: HistoryEvent) {
        if self.history_enabled(level) {
            self.history.push(event);
        }
    }

    // ------------------------------------------------------------------
    // Instances and executions
    // ------------------------------------------------------------------

    /// Creates the root execution of a new instance, positioned at the start event.
    pub(crate) fn start_instance(
        &mut self,
        deployment: Arc<DeployedProcess>,
        business_key: Option<String>,
    ) -> EngineResult<ExecutionRef> {
        let start_event = deployment.start_event(None)?.id.clone();
        let id = self.next_id();

        let mut root = Execution::new_root(id.clone(), deployment.key(), business_key.clone());
        root.activity_id = Some(start_event);

        info!(
            "Starting process instance {} of '{}'{}",
            id,
            deployment.key(),
            business_key
                .as_deref()
                .map(|k| format!(" (business key {})", k))
                .unwrap_or_default()
        );

        self.record_history(
            HistoryLevel::Activity,
            HistoryEvent::ProcessStarted {
                process_instance_id: id.clone(),
                process_definition_id: deployment.key().to_string(),
                business_key,
                time: self.now(),
            },
        );

        self.instances.insert(
            id.clone(),
            InstanceState {
                deployment,
                tree: ExecutionTree::new(root),
                variables: VariableStore::default(),
            },
        );
        Ok(ExecutionRef::root(id))
    }

    /// Loads an instance with its variables and jobs, once per context.
    pub fn load_instance(&mut self, process_instance_id: &str) -> EngineResult<()> {
        if self.instances.contains_key(process_instance_id) {
            return Ok(());
        }

        let store = Arc::clone(&self.core.store);
        let executions = store.load_executions(process_instance_id)?;
        let definition_id = executions
            .iter()
            .find(|e| e.is_root())
            .or_else(|| executions.first())
            .map(|e| e.process_definition_id.clone())
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))?;

        let deployment = self
            .core
            .deployment(&definition_id)
            .ok_or(EngineError::DefinitionNotFound(definition_id))?;

        let variables = store.load_variables(process_instance_id)?;
        for job in store.jobs_for_process_instance(process_instance_id)? {
            self.jobs.track(job);
        }

        debug!(
            "Loaded process instance {} ({} executions, {} variables)",
            process_instance_id,
            executions.len(),
            variables.len()
        );

        self.instances.insert(
            process_instance_id.to_string(),
            InstanceState {
                deployment,
                tree: ExecutionTree::from_loaded(process_instance_id, executions),
                variables: VariableStore::from_loaded(variables),
            },
        );
        Ok(())
    }

    /// Resolves a live execution by id, loading its instance when needed.
    pub fn load_execution(&mut self, execution_id: &str) -> EngineResult<ExecutionRef> {
        let loaded = self
            .instances
            .values()
            .find_map(|instance| instance.tree.get(execution_id))
            .map(Execution::to_ref);

        let target = match loaded {
            Some(target) => target,
            None => {
                let execution = self
                    .core
                    .store
                    .find_execution(execution_id)?
                    .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
                self.load_instance(&execution.process_instance_id)?;
                execution.to_ref()
            }
        };

        if self.is_live(&target) {
            Ok(target)
        } else {
            Err(EngineError::ExecutionNotFound(execution_id.to_string()))
        }
    }

    fn instance(&self, process_instance_id: &str) -> EngineResult<&InstanceState> {
        self.instances
            .get(process_instance_id)
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))
    }

    fn instance_mut(&mut self, process_instance_id: &str) -> EngineResult<&mut InstanceState> {
        self.instances
            .get_mut(process_instance_id)
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))
    }

    pub fn tree(&self, process_instance_id: &str) -> EngineResult<&ExecutionTree> {
        Ok(&self.instance(process_instance_id)?.tree)
    }

    pub(crate) fn tree_mut(&mut self, process_instance_id: &str) -> EngineResult<&mut ExecutionTree> {
        Ok(&mut self.instance_mut(process_instance_id)?.tree)
    }

    pub fn execution(&self, target: &ExecutionRef) -> EngineResult<&Execution> {
        self.tree(&target.process_instance_id)?
            .get(&target.execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))
    }

    pub(crate) fn execution_mut(&mut self, target: &ExecutionRef) -> EngineResult<&mut Execution> {
        self.tree_mut(&target.process_instance_id)?
            .get_mut(&target.execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))
    }

    pub fn is_live(&self, target: &ExecutionRef) -> bool {
        self.instances
            .get(&target.process_instance_id)
            .map_or(false, |instance| instance.tree.is_live(&target.execution_id))
    }

    pub fn deployment(&self, process_instance_id: &str) -> EngineResult<Arc<DeployedProcess>> {
        Ok(Arc::clone(&self.instance(process_instance_id)?.deployment))
    }

    /// Node the execution sits at.
    pub fn current_activity(&self, target: &ExecutionRef) -> EngineResult<String> {
        self.execution(target)?
            .activity_id
            .clone()
            .ok_or_else(|| EngineError::ExecutionNotFound(format!("{} (no current activity)", target)))
    }

    pub(crate) fn create_child(&mut self, parent: &ExecutionRef) -> EngineResult<ExecutionRef> {
        let id = self.next_id();
        self.tree_mut(&parent.process_instance_id)?
            .create_child(&parent.execution_id, id)
            .map(|child| child.to_ref())
            .ok_or_else(|| EngineError::ExecutionNotFound(parent.execution_id.clone()))
    }

    /// Ends one execution, dropping its scope variables and jobs.
    pub(crate) fn end_execution(&mut self, target: &ExecutionRef, reason: &str) -> EngineResult<()> {
        let execution = self.execution(target)?.clone();
        if !execution.is_live() {
            return Ok(());
        }
        self.fire_ended(EventPhase::Before, &execution, reason);
        if !self.tree_mut(&target.process_instance_id)?.end(&target.execution_id, reason) {
            return Ok(());
        }
        debug!("Execution {} ended ({})", target, reason);
        self.release_execution(&execution, reason, false);
        Ok(())
    }

    /// Deletes every descendant of a scope execution, deepest first.
    pub(crate) fn destroy_scope(&mut self, scope: &ExecutionRef, reason: &str) -> EngineResult<()> {
        for id in self.tree(&scope.process_instance_id)?.live_descendants(&scope.execution_id) {
            let execution = self.execution(&ExecutionRef::new(&scope.process_instance_id, &id))?;
            self.fire_ended(EventPhase::Before, execution, reason);
        }

        let removed = self
            .tree_mut(&scope.process_instance_id)?
            .destroy_scope(&scope.execution_id, reason);

        for id in removed {
            let execution = self.execution(&ExecutionRef::new(&scope.process_instance_id, &id))?.clone();
            self.release_execution(&execution, reason, true);
        }
        Ok(())
    }

    /// Deletes a whole process instance.
    pub(crate) fn delete_instance(&mut self, process_instance_id: &str, reason: &str) -> EngineResult<()> {
        let root = ExecutionRef::root(process_instance_id);
        if !self.is_live(&root) {
            return Err(EngineError::ProcessInstanceNotFound(process_instance_id.to_string()));
        }

        info!("Deleting process instance {}: {}", process_instance_id, reason);
        self.destroy_scope(&root, reason)?;

        let execution = self.execution(&root)?.clone();
        self.fire_ended(EventPhase::Before, &execution, reason);
        self.tree_mut(process_instance_id)?.delete(process_instance_id, reason);
        self.release_execution(&execution, reason, true);
        Ok(())
    }

    /// Cleanup shared by every way an execution goes away.
    fn release_execution(&mut self, execution: &Execution, reason: &str, deleted: bool) {
        let pi = execution.process_instance_id.clone();

        if execution.is_scope {
            if let Some(instance) = self.instances.get_mut(&pi) {
                instance.variables.remove_scope(&execution.id);
            }
        }
        self.remove_execution_jobs(&execution.id);

        let now = self.now();
        if let Some(activity_id) = &execution.activity_id {
            self.record_history(
                HistoryLevel::Activity,
                HistoryEvent::ActivityEnded {
                    process_instance_id: pi.clone(),
                    execution_id: execution.id.clone(),
                    activity_id: activity_id.clone(),
                    time: now,
                },
            );
        }

        self.fire_ended(EventPhase::After, execution, reason);

        if execution.is_root() {
            info!("Process instance {} ended ({})", pi, reason);
            self.record_history(
                HistoryLevel::Activity,
                HistoryEvent::ProcessEnded {
                    process_instance_id: pi.clone(),
                    reason: reason.to_string(),
                    deleted,
                    time: now,
                },
            );
        }
        self.pending_sweep.insert(pi);
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Looks a variable up from the nearest scope outwards.
    pub fn get_variable(&self, target: &ExecutionRef, name: &str) -> EngineResult<Option<VariableValue>> {
        let instance = self.instance(&target.process_instance_id)?;
        for scope in instance.tree.scope_chain(&target.execution_id) {
            if let Some(variable) = instance.variables.find(&scope, name) {
                return Ok(self.core.variable_types.read(variable));
            }
        }
        Ok(None)
    }

    /// All visible variables; nearer scopes shadow outer ones.
    pub fn variables(&self, target: &ExecutionRef) -> EngineResult<BTreeMap<String, VariableValue>> {
        let instance = self.instance(&target.process_instance_id)?;
        let mut visible = BTreeMap::new();
        for scope in instance.tree.scope_chain(&target.execution_id).iter().rev() {
            for variable in instance.variables.in_scope(scope) {
                if let Some(value) = self.core.variable_types.read(variable) {
                    visible.insert(variable.name.clone(), value);
                }
            }
        }
        Ok(visible)
    }

    /// Updates the variable where it already exists along the scope chain,
    /// otherwise creates it on the nearest scope.
    pub fn set_variable(&mut self, target: &ExecutionRef, name: &str, value: VariableValue) -> EngineResult<()> {
        let instance = self.instance(&target.process_instance_id)?;
        let chain = instance.tree.scope_chain(&target.execution_id);
        let scope = chain
            .iter()
            .find(|scope| instance.variables.find(scope, name).is_some())
            .or_else(|| chain.first())
            .cloned()
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))?;

        self.write_variable(&target.process_instance_id, &scope, name, value)
    }

    /// Always writes to the nearest scope.
    pub fn set_variable_local(&mut self, target: &ExecutionRef, name: &str, value: VariableValue) -> EngineResult<()> {
        let scope = self
            .tree(&target.process_instance_id)?
            .scope_chain(&target.execution_id)
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ExecutionNotFound(target.execution_id.clone()))?;

        self.write_variable(&target.process_instance_id, &scope, name, value)
    }

    fn write_variable(
        &mut self,
        process_instance_id: &str,
        scope_id: &str,
        name: &str,
        value: VariableValue,
    ) -> EngineResult<()> {
        let core = Arc::clone(&self.core);
        let instance = self.instance_mut(process_instance_id)?;
        let write = instance
            .variables
            .write(scope_id, process_instance_id, name, &value, &core.variable_types, || {
                core.store.next_id()
            })
            .ok_or_else(|| EngineError::UnsupportedVariableType(name.to_string()))?;
        // A fresh record carries no revision, so the owning scope does.
        if write.inserted_record() {
            instance.tree.force_update(scope_id);
        }

        debug!(
            "Variable '{}' set on scope {} as {}{}",
            name,
            scope_id,
            write.type_name,
            if write.migrated { " (type migrated)" } else { "" }
        );

        let time = self.now();
        self.record_history(
            HistoryLevel::Full,
            HistoryEvent::VariableUpdated(HistoricVariableUpdate {
                process_instance_id: process_instance_id.to_string(),
                scope_id: scope_id.to_string(),
                variable_id: write.variable_id,
                name: name.to_string(),
                type_name: write.type_name,
                old_value: write.old_value,
                new_value: value,
                time,
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Adds a new job to the change set.
    pub fn schedule_job(&mut self, job: Job) {
        debug!("Scheduling {} job {} ({})", job.handler_type, job.id, job.retries);
        self.jobs.insert(job);
    }

    /// Reads a job, tracking it for the commit. None when it is gone.
    pub(crate) fn load_job(&mut self, job_id: &str) -> EngineResult<Option<Job>> {
        if !self.jobs.is_known(job_id) {
            if let Some(job) = self.core.store.find_job(job_id)? {
                self.jobs.track(job);
            }
        }
        Ok(self.jobs.current.get(job_id).cloned())
    }

    pub(crate) fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.current.get_mut(job_id)
    }

    pub(crate) fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        self.jobs.current.remove(job_id)
    }

    /// Drops every job bound to an execution.
    pub(crate) fn remove_execution_jobs(&mut self, execution_id: &str) {
        for id in self.jobs.for_execution(execution_id) {
            debug!("Removing job {} of execution {}", id, execution_id);
            self.jobs.current.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Agenda and events
    // ------------------------------------------------------------------

    /// Appends an operation to the agenda.
    pub fn plan(&mut self, operation: Operation) {
        if let Some(target) = operation.target() {
            self.pending_sweep.insert(target.process_instance_id.clone());
        }
        self.agenda.push(operation);
    }

    fn fire_ended(&self, phase: EventPhase, execution: &Execution, reason: &str) {
        self.fire(
            phase,
            &EngineEvent::ExecutionEnded {
                process_instance_id: execution.process_instance_id.clone(),
                execution_id: execution.id.clone(),
                reason: reason.to_string(),
            },
        );
    }

    /// Notifies the engine's execution listeners; failures are only logged.
    pub(crate) fn fire(&self, phase: EventPhase, event: &EngineEvent) {
        for listener in self.core.listeners() {
            if let Err(e) = listener.notify(phase, event) {
                warn!("Execution listener failed on {:?}: {}", event, e);
            }
        }
    }

    pub fn add_transaction_listener(&mut self, phase: TransactionPhase, listener: Arc<dyn TransactionListener>) {
        self.transaction_listeners.push(RegisteredListener {
            phase,
            listener,
            compensating: false,
        });
    }

    /// Registers a listener that is compensated when a later listener of the
    /// same phase fails.
    pub fn add_compensating_transaction_listener(
        &mut self,
        phase: TransactionPhase,
        listener: Arc<dyn TransactionListener>,
    ) {
        self.transaction_listeners.push(RegisteredListener {
            phase,
            listener,
            compensating: true,
        });
    }

    /// Runs a command inside this context. Only the outermost command drains
    /// the agenda and commits.
    pub fn execute_nested<C: Command>(&mut self, command: &C) -> EngineResult<C::Output> {
        debug!("Nested command '{}' inside '{}'", command.name(), self.command);
        command.execute(self)
    }

    // ------------------------------------------------------------------
    // Transaction boundary
    // ------------------------------------------------------------------

    fn take_listeners(&mut self, phase: TransactionPhase) -> Vec<RegisteredListener> {
        let (matching, rest): (Vec<RegisteredListener>, Vec<RegisteredListener>) =
            std::mem::take(&mut self.transaction_listeners)
            .into_iter()
            .partition(|l| l.phase == phase);
        self.transaction_listeners = rest;
        matching
    }

    fn fire_phase(core: &Arc<EngineCore>, command: &'static str, phase: TransactionPhase) {
        let event = EngineEvent::Transaction { command, phase };
        for listener in core.listeners() {
            if let Err(e) = listener.notify(EventPhase::After, &event) {
                warn!("Execution listener failed on {} of '{}': {}", phase, command, e);
            }
        }
    }

    /// Runs a listener batch inside this context.
    fn run_listeners_here(&mut self, phase: TransactionPhase) {
        let batch = self.take_listeners(phase);
        let mut succeeded: Vec<Arc<dyn TransactionListener>> = Vec::new();

        for registered in batch {
            match registered.listener.execute(self) {
                Ok(()) if registered.compensating => succeeded.push(registered.listener),
                Ok(()) => {}
                Err(e) => {
                    warn!("Transaction listener failed during {} of '{}': {}", phase, self.command, e);
                    for listener in succeeded.drain(..).rev() {
                        if let Err(e) = listener.compensate(self) {
                            warn!("Compensation failed during {}: {}", phase, e);
                        }
                    }
                }
            }
        }
    }

    /// Runs a listener batch where every listener gets its own command.
    fn run_listeners_detached(core: &Arc<EngineCore>, phase: TransactionPhase, batch: Vec<RegisteredListener>) {
        let mut succeeded: Vec<Arc<dyn TransactionListener>> = Vec::new();

        for registered in batch {
            let listener = Arc::clone(&registered.listener);
            let result = core.run("transaction-listener", |ctx| {
                listener
                    .execute(ctx)
                    .map_err(|e| EngineError::Listener(e.to_string()))
            });

            match result {
                Ok(()) if registered.compensating => succeeded.push(registered.listener),
                Ok(()) => {}
                Err(e) => {
                    warn!("Transaction listener failed after {}: {}", phase, e);
                    for listener in succeeded.drain(..).rev() {
                        let compensation = core.run("transaction-compensation", |ctx| {
                            listener
                                .compensate(ctx)
                                .map_err(|e| EngineError::Listener(e.to_string()))
                        });
                        if let Err(e) = compensation {
                            warn!("Compensation failed after {}: {}", phase, e);
                        }
                    }
                }
            }
        }
    }

    /// Every change made by this context as one change set.
    pub(crate) fn collect_changes(&self) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (id, instance) in &self.instances {
            if let Err(e) = instance.tree.check_invariants() {
                warn!("Process instance {} violates a tree invariant: {}", id, e);
            }
            changes.executions.extend(instance.tree.changes());
            changes.variables.extend(instance.variables.changes());
        }
        changes.jobs = self.jobs.changes();
        changes
    }

    /// Writes the change set, then flushes history and runs committed listeners.
    pub(crate) fn commit(mut self) -> EngineResult<()> {
        Self::fire_phase(&self.core, self.command, TransactionPhase::Committing);
        self.run_listeners_here(TransactionPhase::Committing);
        if let Err(e) = self.run_agenda() {
            return Err(self.rollback(e));
        }

        let changes = self.collect_changes();
        let core = Arc::clone(&self.core);
        let command = self.command;

        debug!("Committing '{}' ({} changes)", command, changes.len());
        if let Err(e) = core.store.commit(changes) {
            return Err(self.rollback(e.into()));
        }

        let history = std::mem::take(&mut self.history);
        if !history.is_empty() {
            if let Err(e) = core.store.record_history(&history) {
                warn!("Failed to record history of '{}': {}", command, e);
            }
        }

        let committed = self.take_listeners(TransactionPhase::Committed);
        drop(self);

        Self::fire_phase(&core, command, TransactionPhase::Committed);
        Self::run_listeners_detached(&core, TransactionPhase::Committed, committed);
        Ok(())
    }

    /// Discards the context's work and returns the error that caused it.
    pub(crate) fn rollback(mut self, error: EngineError) -> EngineError {
        warn!("Command '{}' failed, rolling back: {}", self.command, error);

        Self::fire_phase(&self.core, self.command, TransactionPhase::RollingBack);
        self.run_listeners_here(TransactionPhase::RollingBack);

        let rolled_back = self.take_listeners(TransactionPhase::RolledBack);
        let core = Arc::clone(&self.core);
        let command = self.command;
        drop(self);

        Self::fire_phase(&core, command, TransactionPhase::RolledBack);
        Self::run_listeners_detached(&core, TransactionPhase::RolledBack, rolled_back);
        error
    }
}
