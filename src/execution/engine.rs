//! Process Engine
//!
//! The public entry point. A [`ProcessEngine`] owns the deployed processes,
//! the registered handlers and listeners, the store and the clock, and runs
//! every operation as a command in its own transaction boundary.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use procrunner::execution::ProcessEngine;
//! use procrunner::process::{FlowNode, NodeKind, ProcessDefinition};
//!
//! let engine = ProcessEngine::default();
//! engine
//!     .deploy(
//!         ProcessDefinition::new("review")
//!             .node(FlowNode::new("start", NodeKind::StartEvent))
//!             .node(FlowNode::new("review", NodeKind::UserTask))
//!             .node(FlowNode::new("end", NodeKind::EndEvent { terminate: false }))
//!             .flow("f1", "start", "review")
//!             .flow("f2", "review", "end"),
//!     )
//!     .unwrap();
//!
//! let instance = engine.start_process("review", BTreeMap::new()).unwrap();
//! assert_eq!(engine.active_activities(&instance).unwrap(), vec!["review".to_string()]);
//!
//! engine.trigger_execution(&instance, BTreeMap::new()).unwrap();
//! assert!(engine.executions(&instance).unwrap().is_empty());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;

use super::command::{
    ClaimJobCmd, Command, DeleteProcessInstanceCmd, ExecuteJobCmd, ReportJobFailureCmd, ScheduleJobCmd,
    SetJobRetriesCmd, SetVariableCmd, StartProcessCmd, TriggerExecutionCmd, UnlockJobCmd,
};
use super::context::CommandContext;
use super::delegate::{DelegateExecution, FnTaskHandler, HandlerResult, TaskHandler};
use super::deployment::{DeployedProcess, DeploymentRegistry};
use super::listener::ExecutionListener;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::{DecrementRetries, FnJobHandler, Job, JobHandler, JobOutcome, RetryPolicy};
use crate::process::{validate_process, validator::describe_errors, ProcessDefinition};
use crate::runtime::{
    Execution, HistoricActivityInstance, HistoricProcessInstance, HistoricVariableUpdate, VariableType,
    VariableTypes, VariableValue,
};
use crate::store::{MemoryStore, ProcessStore};

/// Shared engine state handed to every command context.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn ProcessStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) variable_types: VariableTypes,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    deployments: RwLock<DeploymentRegistry>,
    task_handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    job_handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    listeners: RwLock<Vec<Arc<dyn ExecutionListener>>>,
}

impl EngineCore {
    /// A deployment by key, or the latest version of a process id.
    pub(crate) fn deployment(&self, key_or_id: &str) -> Option<Arc<DeployedProcess>> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_or_id)
    }

    pub(crate) fn task_handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.task_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn job_handler(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.job_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handler_type)
            .cloned()
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn ExecutionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `body` in a fresh command context: body, agenda, commit.
    pub(crate) fn run<T>(
        self: &Arc<Self>,
        name: &'static str,
        body: impl FnOnce(&mut CommandContext) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut ctx = CommandContext::new(Arc::clone(self), name);
        debug!("Command '{}' started", name);

        let result = body(&mut ctx).and_then(|output| ctx.run_agenda().map(|()| output));
        match result {
            Ok(output) => {
                let operations = ctx.operations_executed();
                ctx.commit()?;
                debug!("Command '{}' committed after {} operations", name, operations);
                Ok(output)
            }
            Err(e) => Err(ctx.rollback(e)),
        }
    }
}

/// Observable lifecycle state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessInstanceState {
    Active,
    Completed,
    Deleted,
}

/// Builder for [`ProcessEngine`].
pub struct ProcessEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ProcessStore>>,
    clock: Option<Arc<dyn Clock>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    variable_types: VariableTypes,
}

impl ProcessEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Registers a custom variable type ahead of the built-in ones.
    pub fn variable_type(mut self, variable_type: Box<dyn VariableType>) -> Self {
        self.variable_types.add_first(variable_type);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let core = EngineCore {
            config: self.config,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            variable_types: self.variable_types,
            retry_policy: self.retry_policy.unwrap_or_else(|| Arc::new(DecrementRetries)),
            deployments: RwLock::new(DeploymentRegistry::default()),
            task_handlers: RwLock::new(HashMap::new()),
            job_handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        };
        ProcessEngine { core: Arc::new(core) }
    }
}

/// Embeddable process engine.
///
/// Cheap to clone; clones share deployments, handlers and the store.
#[derive(Clone)]
pub struct ProcessEngine {
    core: Arc<EngineCore>,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder {
            config: EngineConfig::default(),
            store: None,
            clock: None,
            retry_policy: None,
            variable_types: VariableTypes::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn store(&self) -> Arc<dyn ProcessStore> {
        Arc::clone(&self.core.store)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.core.clock)
    }

    // ------------------------------------------------------------------
    // Deployment and registration
    // ------------------------------------------------------------------

    /// Validates and deploys a definition; returns its deployment key.
    ///
    /// Deploying an id again adds a new version. Starting by process id
    /// uses the latest version; running instances keep theirs.
    pub fn deploy(&self, definition: ProcessDefinition) -> EngineResult<String> {
        validate_process(&definition)
            .map_err(|errors| EngineError::InvalidDefinition(describe_errors(&errors)))?;

        let requested = definition.version;
        let deployed = DeployedProcess::new(definition).map_err(EngineError::InvalidDefinition)?;

        let mut registry = self.core.deployments.write().unwrap_or_else(PoisonError::into_inner);
        let redeploy = registry.is_deployed(deployed.id());
        let deployed = registry.register(deployed);

        if deployed.version() != requested {
            warn!(
                "Process '{}' version {} is already deployed, deployed as version {}",
                deployed.id(),
                requested,
                deployed.version()
            );
        } else if redeploy {
            info!("Deployed new version of process '{}' ({})", deployed.id(), deployed.key());
        } else {
            info!("Deployed process '{}' ({})", deployed.id(), deployed.key());
        }
        Ok(deployed.key().to_string())
    }

    /// Process ids with at least one deployed version.
    pub fn deployed_processes(&self) -> Vec<String> {
        self.core
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .process_ids()
    }

    /// Deployed versions of a process id, oldest first.
    pub fn deployed_versions(&self, process_id: &str) -> Vec<u32> {
        self.core
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .versions(process_id)
    }

    pub fn register_task_handler(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        let name = name.into();
        debug!("Registered task handler '{}'", name);
        self.core
            .task_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    /// Registers a closure as a task handler.
    pub fn register_task_fn<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut DelegateExecution<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_task_handler(name, FnTaskHandler(handler));
    }

    pub fn register_job_handler(&self, handler_type: impl Into<String>, handler: impl JobHandler + 'static) {
        let handler_type = handler_type.into();
        debug!("Registered job handler '{}'", handler_type);
        self.core
            .job_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handler_type, Arc::new(handler));
    }

    /// Registers a closure as a job handler.
    pub fn register_job_fn<F>(&self, handler_type: impl Into<String>, handler: F)
    where
        F: Fn(&Job, &mut CommandContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_job_handler(handler_type, FnJobHandler(handler));
    }

    pub fn add_listener(&self, listener: Arc<dyn ExecutionListener>) {
        self.core
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Runs a command in its own transaction boundary.
    pub fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        self.core.run(command.name(), |ctx| command.execute(ctx))
    }

    /// Starts an instance; returns the process instance id.
    pub fn start_process(
        &self,
        definition_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<String> {
        self.execute(StartProcessCmd::new(definition_id).with_variables(variables))
    }

    pub fn start_process_with_business_key(
        &self,
        definition_id: &str,
        business_key: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> EngineResult<String> {
        self.execute(
            StartProcessCmd::new(definition_id)
                .with_business_key(business_key)
                .with_variables(variables),
        )
    }

    /// Resumes an execution waiting in a node. The data is written through
    /// the execution's scope chain before the trigger.
    pub fn trigger_execution(&self, execution_id: &str, data: BTreeMap<String, VariableValue>) -> EngineResult<()> {
        self.execute(TriggerExecutionCmd::new(execution_id).with_variables(data))
    }

    pub fn set_variable(&self, execution_id: &str, name: &str, value: impl Into<VariableValue>) -> EngineResult<()> {
        self.execute(SetVariableCmd {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            value: value.into(),
            local: false,
        })
    }

    pub fn set_variable_local(
        &self,
        execution_id: &str,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> EngineResult<()> {
        self.execute(SetVariableCmd {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            value: value.into(),
            local: true,
        })
    }

    /// Reads a variable through the scope chain. Absent is `Ok(None)`.
    pub fn get_variable(&self, execution_id: &str, name: &str) -> EngineResult<Option<VariableValue>> {
        let mut ctx = CommandContext::new(Arc::clone(&self.core), "get-variable");
        let target = ctx.load_execution(execution_id)?;
        ctx.get_variable(&target, name)
    }

    /// Every variable visible from an execution.
    pub fn get_variables(&self, execution_id: &str) -> EngineResult<BTreeMap<String, VariableValue>> {
        let mut ctx = CommandContext::new(Arc::clone(&self.core), "get-variables");
        let target = ctx.load_execution(execution_id)?;
        ctx.variables(&target)
    }

    pub fn delete_process_instance(&self, process_instance_id: &str, reason: &str) -> EngineResult<()> {
        self.execute(DeleteProcessInstanceCmd {
            process_instance_id: process_instance_id.to_string(),
            reason: reason.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Persisted executions of an instance, root first.
    pub fn executions(&self, process_instance_id: &str) -> EngineResult<Vec<Execution>> {
        let mut executions = self.core.store.load_executions(process_instance_id)?;
        executions.sort_by_key(|e| (!e.is_root(), e.id.len(), e.id.clone()));
        Ok(executions)
    }

    /// Nodes with an active execution, sorted.
    pub fn active_activities(&self, process_instance_id: &str) -> EngineResult<Vec<String>> {
        let mut activities: Vec<String> = self
            .core
            .store
            .load_executions(process_instance_id)?
            .into_iter()
            .filter(|e| e.is_active && e.is_live())
            .filter_map(|e| e.activity_id)
            .collect();
        activities.sort();
        Ok(activities)
    }

    /// Active while executions exist; otherwise derived from history.
    pub fn process_instance_state(&self, process_instance_id: &str) -> EngineResult<ProcessInstanceState> {
        if !self.core.store.load_executions(process_instance_id)?.is_empty() {
            return Ok(ProcessInstanceState::Active);
        }
        match self.core.store.historic_process_instance(process_instance_id)? {
            Some(historic) if historic.deleted => Ok(ProcessInstanceState::Deleted),
            Some(_) => Ok(ProcessInstanceState::Completed),
            None => Err(EngineError::ProcessInstanceNotFound(process_instance_id.to_string())),
        }
    }

    pub fn jobs(&self, process_instance_id: &str) -> EngineResult<Vec<Job>> {
        Ok(self.core.store.jobs_for_process_instance(process_instance_id)?)
    }

    pub fn job(&self, job_id: &str) -> EngineResult<Option<Job>> {
        Ok(self.core.store.find_job(job_id)?)
    }

    pub fn dead_jobs(&self) -> EngineResult<Vec<Job>> {
        Ok(self.core.store.dead_jobs()?)
    }

    pub fn historic_process_instance(&self, process_instance_id: &str) -> EngineResult<Option<HistoricProcessInstance>> {
        Ok(self.core.store.historic_process_instance(process_instance_id)?)
    }

    pub fn historic_activities(&self, process_instance_id: &str) -> EngineResult<Vec<HistoricActivityInstance>> {
        Ok(self.core.store.historic_activities(process_instance_id)?)
    }

    pub fn variable_history(&self, process_instance_id: &str) -> EngineResult<Vec<HistoricVariableUpdate>> {
        Ok(self.core.store.variable_history(process_instance_id)?)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Claims up to `limit` due jobs, each in its own command.
    ///
    /// Jobs another worker claimed first are skipped.
    pub fn acquire_due_jobs(&self, limit: usize) -> EngineResult<Vec<Job>> {
        let now = self.core.clock.now();
        let candidates = self.core.store.find_acquirable_jobs(now, limit)?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self.execute(ClaimJobCmd {
                job_id: candidate.id.clone(),
            }) {
                Ok(true) => {
                    if let Some(job) = self.core.store.find_job(&candidate.id)? {
                        claimed.push(job);
                    }
                }
                Ok(false) => debug!("Job {} is no longer acquirable", candidate.id),
                Err(e) if e.is_optimistic_lock() => debug!("Job {} was claimed concurrently", candidate.id),
                Err(e) => return Err(e),
            }
        }

        if !claimed.is_empty() {
            debug!("Acquired {} jobs", claimed.len());
        }
        Ok(claimed)
    }

    /// Executes one job in its own command.
    ///
    /// A failure rolls the attempt back and applies the retry policy in a new
    /// command; a version conflict only releases the lock.
    pub fn execute_job(&self, job_id: &str) -> EngineResult<JobOutcome> {
        match self.execute(ExecuteJobCmd {
            job_id: job_id.to_string(),
        }) {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_optimistic_lock() => {
                warn!("Job {} conflicted with a concurrent change: {}", job_id, e);
                if let Err(unlock) = self.execute(UnlockJobCmd {
                    job_id: job_id.to_string(),
                }) {
                    debug!("Could not release job {}: {}", job_id, unlock);
                }
                Ok(JobOutcome::Conflict)
            }
            Err(e) => self.report_failure(job_id, &e.to_string()),
        }
    }

    /// Applies the retry policy to a failed job.
    pub fn report_failure(&self, job_id: &str, error: &str) -> EngineResult<JobOutcome> {
        self.execute(ReportJobFailureCmd {
            job_id: job_id.to_string(),
            error: error.to_string(),
        })
    }

    /// Gives a job new retries; a dead job becomes acquirable again.
    pub fn set_job_retries(&self, job_id: &str, retries: u32) -> EngineResult<()> {
        self.execute(SetJobRetriesCmd {
            job_id: job_id.to_string(),
            retries,
        })
    }

    /// Schedules a standalone job for a registered handler type.
    pub fn schedule_job(
        &self,
        handler_type: &str,
        payload: Value,
        due_date: Option<DateTime<Utc>>,
    ) -> EngineResult<String> {
        self.execute(ScheduleJobCmd {
            handler_type: handler_type.to_string(),
            payload,
            due_date,
            retries: None,
        })
    }
}
