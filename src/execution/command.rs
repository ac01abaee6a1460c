//! Commands
//!
//! Every public engine operation is a [`Command`] run inside its own command
//! context: the command body plans agenda work, the agenda runs to
//! exhaustion, and the context commits or rolls back as one unit.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;

use super::agenda::Operation;
use super::context::CommandContext;
use crate::error::{EngineError, EngineResult};
use crate::jobs::{AsyncPhase, Job, JobKind, JobOutcome, ASYNC_CONTINUATION, TIMER_TRIGGER};
use crate::runtime::VariableValue;

/// A unit of work executed inside one transaction boundary.
pub trait Command {
    type Output;

    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;
}

/// Starts a new process instance; returns its id.
#[derive(Debug, Clone)]
pub struct StartProcessCmd {
    pub definition_id: String,
    pub business_key: Option<String>,
    pub variables: BTreeMap<String, VariableValue>,
}

impl StartProcessCmd {
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            business_key: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, VariableValue>) -> Self {
        self.variables = variables;
        self
    }
}

impl Command for StartProcessCmd {
    type Output = String;

    fn name(&self) -> &'static str {
        "start-process"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<String> {
        let deployment = ctx
            .core()
            .deployment(&self.definition_id)
            .ok_or_else(|| EngineError::DefinitionNotFound(self.definition_id.clone()))?;

        let root = ctx.start_instance(deployment, self.business_key.clone())?;
        for (name, value) in &self.variables {
            ctx.set_variable_local(&root, name, value.clone())?;
        }

        ctx.plan(Operation::ContinueProcess {
            target: root.clone(),
            skip_async: false,
        });
        Ok(root.process_instance_id)
    }
}

/// Resumes an execution waiting in a node, optionally passing data.
#[derive(Debug, Clone)]
pub struct TriggerExecutionCmd {
    pub execution_id: String,
    pub variables: BTreeMap<String, VariableValue>,
}

impl TriggerExecutionCmd {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, VariableValue>) -> Self {
        self.variables = variables;
        self
    }
}

impl Command for TriggerExecutionCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "trigger-execution"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let target = ctx.load_execution(&self.execution_id)?;
        for (name, value) in &self.variables {
            ctx.set_variable(&target, name, value.clone())?;
        }
        ctx.plan(Operation::TriggerExecution { target });
        Ok(())
    }
}

/// Writes one variable through an execution's scope chain.
#[derive(Debug, Clone)]
pub struct SetVariableCmd {
    pub execution_id: String,
    pub name: String,
    pub value: VariableValue,
    pub local: bool,
}

impl Command for SetVariableCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-variable"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let target = ctx.load_execution(&self.execution_id)?;
        if self.local {
            ctx.set_variable_local(&target, &self.name, self.value.clone())
        } else {
            ctx.set_variable(&target, &self.name, self.value.clone())
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteProcessInstanceCmd {
    pub process_instance_id: String,
    pub reason: String,
}

impl Command for DeleteProcessInstanceCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete-process-instance"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        ctx.load_instance(&self.process_instance_id)?;
        ctx.delete_instance(&self.process_instance_id, &self.reason)
    }
}

/// Locks a due job for this engine. Returns false when it is no longer
/// acquirable.
#[derive(Debug, Clone)]
pub struct ClaimJobCmd {
    pub job_id: String,
}

impl Command for ClaimJobCmd {
    type Output = bool;

    fn name(&self) -> &'static str {
        "claim-job"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let now = ctx.now();
        match ctx.load_job(&self.job_id)? {
            Some(job) if job.is_acquirable(now) => {}
            _ => return Ok(false),
        }

        let owner = ctx.config().lock_owner.clone();
        let until = now
            .checked_add_signed(ctx.config().job_lock_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(job) = ctx.job_mut(&self.job_id) {
            job.lock(owner, until);
        }
        Ok(true)
    }
}

/// Runs a job's handler. A successful run deletes the job.
#[derive(Debug, Clone)]
pub struct ExecuteJobCmd {
    pub job_id: String,
}

impl Command for ExecuteJobCmd {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "execute-job"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobOutcome> {
        let now = ctx.now();
        let Some(job) = ctx.load_job(&self.job_id)? else {
            debug!("Job {} no longer exists", self.job_id);
            return Ok(JobOutcome::Skipped);
        };

        if job.retries == 0 {
            debug!("Job {} is dead, not executing", job.id);
            return Ok(JobOutcome::Skipped);
        }
        let owner = &ctx.config().lock_owner;
        if job.is_locked(now) && job.lock_owner.as_ref() != Some(owner) {
            debug!("Job {} is locked by {:?}", job.id, job.lock_owner);
            return Ok(JobOutcome::Skipped);
        }

        ctx.remove_job(&job.id);
        debug!("Executing {} job {}", job.handler_type, job.id);

        match job.handler_type.as_str() {
            ASYNC_CONTINUATION => {
                let target = job_target(&job, ctx)?;
                let operation = match job.async_phase() {
                    Some(AsyncPhase::Before) => Operation::ContinueProcess {
                        target,
                        skip_async: true,
                    },
                    Some(AsyncPhase::After) => Operation::TakeOutgoingFlows {
                        target,
                        skip_async: true,
                    },
                    None => {
                        return Err(EngineError::JobFailed(format!(
                            "async continuation {} has no phase",
                            job.id
                        )))
                    }
                };
                ctx.plan(operation);
            }
            TIMER_TRIGGER => {
                let target = job_target(&job, ctx)?;
                ctx.plan(Operation::TriggerExecution { target });
            }
            handler_type => {
                let handler = ctx
                    .core()
                    .job_handler(handler_type)
                    .ok_or_else(|| EngineError::UnknownJobHandler(handler_type.to_string()))?;
                handler
                    .execute(&job, ctx)
                    .map_err(|e| EngineError::JobFailed(e.to_string()))?;
            }
        }
        Ok(JobOutcome::Completed)
    }
}

fn job_target(job: &Job, ctx: &mut CommandContext) -> EngineResult<crate::runtime::ExecutionRef> {
    let execution_id = job
        .execution_id
        .as_deref()
        .ok_or_else(|| EngineError::JobFailed(format!("job {} is not bound to an execution", job.id)))?;
    ctx.load_execution(execution_id)
}

/// Applies the retry policy after a failed attempt.
#[derive(Debug, Clone)]
pub struct ReportJobFailureCmd {
    pub job_id: String,
    pub error: String,
}

impl Command for ReportJobFailureCmd {
    type Output = JobOutcome;

    fn name(&self) -> &'static str {
        "report-job-failure"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobOutcome> {
        let now = ctx.now();
        match ctx.load_job(&self.job_id)? {
            None => return Ok(JobOutcome::Skipped),
            Some(job) if job.is_dead() => {
                debug!("Job {} is already dead, failure not recorded", job.id);
                return Ok(JobOutcome::Skipped);
            }
            Some(_) => {}
        }

        let policy = std::sync::Arc::clone(&ctx.core().retry_policy);
        let job = ctx
            .job_mut(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;
        policy.on_failure(job, &self.error, now);

        if job.retries == 0 {
            error!("Job {} is dead after its last retry: {}", job.id, self.error);
            Ok(JobOutcome::Dead)
        } else {
            warn!("Job {} failed ({} retries left): {}", job.id, job.retries, self.error);
            Ok(JobOutcome::Failed {
                retries_left: job.retries,
            })
        }
    }
}

/// Releases this engine's lock on a job without touching its retries.
#[derive(Debug, Clone)]
pub struct UnlockJobCmd {
    pub job_id: String,
}

impl Command for UnlockJobCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "unlock-job"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        ctx.load_job(&self.job_id)?;
        let owner = ctx.config().lock_owner.clone();
        if let Some(job) = ctx.job_mut(&self.job_id) {
            if job.lock_owner.as_deref() == Some(owner.as_str()) {
                job.unlock();
            }
        }
        Ok(())
    }
}

/// Operator command: gives a job new retries, reviving it when dead.
///
/// The last exception message is kept for inspection.
#[derive(Debug, Clone)]
pub struct SetJobRetriesCmd {
    pub job_id: String,
    pub retries: u32,
}

impl Command for SetJobRetriesCmd {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-job-retries"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        ctx.load_job(&self.job_id)?;
        let job = ctx
            .job_mut(&self.job_id)
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))?;

        info!("Job {}: retries {} -> {}", job.id, job.retries, self.retries);
        job.retries = self.retries;
        job.unlock();
        Ok(())
    }
}

/// Schedules a standalone job for a registered handler type; returns its id.
#[derive(Debug, Clone)]
pub struct ScheduleJobCmd {
    pub handler_type: String,
    pub payload: Value,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: Option<u32>,
}

impl Command for ScheduleJobCmd {
    type Output = String;

    fn name(&self) -> &'static str {
        "schedule-job"
    }

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<String> {
        if ctx.core().job_handler(&self.handler_type).is_none() {
            return Err(EngineError::UnknownJobHandler(self.handler_type.clone()));
        }

        let retries = self.retries.unwrap_or(ctx.config().default_job_retries);
        let mut job = Job::new(
            ctx.next_id(),
            JobKind::Message,
            &self.handler_type,
            self.payload.clone(),
            retries,
            ctx.now(),
        );
        job.due_date = self.due_date;

        let id = job.id.clone();
        ctx.schedule_job(job);
        Ok(id)
    }
}
