//! Job Executor
//!
//! Acquires due jobs from the store and runs each one on a worker thread,
//! never more than `max_parallel` at a time. Every job runs in its own
//! command; a failure only touches that job.
//!
//! # Example
//!
//! ```rust,no_run
//! use procrunner::execution::ProcessEngine;
//! use procrunner::jobs::JobExecutor;
//!
//! let engine = ProcessEngine::default();
//! let mut executor = JobExecutor::new(engine);
//! executor.set_max_parallel(4);
//!
//! let summary = executor.run_until_idle().unwrap();
//! println!("{} jobs completed", summary.completed);
//! ```

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use super::model::{Job, JobOutcome};
use crate::error::{EngineError, EngineResult};
use crate::execution::ProcessEngine;

/// Tally of one executor run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutorSummary {
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl ExecutorSummary {
    pub fn record(&mut self, outcome: &EngineResult<JobOutcome>) {
        match outcome {
            Ok(JobOutcome::Completed) => self.completed += 1,
            Ok(JobOutcome::Failed { .. }) => self.failed += 1,
            Ok(JobOutcome::Dead) => self.dead += 1,
            Ok(JobOutcome::Skipped) => self.skipped += 1,
            Ok(JobOutcome::Conflict) => self.conflicts += 1,
            Err(_) => self.errors += 1,
        }
    }

    pub fn merge(&mut self, other: &ExecutorSummary) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.dead += other.dead;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
    }

    /// Attempts made, whatever their outcome.
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.dead + self.skipped + self.conflicts + self.errors
    }
}

/// Runs due jobs on a bounded pool of worker threads.
pub struct JobExecutor {
    engine: ProcessEngine,
    max_parallel: usize,
    acquisition_size: usize,
    idle_wait: Duration,
}

impl JobExecutor {
    /// Creates an executor sized from the engine configuration.
    pub fn new(engine: ProcessEngine) -> Self {
        let config = engine.config();
        let max_parallel = config.worker_threads();
        let acquisition_size = config.job_acquisition_size.max(1);
        let idle_wait = config.job_idle_wait();
        Self {
            engine,
            max_parallel,
            acquisition_size,
            idle_wait,
        }
    }

    /// Set maximum number of jobs running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    pub fn set_acquisition_size(&mut self, size: usize) {
        self.acquisition_size = size.max(1);
    }

    pub fn set_idle_wait(&mut self, wait: Duration) {
        self.idle_wait = wait;
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Runs jobs until none is due and none is running.
    ///
    /// Jobs that become due while others run (continuations scheduled by a
    /// finished job, retries) are picked up in the same run.
    pub fn run_until_idle(&self) -> EngineResult<ExecutorSummary> {
        let mut summary = ExecutorSummary::default();
        let mut queue: VecDeque<Job> = VecDeque::new();

        let (tx, rx): (
            Sender<(String, EngineResult<JobOutcome>)>,
            Receiver<(String, EngineResult<JobOutcome>)>,
        ) = channel();

        let mut running_count = 0;

        loop {
            if queue.is_empty() && running_count == 0 {
                queue.extend(self.engine.acquire_due_jobs(self.acquisition_size)?);
                if queue.is_empty() {
                    break;
                }
            }

            while running_count < self.max_parallel {
                let Some(job) = queue.pop_front() else {
                    break;
                };

                debug!("Dispatching {} job {}", job.handler_type, job.id);
                let tx = tx.clone();
                let engine = self.engine.clone();

                thread::spawn(move || {
                    let outcome = engine.execute_job(&job.id);
                    if let Err(e) = tx.send((job.id.clone(), outcome)) {
                        error!("Failed to send job completion signal: {}", e);
                    }
                });

                running_count += 1;
            }

            if running_count > 0 {
                let (job_id, outcome) = rx
                    .recv()
                    .map_err(|e| EngineError::Worker(format!("job worker channel closed: {}", e)))?;
                running_count -= 1;

                match &outcome {
                    Ok(JobOutcome::Completed) => debug!("Job {} completed", job_id),
                    Ok(other) => debug!("Job {} finished as {:?}", job_id, other),
                    Err(e) => warn!("Job {} could not be executed: {}", job_id, e),
                }
                summary.record(&outcome);
            }
        }

        if summary.total() > 0 {
            info!(
                "Job executor idle: {} completed, {} failed, {} dead, {} skipped, {} conflicts",
                summary.completed, summary.failed, summary.dead, summary.skipped, summary.conflicts
            );
        }
        Ok(summary)
    }

    /// Polls for due jobs until `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> EngineResult<ExecutorSummary> {
        let mut total = ExecutorSummary::default();
        let idle_wait = self.idle_wait;
        let executor = std::sync::Arc::new(self);

        info!(
            "Job executor started (max parallel: {}, acquisition size: {})",
            executor.max_parallel, executor.acquisition_size
        );

        while !*shutdown.borrow() {
            let worker = std::sync::Arc::clone(&executor);
            let round = tokio::task::spawn_blocking(move || worker.run_until_idle())
                .await
                .map_err(|e| EngineError::Worker(e.to_string()))?;

            match round {
                Ok(summary) => total.merge(&summary),
                Err(e) => error!("Job acquisition failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(idle_wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Job executor stopped after {} attempts", total.total());
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::process::{FlowNode, NodeKind, ProcessDefinition};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn async_process() -> ProcessDefinition {
        ProcessDefinition::new("async")
            .node(FlowNode::new("start", NodeKind::StartEvent))
            .node(FlowNode::new("work", NodeKind::ManualTask).async_before())
            .node(FlowNode::new("end", NodeKind::EndEvent { terminate: false }))
            .flow("f1", "start", "work")
            .flow("f2", "work", "end")
    }

    #[test]
    fn test_summary_record() {
        let mut summary = ExecutorSummary::default();
        summary.record(&Ok(JobOutcome::Completed));
        summary.record(&Ok(JobOutcome::Failed { retries_left: 2 }));
        summary.record(&Ok(JobOutcome::Dead));
        summary.record(&Err(EngineError::JobNotFound("1".to_string())));

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.dead, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn test_executor_setters() {
        let mut executor = JobExecutor::new(ProcessEngine::default());
        executor.set_max_parallel(0);
        assert_eq!(executor.max_parallel(), 1);

        executor.set_max_parallel(8);
        assert_eq!(executor.max_parallel(), 8);
    }

    #[test]
    fn test_run_until_idle_completes_async_instances() {
        let engine = ProcessEngine::default();
        engine.deploy(async_process()).unwrap();

        let instances: Vec<String> = (0..5)
            .map(|_| engine.start_process("async", BTreeMap::new()).unwrap())
            .collect();

        let mut executor = JobExecutor::new(engine.clone());
        executor.set_max_parallel(3);
        let summary = executor.run_until_idle().unwrap();

        assert_eq!(summary.completed, 5);
        for pi in instances {
            assert!(engine.executions(&pi).unwrap().is_empty());
        }
    }

    #[test]
    fn test_failing_job_retried_until_dead() {
        let mut config = EngineConfig::default();
        config.set_default_job_retries(3);
        let engine = ProcessEngine::new(config);

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        engine.register_job_fn("flaky", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("downstream unavailable".into())
        });
        let job_id = engine.schedule_job("flaky", json!({}), None).unwrap();

        let summary = JobExecutor::new(engine.clone()).run_until_idle().unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.dead, 1);
        assert_eq!(engine.dead_jobs().unwrap()[0].id, job_id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let engine = ProcessEngine::default();
        engine.deploy(async_process()).unwrap();
        let pi = engine.start_process("async", BTreeMap::new()).unwrap();

        let mut executor = JobExecutor::new(engine.clone());
        executor.set_idle_wait(Duration::from_millis(10));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(executor.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.completed >= 1);
        assert!(engine.executions(&pi).unwrap().is_empty());
    }
}
