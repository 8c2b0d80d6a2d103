//! Runs execution units against the run store.
//!
//! Every unit is its own future and all units are polled together. Within a
//! unit tasks run in path order. A task shared by several units runs once,
//! in whichever unit reaches it first; the others gate on its completion
//! through the store like any other dependency.
//!
//! Concurrency is bounded by a semaphore held only for the duration of the
//! worker call. A task waiting on its dependencies holds no permit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::{DEFAULT_DEPENDENCY_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_TASKS};
use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::orchestration::planner::{ExecutionUnit, TaskPlan};
use crate::orchestration::worker::{DependencyOutput, WorkerOutput, WorkerRequest, WorkerSet};
use crate::state::{RunId, RunStatus, RunStore};
use crate::util::blocking;
use crate::{twlog, twlog_debug, twlog_trace, twlog_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Worker calls allowed in flight at once.
    pub max_concurrent_tasks: usize,
    /// How long a task waits for its dependencies before failing.
    pub dependency_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            dependency_timeout: Duration::from_secs(DEFAULT_DEPENDENCY_TIMEOUT_SECS),
        }
    }
}

/// Outcome of one task as seen by the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub path_id: String,
    pub agent: String,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub output_ref: Option<i64>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

pub struct Executor {
    store: Arc<RunStore>,
    workers: Arc<WorkerSet>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(store: Arc<RunStore>, workers: Arc<WorkerSet>, config: ExecutorConfig) -> Self {
        Self {
            store,
            workers,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute all units for a run. Task failures are recorded and returned,
    /// never propagated.
    pub async fn execute(&self, run_id: &RunId, units: &[ExecutionUnit]) -> Vec<TaskResult> {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let claimed: Mutex<HashSet<TaskId>> = Mutex::new(HashSet::new());

        twlog!(
            "Executing run {} units={} max_concurrent={}",
            run_id,
            units.len(),
            self.config.max_concurrent_tasks
        );

        let per_unit = join_all(
            units
                .iter()
                .map(|unit| self.run_unit(run_id, unit, &permits, &claimed)),
        )
        .await;

        per_unit.into_iter().flatten().collect()
    }

    async fn run_unit(
        &self,
        run_id: &RunId,
        unit: &ExecutionUnit,
        permits: &Arc<Semaphore>,
        claimed: &Mutex<HashSet<TaskId>>,
    ) -> Vec<TaskResult> {
        let mut results = Vec::new();
        for plan in &unit.per_task_plan {
            let first = claimed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(plan.task_id.clone());
            if !first {
                twlog_trace!("{}: task {} claimed by another unit", unit.path_id, plan.task_id);
                continue;
            }
            results.push(self.run_task(run_id, &unit.path_id, plan, permits).await);
        }
        results
    }

    async fn run_task(
        &self,
        run_id: &RunId,
        path_id: &str,
        plan: &TaskPlan,
        permits: &Arc<Semaphore>,
    ) -> TaskResult {
        let mut result = TaskResult {
            task_id: plan.task_id.clone(),
            path_id: path_id.to_string(),
            agent: plan.agent.clone(),
            status: RunStatus::Failed,
            duration_ms: 0,
            output_ref: None,
            error: None,
        };

        if let Err(e) = self.wait_for_dependencies(run_id, plan).await {
            twlog_warn!("Task {} not started: {}", plan.task_id, e);
            let message = e.to_string();
            if let Err(store_err) = self.record_unstarted_failure(run_id, plan, &message).await {
                twlog_warn!("Could not record failure of {}: {}", plan.task_id, store_err);
            }
            result.error = Some(message);
            return result;
        }

        if let Err(e) = self.start(run_id, plan).await {
            twlog_warn!("Task {} could not start: {}", plan.task_id, e);
            let message = e.to_string();
            if let Err(store_err) = self.record_unstarted_failure(run_id, plan, &message).await {
                twlog_warn!("Could not record failure of {}: {}", plan.task_id, store_err);
            }
            result.error = Some(message);
            return result;
        }

        let dependency_outputs = match self.collect_dependency_outputs(run_id, plan).await {
            Ok(outputs) => outputs,
            Err(e) => {
                let message = e.to_string();
                twlog_warn!("Task {} inputs unavailable: {}", plan.task_id, message);
                if let Err(store_err) = self
                    .complete(run_id, plan, RunStatus::Failed, 0, None, Some(message.clone()))
                    .await
                {
                    twlog_warn!("Could not record failure of {}: {}", plan.task_id, store_err);
                }
                result.error = Some(message);
                return result;
            }
        };

        let request = WorkerRequest {
            run_id: run_id.clone(),
            task_id: plan.task_id.clone(),
            description: plan.description.clone(),
            tools: plan.tools.clone(),
            tool_params: plan.tool_params.clone(),
            params: plan.params.clone(),
            dependency_outputs,
        };

        let started = Instant::now();
        let outcome = self.call_worker(&plan.agent, &request, permits).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        let recorded = match outcome {
            Ok(output) => self.record_success(run_id, plan, output, result.duration_ms).await,
            Err(e) => Err(e),
        };

        match recorded {
            Ok(output_ref) => {
                twlog_debug!(
                    "Task {} succeeded in {}ms ({})",
                    plan.task_id,
                    result.duration_ms,
                    path_id
                );
                result.status = RunStatus::Success;
                result.output_ref = Some(output_ref);
            }
            Err(e) => {
                let message = e.to_string();
                twlog_warn!("Task {} failed: {}", plan.task_id, message);
                if let Err(store_err) = self
                    .complete(run_id, plan, RunStatus::Failed, result.duration_ms, None, Some(message.clone()))
                    .await
                {
                    twlog_warn!("Could not record failure of {}: {}", plan.task_id, store_err);
                }
                result.error = Some(message);
            }
        }
        result
    }

    async fn call_worker(
        &self,
        agent: &str,
        request: &WorkerRequest,
        permits: &Arc<Semaphore>,
    ) -> Result<WorkerOutput> {
        let worker = self
            .workers
            .get(agent)
            .ok_or_else(|| Error::AgentNotFound(agent.to_string()))?;
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| Error::Internal("worker pool closed".to_string()))?;
        twlog_trace!("Worker {} running task {}", agent, request.task_id);
        worker.run(request).await
    }

    /// Wait until every dependency reached a terminal status.
    async fn wait_for_dependencies(&self, run_id: &RunId, plan: &TaskPlan) -> Result<()> {
        if plan.dependencies.is_empty() {
            return Ok(());
        }
        // Subscribe before checking so a completion in between is not lost.
        let mut completions = self.store.subscribe();
        let deadline = tokio::time::Instant::now() + self.config.dependency_timeout;

        loop {
            let (store, run, deps) = (
                self.store.clone(),
                run_id.clone(),
                plan.dependencies.clone(),
            );
            if blocking(move || store.are_dependencies_complete(&run, &deps)).await? {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, completions.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::Internal("completion channel closed".to_string())),
                Err(_) => {
                    return Err(Error::DependencyTimeout {
                        task_id: plan.task_id.to_string(),
                        waited: self.config.dependency_timeout,
                    })
                }
            }
        }
    }

    async fn collect_dependency_outputs(
        &self,
        run_id: &RunId,
        plan: &TaskPlan,
    ) -> Result<Vec<DependencyOutput>> {
        let (store, run, deps) = (self.store.clone(), run_id.clone(), plan.dependencies.clone());
        blocking(move || {
            let mut outputs = Vec::new();
            for dep in &deps {
                if let Some(output) = store.get_task_output(&run, dep)? {
                    outputs.push(DependencyOutput {
                        task_id: output.task_id,
                        agent: output.agent,
                        payload: output.payload,
                    });
                }
            }
            Ok(outputs)
        })
        .await
    }

    async fn start(&self, run_id: &RunId, plan: &TaskPlan) -> Result<()> {
        let (store, run, task, agent) = (
            self.store.clone(),
            run_id.clone(),
            plan.task_id.clone(),
            plan.agent.clone(),
        );
        blocking(move || store.start_task(&run, &task, &agent)).await
    }

    async fn complete(
        &self,
        run_id: &RunId,
        plan: &TaskPlan,
        status: RunStatus,
        duration_ms: u64,
        output_ref: Option<i64>,
        error: Option<String>,
    ) -> Result<()> {
        let (store, run, task) = (self.store.clone(), run_id.clone(), plan.task_id.clone());
        blocking(move || {
            store.complete_task(&run, &task, status, duration_ms, output_ref, error.as_deref())
        })
        .await
    }

    /// Store the output, then mark the task complete pointing at it.
    async fn record_success(
        &self,
        run_id: &RunId,
        plan: &TaskPlan,
        output: WorkerOutput,
        duration_ms: u64,
    ) -> Result<i64> {
        let (store, run, task, agent) = (
            self.store.clone(),
            run_id.clone(),
            plan.task_id.clone(),
            plan.agent.clone(),
        );
        let output_ref = blocking(move || {
            store.store_output(&run, &task, &agent, &output.payload, &output.metadata)
        })
        .await?;
        self.complete(run_id, plan, RunStatus::Success, duration_ms, Some(output_ref), None)
            .await?;
        Ok(output_ref)
    }

    /// A task that never started still gets a failed row. A row left
    /// running by an earlier start is failed in place so dependents are
    /// not held until their timeout.
    async fn record_unstarted_failure(
        &self,
        run_id: &RunId,
        plan: &TaskPlan,
        message: &str,
    ) -> Result<()> {
        match self.start(run_id, plan).await {
            Ok(()) | Err(Error::DuplicateTask { .. }) => {}
            Err(e) => return Err(e),
        }
        self.complete(run_id, plan, RunStatus::Failed, 0, None, Some(message.to_string()))
            .await
    }
}
