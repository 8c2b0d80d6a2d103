//! End-to-end run: admit, analyze and plan, then record planning rows,
//! execute and summarize.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::core::{Exclusion, GraphAnalysis, GraphAnalyzer, RawTask, TaskId, TaskSet};
use crate::error::Result;
use crate::orchestration::executor::{Executor, ExecutorConfig, TaskResult};
use crate::orchestration::planner::{ExecutionUnit, PathPlanner};
use crate::orchestration::registry::CapabilityRegistry;
use crate::orchestration::worker::WorkerSet;
use crate::state::{RunId, RunStore, RunSummary};
use crate::util::blocking;
use crate::{twlog, twlog_debug, twlog_error, twlog_warn};

/// A validated, planned task set. Building one has no side effects.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedRun {
    #[serde(skip)]
    pub tasks: TaskSet,
    pub analysis: GraphAnalysis,
    pub units: Vec<ExecutionUnit>,
    pub exclusions: Vec<Exclusion>,
}

impl PreparedRun {
    /// Number of distinct tasks that will be handed to a worker.
    pub fn mappable_task_count(&self) -> usize {
        self.units
            .iter()
            .flat_map(|u| u.mappable_task_ids.iter())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Outcome of one executed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub summary: RunSummary,
    pub results: Vec<TaskResult>,
    pub exclusions: Vec<Exclusion>,
}

pub struct RunPipeline {
    registry: Arc<CapabilityRegistry>,
    store: Arc<RunStore>,
    workers: Arc<WorkerSet>,
    config: ExecutorConfig,
}

impl RunPipeline {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<RunStore>,
        workers: Arc<WorkerSet>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            workers,
            config,
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// Admit raw oracle output, excluding tasks whose agent is not registered.
    pub fn admit(&self, raw: Vec<RawTask>) -> TaskSet {
        log_exclusions(TaskSet::from_raw_with(raw, |agent| self.registry.contains(agent)))
    }

    /// Admit a JSON array of oracle records. Elements that are not valid
    /// tasks are excluded one by one; only a non-array input is an error.
    pub fn admit_json(&self, json: &str) -> Result<TaskSet> {
        let tasks = TaskSet::from_json_with(json, |agent| self.registry.contains(agent))?;
        Ok(log_exclusions(tasks))
    }

    /// Analyze and plan. Fails with [`crate::Error::Cycle`] on a cyclic graph.
    pub fn prepare(&self, tasks: TaskSet) -> Result<PreparedRun> {
        let analysis = GraphAnalyzer::analyze(&tasks)?;
        analysis.ensure_acyclic()?;
        let units = PathPlanner::new(&self.registry).plan_all(&analysis.dependency_paths, &tasks);
        let exclusions = tasks.exclusions().to_vec();
        Ok(PreparedRun {
            tasks,
            analysis,
            units,
            exclusions,
        })
    }

    /// Execute a prepared run under a fresh run id.
    pub async fn execute(&self, request: &str, prepared: &PreparedRun) -> Result<RunReport> {
        self.execute_as(RunId::generate(), request, prepared).await
    }

    pub async fn execute_as(
        &self,
        run_id: RunId,
        request: &str,
        prepared: &PreparedRun,
    ) -> Result<RunReport> {
        {
            let (store, run, request) = (self.store.clone(), run_id.clone(), request.to_string());
            blocking(move || store.begin_run(&run, &request).map(|_| ())).await?;
        }
        twlog!(
            "Run {} started: {} tasks, {} units",
            run_id,
            prepared.tasks.len(),
            prepared.units.len()
        );

        let results = if prepared.mappable_task_count() == 0 {
            twlog_warn!("Run {} has no mappable tasks", run_id);
            Vec::new()
        } else {
            // Planning rows are bookkeeping; the run goes on without them.
            if let Err(e) = self.record_graph(&run_id, prepared).await {
                twlog_error!("Run {}: could not record planning rows: {}", run_id, e);
            }
            if let Err(e) = self.record_tools(&run_id, prepared).await {
                twlog_error!("Run {}: could not record planned tools: {}", run_id, e);
            }
            Executor::new(self.store.clone(), self.workers.clone(), self.config.clone())
                .execute(&run_id, &prepared.units)
                .await
        };

        let (store, run) = (self.store.clone(), run_id.clone());
        let summary = blocking(move || {
            store.finish_run(&run)?;
            store.get_run_summary(&run)
        })
        .await?;
        twlog!(
            "Run {} finished: {} succeeded, {} failed",
            run_id,
            summary.success,
            summary.failed
        );

        Ok(RunReport {
            run_id,
            summary,
            results,
            exclusions: prepared.exclusions.clone(),
        })
    }

    /// Insert one planning row per task of the analyzed graph, in input order,
    /// carrying its agent and canonical path.
    ///
    /// [`RunPipeline::prepare`] has no side effects and the run id only exists
    /// once execution begins, so this is the first point rows can be written.
    /// Tools are filled in afterwards by [`RunPipeline::record_tools`]; a task
    /// the planner left out of every unit keeps `tools` unset.
    async fn record_graph(&self, run_id: &RunId, prepared: &PreparedRun) -> Result<()> {
        let rows: Vec<(TaskId, String, String, Vec<TaskId>)> = prepared
            .tasks
            .iter()
            .map(|task| {
                let agent = task.agent().unwrap_or_default().to_string();
                let description = self.registry.description_of(&agent).to_string();
                let path = prepared
                    .analysis
                    .canonical_path(task.id.as_str())
                    .cloned()
                    .unwrap_or_else(|| vec![task.id.clone()]);
                (task.id.clone(), agent, description, path)
            })
            .collect();

        let (store, run) = (self.store.clone(), run_id.clone());
        blocking(move || {
            for (task_id, agent, description, path) in &rows {
                store.insert_plan_row(&run, task_id, agent, description, path)?;
            }
            twlog_debug!("Recorded {} planning rows for run {}", rows.len(), run);
            Ok(())
        })
        .await
    }

    /// Fill in the resolved tools of every task some unit plans to run.
    async fn record_tools(&self, run_id: &RunId, prepared: &PreparedRun) -> Result<()> {
        let mut seen: HashSet<TaskId> = HashSet::new();
        let plans: Vec<_> = prepared
            .units
            .iter()
            .flat_map(|u| u.per_task_plan.iter())
            .filter(|p| seen.insert(p.task_id.clone()))
            .map(|p| {
                (
                    p.task_id.clone(),
                    p.tools.clone(),
                    serde_json::Value::Object(p.tool_params.clone()),
                )
            })
            .collect();

        let (store, run) = (self.store.clone(), run_id.clone());
        blocking(move || {
            for (task_id, tools, tool_params) in &plans {
                store.update_plan_tools(&run, task_id, tools, tool_params)?;
            }
            Ok(())
        })
        .await
    }
}

fn log_exclusions(tasks: TaskSet) -> TaskSet {
    for exclusion in tasks.exclusions() {
        twlog_warn!(
            "Excluded task '{}': {}",
            exclusion.task_id,
            exclusion.reason
        );
    }
    tasks
}
