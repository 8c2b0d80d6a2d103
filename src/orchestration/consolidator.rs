//! Merges the stored outputs of a run into one result.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::state::{RunId, RunStore, RunSummary};
use crate::twlog_debug;

/// Latest output of one task, with the path that led to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedOutput {
    pub task_id: TaskId,
    pub agent: String,
    pub canonical_path: Vec<TaskId>,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedResult {
    pub run_id: RunId,
    pub summary: RunSummary,
    pub outputs: Vec<ConsolidatedOutput>,
    pub failures: Vec<TaskFailure>,
}

impl ConsolidatedResult {
    pub fn output_of(&self, task_id: &str) -> Option<&ConsolidatedOutput> {
        self.outputs.iter().find(|o| o.task_id == *task_id)
    }
}

pub struct Consolidator;

impl Consolidator {
    /// Read everything recorded for `run_id`. Outputs keep the order in
    /// which tasks first produced one; a task that produced several keeps
    /// only the latest.
    pub fn consolidate(store: &RunStore, run_id: &RunId) -> Result<ConsolidatedResult> {
        if store.get_run(run_id)?.is_none() {
            return Err(Error::UnknownRun(run_id.to_string()));
        }

        let paths: HashMap<TaskId, Vec<TaskId>> = store
            .get_plan(run_id)?
            .into_iter()
            .map(|row| (row.task_id, row.canonical_path))
            .collect();

        let mut outputs: Vec<ConsolidatedOutput> = Vec::new();
        let mut slot: HashMap<TaskId, usize> = HashMap::new();
        for output in store.get_all_task_outputs(run_id)? {
            let merged = ConsolidatedOutput {
                canonical_path: paths
                    .get(&output.task_id)
                    .cloned()
                    .unwrap_or_else(|| vec![output.task_id.clone()]),
                task_id: output.task_id,
                agent: output.agent,
                payload: output.payload,
                metadata: output.metadata,
            };
            match slot.get(&merged.task_id) {
                Some(&i) => outputs[i] = merged,
                None => {
                    slot.insert(merged.task_id.clone(), outputs.len());
                    outputs.push(merged);
                }
            }
        }

        let failures = store
            .get_failed_tasks(run_id)?
            .into_iter()
            .map(|row| TaskFailure {
                task_id: row.task_id,
                error: row.error.unwrap_or_default(),
            })
            .collect::<Vec<_>>();

        let summary = store.get_run_summary(run_id)?;
        twlog_debug!(
            "Consolidator: run={} outputs={} failures={}",
            run_id,
            outputs.len(),
            failures.len()
        );

        Ok(ConsolidatedResult {
            run_id: run_id.clone(),
            summary,
            outputs,
            failures,
        })
    }
}
