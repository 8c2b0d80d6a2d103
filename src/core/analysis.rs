//! Whole-graph analysis of an admitted task set.

use crate::core::dag::{ExecutionPath, TaskDAG};
use crate::core::task::{TaskId, TaskSet};
use crate::error::{Error, Result};
use crate::{twlog_debug, twlog_warn};
use serde::Serialize;

/// Predecessors of a single task, merged over every path that reaches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalPath {
    pub task_id: TaskId,
    /// All tasks that must finish before `task_id`, then `task_id` itself.
    pub path: ExecutionPath,
}

/// Result of analyzing one task set.
///
/// When `has_cycles` is set the graph cannot be scheduled: groups and paths
/// are empty and `max_depth` is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphAnalysis {
    pub has_cycles: bool,
    /// Tasks on the first cycle found, when there is one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cycle: Vec<TaskId>,
    pub max_depth: usize,
    pub parallel_groups: Vec<Vec<TaskId>>,
    pub dependency_paths: Vec<ExecutionPath>,
    pub canonical_paths: Vec<CanonicalPath>,
    pub independent_task_count: usize,
    pub task_count: usize,
}

impl GraphAnalysis {
    fn cyclic(cycle: Vec<TaskId>, dag: &TaskDAG) -> Self {
        Self {
            has_cycles: true,
            cycle,
            max_depth: 0,
            parallel_groups: Vec::new(),
            dependency_paths: Vec::new(),
            canonical_paths: Vec::new(),
            independent_task_count: dag.independent_task_count(),
            task_count: dag.task_count(),
        }
    }

    /// Fail with [`Error::Cycle`] when the graph cannot be scheduled.
    pub fn ensure_acyclic(&self) -> Result<()> {
        if self.has_cycles {
            Err(Error::Cycle)
        } else {
            Ok(())
        }
    }

    pub fn canonical_path(&self, task_id: &str) -> Option<&ExecutionPath> {
        self.canonical_paths
            .iter()
            .find(|c| c.task_id == *task_id)
            .map(|c| &c.path)
    }

    /// Zero-based index of the parallel group containing the task.
    pub fn group_of(&self, task_id: &str) -> Option<usize> {
        self.parallel_groups
            .iter()
            .position(|g| g.iter().any(|id| id == task_id))
    }
}

/// Builds the dependency graph and derives groups, paths and canonical paths.
pub struct GraphAnalyzer;

impl GraphAnalyzer {
    pub fn analyze(tasks: &TaskSet) -> Result<GraphAnalysis> {
        twlog_debug!(
            "GraphAnalyzer::analyze tasks={} excluded={}",
            tasks.len(),
            tasks.exclusions().len()
        );
        let dag = TaskDAG::from_task_set(tasks);
        Self::analyze_dag(&dag)
    }

    pub fn analyze_dag(dag: &TaskDAG) -> Result<GraphAnalysis> {
        if let Some(cycle) = dag.find_cycle() {
            let rendered: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            twlog_warn!("Dependency cycle detected: {}", rendered.join(" -> "));
            return Ok(GraphAnalysis::cyclic(cycle, dag));
        }

        let parallel_groups = dag.parallel_groups()?;
        let max_depth = dag.max_depth()?;
        let dependency_paths = dag.dependency_paths();
        let canonical_paths = dag
            .canonical_paths(&dependency_paths)
            .into_iter()
            .map(|(task_id, path)| CanonicalPath { task_id, path })
            .collect();

        let analysis = GraphAnalysis {
            has_cycles: false,
            cycle: Vec::new(),
            max_depth,
            parallel_groups,
            dependency_paths,
            canonical_paths,
            independent_task_count: dag.independent_task_count(),
            task_count: dag.task_count(),
        };
        twlog_debug!(
            "GraphAnalyzer: groups={} paths={} max_depth={} independent={}",
            analysis.parallel_groups.len(),
            analysis.dependency_paths.len(),
            analysis.max_depth,
            analysis.independent_task_count
        );
        Ok(analysis)
    }
}
