//! Path-scoped execution planning.
//!
//! Each dependency path becomes one [`ExecutionUnit`]. A unit carries only
//! the agents and capabilities that tasks on its path actually invoke, so a
//! worker never sees tools it was not asked to use.

use serde::Serialize;

use crate::core::{ExecutionPath, Task, TaskId, TaskParams, TaskSet};
use crate::orchestration::registry::CapabilityRegistry;
use crate::twlog_debug;

/// Params key listing capabilities explicitly.
const TOOLS_KEY: &str = "tools";

/// What a single task will run with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPlan {
    pub task_id: TaskId,
    pub agent: String,
    pub agent_description: String,
    pub description: String,
    pub dependencies: Vec<TaskId>,
    /// Capabilities of the agent that the task's params invoke, in the
    /// agent's declaration order.
    pub tools: Vec<String>,
    /// Per-tool parameters; `null` when params name a tool without arguments.
    pub tool_params: serde_json::Map<String, serde_json::Value>,
    pub params: TaskParams,
}

/// One dependency path prepared for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUnit {
    pub path_id: String,
    pub task_ids: Vec<TaskId>,
    pub mappable_task_ids: Vec<TaskId>,
    pub agents_referenced: Vec<String>,
    pub per_task_plan: Vec<TaskPlan>,
}

impl ExecutionUnit {
    pub fn plan_for(&self, task_id: &str) -> Option<&TaskPlan> {
        self.per_task_plan.iter().find(|p| p.task_id == *task_id)
    }

    pub fn is_empty(&self) -> bool {
        self.per_task_plan.is_empty()
    }
}

/// Turns dependency paths into execution units against a fixed registry.
pub struct PathPlanner<'a> {
    registry: &'a CapabilityRegistry,
}

impl<'a> PathPlanner<'a> {
    pub fn new(registry: &'a CapabilityRegistry) -> Self {
        Self { registry }
    }

    /// Plan every path, numbering units `path-1`, `path-2`, ...
    pub fn plan_all(&self, paths: &[ExecutionPath], tasks: &TaskSet) -> Vec<ExecutionUnit> {
        let units: Vec<ExecutionUnit> = paths
            .iter()
            .enumerate()
            .map(|(i, path)| self.plan_path(&format!("path-{}", i + 1), path, tasks))
            .collect();
        twlog_debug!(
            "PathPlanner: planned {} units over {} tasks",
            units.len(),
            tasks.len()
        );
        units
    }

    pub fn plan_path(&self, path_id: &str, path: &ExecutionPath, tasks: &TaskSet) -> ExecutionUnit {
        let mut mappable_task_ids = Vec::new();
        let mut agents_referenced: Vec<String> = Vec::new();
        let mut per_task_plan = Vec::new();

        for task_id in path {
            let Some(plan) = tasks.get(task_id.as_str()).and_then(|t| self.plan_task(t)) else {
                continue;
            };
            if !agents_referenced.contains(&plan.agent) {
                agents_referenced.push(plan.agent.clone());
            }
            mappable_task_ids.push(task_id.clone());
            per_task_plan.push(plan);
        }

        ExecutionUnit {
            path_id: path_id.to_string(),
            task_ids: path.clone(),
            mappable_task_ids,
            agents_referenced,
            per_task_plan,
        }
    }

    /// Plan one task; `None` when it cannot be executed.
    pub fn plan_task(&self, task: &Task) -> Option<TaskPlan> {
        if !task.mappable {
            return None;
        }
        let agent = self.registry.get(task.agent()?)?;
        let invoked = invoked_capabilities(&task.params);

        let mut tools = Vec::new();
        let mut tool_params = serde_json::Map::new();
        for capability in &agent.capabilities {
            if invoked.iter().any(|name| name == &capability.name) {
                tools.push(capability.name.clone());
                tool_params.insert(
                    capability.name.clone(),
                    task.params
                        .get(&capability.name)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                );
            }
        }

        Some(TaskPlan {
            task_id: task.id.clone(),
            agent: agent.name.clone(),
            agent_description: agent.description.clone(),
            description: task.description.clone(),
            dependencies: task.dependencies.clone(),
            tools,
            tool_params,
            params: task.params.clone(),
        })
    }
}

/// Capability names a params object refers to: its keys plus any names
/// listed under `tools`.
fn invoked_capabilities(params: &TaskParams) -> Vec<&str> {
    let mut names: Vec<&str> = params.keys().map(String::as_str).collect();
    if let Some(serde_json::Value::Array(tools)) = params.get(TOOLS_KEY) {
        names.extend(tools.iter().filter_map(|t| t.as_str()));
    }
    names
}
