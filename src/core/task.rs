//! Task data model and intake validation.
//!
//! Task lists come from an external planning step and are untrusted. They
//! arrive as [`RawTask`] records and are admitted into a [`TaskSet`] one task
//! at a time: malformed or unschedulable entries are recorded as
//! [`Exclusion`]s instead of failing the whole list.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque key-value payload handed to worker agents unexamined.
pub type TaskParams = serde_json::Map<String, serde_json::Value>;

/// Identifier of a task, unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for TaskId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TaskId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::borrow::Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An id as written by the planning oracle: language models emit both
/// `"id": "3"` and `"id": 3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn normalize(&self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Number(n) => n.to_string(),
        }
    }
}

/// A task record exactly as produced by the planning oracle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTask {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "deps", deserialize_with = "null_as_empty")]
    pub dependencies: Vec<RawId>,
    #[serde(default, alias = "assignedAgent", alias = "agent")]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub mappable: Option<bool>,
}

/// `"dependencies": null` means no dependencies.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RawId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<RawId>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The id of a record that failed to parse, if one can still be read.
fn readable_id(value: &serde_json::Value) -> Option<String> {
    match value.get("id")? {
        serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A normalized task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// Ordered, duplicate-free list of prerequisite task ids.
    pub dependencies: Vec<TaskId>,
    pub assigned_agent: Option<String>,
    pub params: TaskParams,
    /// `false` drops the task from the graph.
    pub mappable: bool,
}

impl Task {
    /// Create a mappable task with no dependencies assigned to `agent`.
    pub fn new(id: impl Into<TaskId>, agent: &str) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            dependencies: Vec::new(),
            assigned_agent: Some(agent.to_string()),
            params: TaskParams::new(),
            mappable: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = match params {
            serde_json::Value::Object(map) => map,
            _ => TaskParams::new(),
        };
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.assigned_agent = None;
        self
    }

    pub fn not_mappable(mut self) -> Self {
        self.mappable = false;
        self
    }

    /// The agent name, if one is assigned and non-blank.
    pub fn agent(&self) -> Option<&str> {
        self.assigned_agent
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }
}

impl RawTask {
    /// Normalize into a [`Task`]. Fails only when the record has no usable id.
    fn normalize(self) -> Option<Task> {
        let id = self.id.as_ref().map(RawId::normalize).filter(|s| !s.is_empty())?;

        let mut seen = HashSet::new();
        let dependencies = self
            .dependencies
            .iter()
            .map(RawId::normalize)
            .filter(|d| !d.is_empty())
            .filter(|d| seen.insert(d.clone()))
            .map(TaskId)
            .collect();

        let params = match self.params {
            Some(serde_json::Value::Object(map)) => map,
            Some(serde_json::Value::Null) | None => TaskParams::new(),
            Some(other) => {
                let mut map = TaskParams::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Some(Task {
            id: TaskId(id),
            description: self.description.unwrap_or_default(),
            dependencies,
            assigned_agent: self.assigned_agent,
            params,
            mappable: self.mappable.unwrap_or(true),
        })
    }
}

/// Why a task was left out of the schedulable graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum ExclusionReason {
    /// The record had no id.
    EmptyId,
    /// The record did not have the shape of a task.
    Malformed(String),
    /// A task with the same id appeared earlier in the list.
    DuplicateId,
    /// The task lists itself as a dependency.
    SelfDependency,
    /// No agent was assigned.
    Unassigned,
    /// The task was marked `mappable: false`.
    NotMappable,
    /// The assigned agent is not in the capability registry.
    UnknownAgent(String),
    /// A dependency id does not exist in the task list.
    UnresolvedDependency(TaskId),
    /// A dependency exists but was itself excluded.
    DependsOnExcluded(TaskId),
}

impl std::fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExclusionReason::EmptyId => write!(f, "missing id"),
            ExclusionReason::Malformed(detail) => write!(f, "malformed record: {}", detail),
            ExclusionReason::DuplicateId => write!(f, "duplicate id"),
            ExclusionReason::SelfDependency => write!(f, "depends on itself"),
            ExclusionReason::Unassigned => write!(f, "no assigned agent"),
            ExclusionReason::NotMappable => write!(f, "not mappable"),
            ExclusionReason::UnknownAgent(agent) => write!(f, "unknown agent: {}", agent),
            ExclusionReason::UnresolvedDependency(dep) => {
                write!(f, "unresolved dependency: {}", dep)
            }
            ExclusionReason::DependsOnExcluded(dep) => {
                write!(f, "depends on excluded task: {}", dep)
            }
        }
    }
}

/// A task rejected during intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    /// Empty when the record had no id.
    pub task_id: TaskId,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// One oracle record after parsing.
enum Intake {
    Task(Task),
    Rejected(Exclusion),
}

impl Intake {
    fn from_raw(record: RawTask) -> Self {
        match record.normalize() {
            Some(task) => Intake::Task(task),
            None => Intake::Rejected(Exclusion {
                task_id: TaskId::new(""),
                reason: ExclusionReason::EmptyId,
            }),
        }
    }

    fn from_value(value: serde_json::Value) -> Self {
        let id = readable_id(&value);
        match serde_json::from_value::<RawTask>(value) {
            Ok(record) => Self::from_raw(record),
            Err(e) => Intake::Rejected(Exclusion {
                task_id: TaskId(id.unwrap_or_default()),
                reason: ExclusionReason::Malformed(e.to_string()),
            }),
        }
    }
}

/// The schedulable tasks of one planning pass, in input order.
///
/// Every dependency of every task in the set refers to another task in the
/// set, and no task depends on itself. Cycles spanning several tasks are
/// still possible and are detected by the graph analyzer.
#[derive(Debug, Clone, Default)]
pub struct TaskSet {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    exclusions: Vec<Exclusion>,
}

impl TaskSet {
    /// Admit raw oracle output, accepting any agent name.
    pub fn from_raw(raw: Vec<RawTask>) -> Self {
        Self::from_raw_with(raw, |_| true)
    }

    /// Admit raw oracle output, excluding tasks whose agent fails `is_known_agent`.
    pub fn from_raw_with<F>(raw: Vec<RawTask>, is_known_agent: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        Self::admit(raw.into_iter().map(Intake::from_raw), is_known_agent)
    }

    /// Admit untyped oracle records, accepting any agent name.
    pub fn from_values(values: Vec<serde_json::Value>) -> Self {
        Self::from_values_with(values, |_| true)
    }

    /// Admit untyped oracle records one at a time. A record that does not
    /// parse as a task is excluded as [`ExclusionReason::Malformed`] under
    /// whatever id it carries, so its dependents are excluded with it.
    pub fn from_values_with<F>(values: Vec<serde_json::Value>, is_known_agent: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        Self::admit(values.into_iter().map(Intake::from_value), is_known_agent)
    }

    /// Parse a JSON array of raw tasks and admit it.
    ///
    /// Only input that is not a JSON array fails; bad elements are excluded.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Self::from_json_with(json, |_| true)
    }

    pub fn from_json_with<F>(json: &str, is_known_agent: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> bool,
    {
        let values: Vec<serde_json::Value> = serde_json::from_str(json)?;
        Ok(Self::from_values_with(values, is_known_agent))
    }

    /// Admit already-normalized tasks, accepting any agent name.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        Self::admit(tasks.into_iter().map(Intake::Task), |_| true)
    }

    fn admit<I, F>(entries: I, is_known_agent: F) -> Self
    where
        I: IntoIterator<Item = Intake>,
        F: Fn(&str) -> bool,
    {
        let mut exclusions = Vec::new();
        let mut excluded: HashSet<TaskId> = HashSet::new();
        let mut all_ids: HashSet<TaskId> = HashSet::new();
        let mut candidates: Vec<Task> = Vec::new();

        for entry in entries {
            let mut task = match entry {
                Intake::Task(task) => task,
                Intake::Rejected(exclusion) => {
                    // A rejected record with an id still claims it, so
                    // dependents cascade instead of dangling.
                    if !exclusion.task_id.as_str().is_empty()
                        && all_ids.insert(exclusion.task_id.clone())
                    {
                        excluded.insert(exclusion.task_id.clone());
                    }
                    exclusions.push(exclusion);
                    continue;
                }
            };
            if !all_ids.insert(task.id.clone()) {
                // The first occurrence keeps the id; dependents resolve to it.
                exclusions.push(Exclusion {
                    task_id: task.id.clone(),
                    reason: ExclusionReason::DuplicateId,
                });
                continue;
            }

            let mut seen = HashSet::new();
            task.dependencies.retain(|d| seen.insert(d.clone()));

            let reason = if task.dependencies.contains(&task.id) {
                Some(ExclusionReason::SelfDependency)
            } else if !task.mappable {
                Some(ExclusionReason::NotMappable)
            } else {
                match task.agent() {
                    None => Some(ExclusionReason::Unassigned),
                    Some(agent) if !is_known_agent(agent) => {
                        Some(ExclusionReason::UnknownAgent(agent.to_string()))
                    }
                    Some(_) => None,
                }
            };

            match reason {
                Some(reason) => {
                    excluded.insert(task.id.clone());
                    exclusions.push(Exclusion {
                        task_id: task.id.clone(),
                        reason,
                    });
                }
                None => candidates.push(task),
            }
        }

        // Exclusion cascades to dependents regardless of list order.
        loop {
            let mut changed = false;
            for task in &candidates {
                if excluded.contains(&task.id) {
                    continue;
                }
                let reason = task.dependencies.iter().find_map(|dep| {
                    if !all_ids.contains(dep) {
                        Some(ExclusionReason::UnresolvedDependency(dep.clone()))
                    } else if excluded.contains(dep) {
                        Some(ExclusionReason::DependsOnExcluded(dep.clone()))
                    } else {
                        None
                    }
                });
                if let Some(reason) = reason {
                    excluded.insert(task.id.clone());
                    exclusions.push(Exclusion {
                        task_id: task.id.clone(),
                        reason,
                    });
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let tasks: Vec<Task> = candidates
            .into_iter()
            .filter(|t| !excluded.contains(&t.id))
            .collect();
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        Self {
            tasks,
            index,
            exclusions,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position of the task in the input order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn exclusions(&self) -> &[Exclusion] {
        &self.exclusions
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.exclusions.iter().any(|e| e.task_id.as_str() == id)
    }
}
