use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency graph contains a cycle")]
    Cycle,

    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnresolvedDependency { task_id: String, dependency: String },

    #[error("Task {task_id} already started in run {run_id}")]
    DuplicateTask { run_id: String, task_id: String },

    #[error("Task {task_id} was never started in run {run_id}")]
    UnknownTask { run_id: String, task_id: String },

    #[error("Task {task_id} already completed in run {run_id}")]
    TaskAlreadyCompleted { run_id: String, task_id: String },

    #[error("Run not found: {0}")]
    UnknownRun(String),

    #[error("Task {task_id} failed: {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Dependencies of task {task_id} not complete after {waited:?}")]
    DependencyTimeout { task_id: String, waited: Duration },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
