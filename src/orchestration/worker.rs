//! Worker agents: the collaborators that perform a task's actual work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::{TaskId, TaskParams};
use crate::error::{Error, Result};
use crate::orchestration::registry::CapabilityRegistry;
use crate::state::RunId;
use crate::{twlog_debug, twlog_trace};

/// Output of a finished dependency, handed to its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub task_id: TaskId,
    pub agent: String,
    pub payload: serde_json::Value,
}

/// Everything a worker receives for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub description: String,
    pub tools: Vec<String>,
    pub tool_params: serde_json::Map<String, serde_json::Value>,
    pub params: TaskParams,
    /// Outputs of dependencies that succeeded, in declared dependency order.
    pub dependency_outputs: Vec<DependencyOutput>,
}

/// What a worker returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl WorkerOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A single blocking call per task; failures are reported, never retried.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &WorkerRequest) -> Result<WorkerOutput>;
}

/// Workers keyed by agent name.
#[derive(Clone, Default)]
pub struct WorkerSet {
    workers: HashMap<String, Arc<dyn WorkerAgent>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A command worker for every registered agent that declares a command.
    pub fn from_registry(registry: &CapabilityRegistry) -> Result<Self> {
        let mut set = Self::new();
        for agent in registry.agents() {
            if let Some(command) = &agent.command {
                set.register(Arc::new(CommandWorker::new(&agent.name, command, &agent.args)?));
            }
        }
        Ok(set)
    }

    /// An echo worker for every registered agent.
    pub fn echo_all(registry: &CapabilityRegistry) -> Self {
        let mut set = Self::new();
        for agent in registry.agents() {
            set.register(Arc::new(EchoWorker::new(&agent.name)));
        }
        set
    }

    /// Add a worker, replacing any existing one with the same name.
    pub fn register(&mut self, worker: Arc<dyn WorkerAgent>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn get(&self, agent: &str) -> Option<Arc<dyn WorkerAgent>> {
        self.workers.get(agent).cloned()
    }

    pub fn contains(&self, agent: &str) -> bool {
        self.workers.contains_key(agent)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.workers.keys().collect();
        names.sort();
        f.debug_struct("WorkerSet").field("workers", &names).finish()
    }
}

/// Returns its request as the payload. Used for dry runs.
#[derive(Debug, Clone)]
pub struct EchoWorker {
    name: String,
}

impl EchoWorker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl WorkerAgent for EchoWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: &WorkerRequest) -> Result<WorkerOutput> {
        let upstream: Vec<&TaskId> = request
            .dependency_outputs
            .iter()
            .map(|d| &d.task_id)
            .collect();
        Ok(WorkerOutput::new(json!({
            "task_id": request.task_id,
            "description": request.description,
            "tools": request.tools,
            "tool_params": request.tool_params,
            "upstream": upstream,
        }))
        .with_metadata(json!({ "worker": "echo", "agent": self.name })))
    }
}

/// Runs an external program per task.
///
/// The request is written to the program's stdin as JSON. Stdout is parsed
/// as JSON: an object with a `payload` key is taken as a full
/// [`WorkerOutput`], any other JSON value becomes the payload, and non-JSON
/// text is kept as a string payload. A non-zero exit fails the task.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandWorker {
    /// Resolve `command` on `PATH` unless it is already a path.
    pub fn new(name: &str, command: &str, args: &[String]) -> Result<Self> {
        let program = if command.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(command)
        } else {
            which::which(command).map_err(|_| Error::AgentNotFound(format!(
                "{} (command '{}' not on PATH)",
                name, command
            )))?
        };
        twlog_debug!("CommandWorker {} -> {}", name, program.display());
        Ok(Self {
            name: name.to_string(),
            program,
            args: args.to_vec(),
            timeout: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    async fn invoke(&self, input: Vec<u8>) -> Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input).await {
                // Programs that ignore stdin may exit before reading it.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        Ok(child.wait_with_output().await?)
    }

    fn parse_stdout(stdout: &str) -> WorkerOutput {
        match serde_json::from_str::<serde_json::Value>(stdout) {
            Ok(serde_json::Value::Object(mut map)) if map.contains_key("payload") => WorkerOutput {
                payload: map.remove("payload").unwrap_or_default(),
                metadata: map.remove("metadata").unwrap_or_default(),
            },
            Ok(value) => WorkerOutput::new(value),
            Err(_) => WorkerOutput::new(serde_json::Value::String(stdout.trim().to_string())),
        }
    }
}

#[async_trait]
impl WorkerAgent for CommandWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: &WorkerRequest) -> Result<WorkerOutput> {
        let input = serde_json::to_vec(request)?;
        twlog_trace!(
            "CommandWorker {} task={} input_bytes={}",
            self.name,
            request.task_id,
            input.len()
        );

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.invoke(input))
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => self.invoke(input).await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.program.display(),
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::TaskExecution {
                task_id: request.task_id.to_string(),
                message,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_stdout(&stdout))
    }
}
