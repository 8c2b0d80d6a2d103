//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Predefined task sets (chain, diamond, fan-in, independent)
//! - A capability registry covering the fixture agents
//! - A scripted worker that records start/finish order and can fail on demand
//! - A harness wiring the pipeline to an in-memory store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use taskweave::core::{RawTask, Task, TaskId, TaskSet};
use taskweave::orchestration::{
    AgentSpec, CapabilityRegistry, ExecutorConfig, RunPipeline, RunReport, WorkerAgent,
    WorkerOutput, WorkerRequest, WorkerSet,
};
use taskweave::state::{RunId, RunStore};
use taskweave::{Error, Result};

/// Agents every fixture task is assigned to.
pub const AGENTS: [&str; 2] = ["sql", "web"];

pub fn registry() -> CapabilityRegistry {
    CapabilityRegistry::new(vec![
        AgentSpec::new("sql", "Runs read-only warehouse queries")
            .with_capability("query", "Execute a SELECT")
            .with_capability("schema", "Describe a table"),
        AgentSpec::new("web", "Market data API")
            .with_capability("fetch_quote", "Latest quote for a ticker"),
    ])
    .expect("fixture registry is valid")
}

pub fn ids(list: &[&str]) -> Vec<TaskId> {
    list.iter().map(|s| TaskId::new(*s)).collect()
}

pub fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, "sql")
        .with_description(&format!("task {}", id))
        .with_dependencies(deps.iter().copied())
}

/// a -> b -> c
pub fn chain() -> TaskSet {
    TaskSet::from_tasks(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])])
}

/// root -> {left, right} -> join
pub fn diamond() -> TaskSet {
    TaskSet::from_tasks(vec![
        task("root", &[]),
        task("left", &["root"]),
        task("right", &["root"]),
        task("join", &["left", "right"]),
    ])
}

/// 1 and 2 feed 3.
pub fn fan_in() -> TaskSet {
    TaskSet::from_tasks(vec![task("1", &[]), task("2", &[]), task("3", &["1", "2"])])
}

pub fn independent(count: usize) -> TaskSet {
    TaskSet::from_tasks(
        (0..count)
            .map(|i| Task::new(format!("t{}", i), AGENTS[i % AGENTS.len()]))
            .collect(),
    )
}

/// Oracle output with every kind of malformed entry mixed in.
pub fn messy_oracle_output() -> Vec<RawTask> {
    serde_json::from_value(json!([
        {"id": 1, "description": "revenue by region", "assigned_agent": "sql",
         "params": {"query": "SELECT region, SUM(amount) FROM sales GROUP BY 1"}},
        {"id": "2", "description": "ACME quote", "assignedAgent": "web",
         "params": {"fetch_quote": {"ticker": "ACME"}}},
        {"id": 3, "description": "compare", "agent": "sql", "dependencies": [1, 2]},
        {"id": 4, "description": "orphan", "agent": "sql", "dependencies": [9]},
        {"id": 5, "description": "after orphan", "agent": "sql", "dependencies": [4]},
        {"id": 6, "description": "no agent"},
        {"id": 7, "description": "skip me", "agent": "sql", "mappable": false},
        {"id": 1, "description": "duplicate", "agent": "web"},
        {"description": "no id", "agent": "sql"}
    ]))
    .expect("fixture JSON is valid")
}

/// Start/finish event recorded by [`ScriptedWorker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(String),
    Finish(String),
}

/// Worker used by the integration suite.
///
/// Records a global event log, tracks peak concurrency, sleeps for a
/// per-task delay and fails the tasks it is told to fail.
pub struct ScriptedWorker {
    name: String,
    fail: Vec<String>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    log: Arc<Mutex<Vec<Event>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedWorker {
    pub fn new(name: &str, log: Arc<Mutex<Vec<Event>>>) -> Self {
        Self {
            name: name.to_string(),
            fail: Vec::new(),
            delays: HashMap::new(),
            default_delay: Duration::from_millis(5),
            log,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(mut self, tasks: &[&str]) -> Self {
        self.fail = tasks.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, task: &str, delay: Duration) -> Self {
        self.delays.insert(task.to_string(), delay);
        self
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Share concurrency counters with other workers.
    pub fn sharing(mut self, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        self.active = active;
        self.peak = peak;
        self
    }
}

#[async_trait]
impl WorkerAgent for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, request: &WorkerRequest) -> Result<WorkerOutput> {
        let id = request.task_id.to_string();
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.log.lock().unwrap().push(Event::Start(id.clone()));

        let delay = self.delays.get(&id).copied().unwrap_or(self.default_delay);
        tokio::time::sleep(delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(Event::Finish(id.clone()));

        if self.fail.contains(&id) {
            return Err(Error::TaskExecution {
                task_id: id,
                message: "scripted failure".to_string(),
            });
        }
        let upstream: Vec<_> = request
            .dependency_outputs
            .iter()
            .map(|d| d.task_id.to_string())
            .collect();
        Ok(WorkerOutput::new(json!({
            "task": id,
            "agent": self.name,
            "upstream": upstream,
            "tools": request.tools,
        }))
        .with_metadata(json!({"worker": "scripted"})))
    }
}

/// Pipeline over an in-memory store with scripted workers for every agent.
pub struct RunHarness {
    pub pipeline: RunPipeline,
    pub store: Arc<RunStore>,
    pub log: Arc<Mutex<Vec<Event>>>,
    pub peak: Arc<AtomicUsize>,
}

impl RunHarness {
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_workers(config, |w| w)
    }

    /// Build the harness, letting `customize` adjust each agent's worker.
    pub fn with_workers<F>(config: ExecutorConfig, customize: F) -> Self
    where
        F: Fn(ScriptedWorker) -> ScriptedWorker,
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut workers = WorkerSet::new();
        for agent in AGENTS {
            let worker = ScriptedWorker::new(agent, log.clone()).sharing(active.clone(), peak.clone());
            workers.register(Arc::new(customize(worker)));
        }

        let store = Arc::new(RunStore::in_memory().expect("in-memory store"));
        let pipeline = RunPipeline::new(
            Arc::new(registry()),
            store.clone(),
            Arc::new(workers),
            config,
        );
        Self {
            pipeline,
            store,
            log,
            peak,
        }
    }

    pub async fn run(&self, tasks: TaskSet) -> RunReport {
        let prepared = self.pipeline.prepare(tasks).expect("prepare");
        self.pipeline
            .execute_as(RunId::new("run-test"), "integration", &prepared)
            .await
            .expect("execute")
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }

    /// Position of an event in the log.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    /// Assert every dependency finished before its dependent started.
    pub fn assert_dependencies_respected(&self, tasks: &TaskSet) {
        for task in tasks.iter() {
            let Some(start) = self.position(&Event::Start(task.id.to_string())) else {
                continue;
            };
            for dep in &task.dependencies {
                let finish = self
                    .position(&Event::Finish(dep.to_string()))
                    .unwrap_or_else(|| panic!("{} never finished", dep));
                assert!(
                    finish < start,
                    "{} started before its dependency {} finished",
                    task.id,
                    dep
                );
            }
        }
    }

    pub fn start_count(&self, task: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == Event::Start(task.to_string()))
            .count()
    }
}

pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        max_concurrent_tasks: 4,
        dependency_timeout: Duration::from_secs(5),
    }
}
