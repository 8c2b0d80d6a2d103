//! Orchestration layer: turns analyzed task graphs into executed runs.
//!
//! The registry describes which agents exist and what they can do. The
//! planner scopes each dependency path to the capabilities it uses. The
//! executor drives workers against the run store, and the consolidator
//! reads the results back. [`RunPipeline`] wires the stages together.

mod consolidator;
mod executor;
mod pipeline;
mod planner;
mod registry;
mod worker;

pub use consolidator::{ConsolidatedOutput, ConsolidatedResult, Consolidator, TaskFailure};
pub use executor::{Executor, ExecutorConfig, TaskResult};
pub use pipeline::{PreparedRun, RunPipeline, RunReport};
pub use planner::{ExecutionUnit, PathPlanner, TaskPlan};
pub use registry::{AgentSpec, Capability, CapabilityRegistry};
pub use worker::{
    CommandWorker, DependencyOutput, EchoWorker, WorkerAgent, WorkerOutput, WorkerRequest,
    WorkerSet,
};
