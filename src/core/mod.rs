//! Core domain models: tasks, the dependency graph, and graph analysis.

pub mod analysis;
pub mod dag;
pub mod task;

pub use analysis::{CanonicalPath, GraphAnalysis, GraphAnalyzer};
pub use dag::{ExecutionPath, TaskDAG};
pub use task::{Exclusion, ExclusionReason, RawId, RawTask, Task, TaskId, TaskParams, TaskSet};
