//! Durable run state.
//!
//! Every record is partitioned by [`RunId`] and owned by the [`RunStore`].

mod records;
mod store;

pub use records::{
    PlanningRow, RunId, RunPhase, RunRecord, RunStatus, RunSummary, TaskOutput, WorkerRun,
};
pub use store::RunStore;
