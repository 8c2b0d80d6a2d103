//! On-disk run store: records survive reopening and can be consolidated
//! by a later process.

use std::sync::Arc;

use tempfile::TempDir;

use taskweave::core::TaskId;
use taskweave::orchestration::{Consolidator, RunPipeline, WorkerSet};
use taskweave::state::{RunPhase, RunStatus, RunStore};

use crate::fixtures::{fast_config, messy_oracle_output, registry};

/// Test: Run, close, reopen, consolidate
/// Given a run executed against a file-backed store with echo workers
/// When the store is reopened from disk
/// Then the run, its planning rows and its outputs are all still there
#[tokio::test]
async fn test_run_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("runs.db");

    let run_id = {
        let registry = Arc::new(registry());
        let workers = Arc::new(WorkerSet::echo_all(&registry));
        let store = Arc::new(RunStore::open(&path).unwrap());
        let pipeline = RunPipeline::new(registry, store, workers, fast_config());

        let tasks = pipeline.admit(messy_oracle_output());
        let prepared = pipeline.prepare(tasks).unwrap();
        let report = pipeline.execute("revenue vs quote", &prepared).await.unwrap();
        assert!(report.summary.all_succeeded());
        assert_eq!(report.exclusions.len(), 6);
        report.run_id
    };

    let store = RunStore::open(&path).unwrap();
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.request, "revenue vs quote");
    assert_eq!(run.phase, RunPhase::Finished);

    let rows = store.list_worker_runs(&run_id).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.status == RunStatus::Success));

    let plan = store.get_plan(&run_id).unwrap();
    let planned: Vec<&str> = plan.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(planned, vec!["1", "2", "3"]);
    assert_eq!(plan[1].agent_description, "Market data API");
    assert_eq!(plan[1].tools, Some(vec!["fetch_quote".to_string()]));

    let result = Consolidator::consolidate(&store, &run_id).unwrap();
    assert_eq!(result.outputs.len(), 3);
    let compare = result.output_of("3").unwrap();
    assert_eq!(
        compare.canonical_path,
        vec![TaskId::new("1"), TaskId::new("2"), TaskId::new("3")]
    );
    // The echo worker reports which upstream outputs it was handed.
    assert_eq!(compare.payload["upstream"], serde_json::json!(["1", "2"]));
}

#[test]
fn test_runs_listed_newest_first() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs.db");
    {
        let store = RunStore::open(&path).unwrap();
        store.begin_run(&"run-a".into(), "first").unwrap();
        store.begin_run(&"run-b".into(), "second").unwrap();
    }
    let store = RunStore::open(&path).unwrap();
    let runs = store.list_runs().unwrap();
    let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["run-b", "run-a"]);
}
