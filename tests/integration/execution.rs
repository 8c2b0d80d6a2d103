//! Execution correctness tests.
//!
//! These tests verify that the executor honors dependencies across units,
//! isolates failures, and bounds concurrency.

use std::time::Duration;

use taskweave::core::{TaskId, TaskSet};
use taskweave::orchestration::{Consolidator, ExecutorConfig};
use taskweave::state::RunStatus;

use crate::fixtures::{chain, diamond, fan_in, fast_config, independent, task, Event, RunHarness};

/// Test: Chain runs in order
/// Given a -> b -> c
/// When the run executes
/// Then each task starts only after its dependency finished
#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let harness = RunHarness::new(fast_config());
    let report = harness.run(chain()).await;

    assert!(report.summary.all_succeeded());
    assert_eq!(report.summary.success, 3);
    assert_eq!(
        harness.events(),
        vec![
            Event::Start("a".into()),
            Event::Finish("a".into()),
            Event::Start("b".into()),
            Event::Finish("b".into()),
            Event::Start("c".into()),
            Event::Finish("c".into()),
        ]
    );
}

/// Test: Diamond across units
/// Given two paths sharing root and join
/// When the slow branch delays the join
/// Then root and join run once and join waits for both branches
#[tokio::test]
async fn test_diamond_shared_tasks_run_once() {
    let harness = RunHarness::with_workers(fast_config(), |w| {
        w.with_delay("right", Duration::from_millis(60))
    });
    let tasks = diamond();
    let report = harness.run(tasks.clone()).await;

    assert_eq!(report.summary.total, 4);
    assert!(report.summary.all_succeeded());
    assert_eq!(harness.start_count("root"), 1);
    assert_eq!(harness.start_count("join"), 1);
    harness.assert_dependencies_respected(&tasks);

    let output = harness
        .store
        .get_task_output(&report.run_id, &TaskId::new("join"))
        .unwrap()
        .unwrap();
    assert_eq!(output.payload["upstream"], serde_json::json!(["left", "right"]));
}

/// Test: Independent branches overlap
/// Given two roots feeding one task
/// Then both roots run concurrently
#[tokio::test]
async fn test_independent_roots_overlap() {
    let harness = RunHarness::with_workers(fast_config(), |w| {
        w.with_default_delay(Duration::from_millis(40))
    });
    let tasks = fan_in();
    harness.run(tasks.clone()).await;

    let events = harness.events();
    let second_start = events
        .iter()
        .position(|e| *e == Event::Start("2".into()))
        .unwrap();
    let first_finish = events
        .iter()
        .position(|e| *e == Event::Finish("1".into()))
        .unwrap();
    assert!(second_start < first_finish, "roots should overlap: {:?}", events);
    harness.assert_dependencies_respected(&tasks);
}

/// Test: Failure isolation
/// Given a failing task with a dependent and an unrelated sibling
/// When the run executes
/// Then only the failing task is failed and the run still completes
#[tokio::test]
async fn test_failure_is_task_scoped() {
    let harness = RunHarness::with_workers(fast_config(), |w| w.failing(&["b"]));
    let tasks = TaskSet::from_tasks(vec![
        task("a", &[]),
        task("b", &["a"]),
        task("c", &["b"]),
        task("d", &[]),
    ]);
    let report = harness.run(tasks).await;

    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.success, 3);

    let failed: Vec<_> = report.results.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id, TaskId::new("b"));
    assert_eq!(failed[0].error.as_deref(), Some("Task b failed: scripted failure"));
    assert_eq!(failed[0].output_ref, None);

    // c ran after b's failure, without b's output.
    let c = harness
        .store
        .get_task_output(&report.run_id, &TaskId::new("c"))
        .unwrap()
        .unwrap();
    assert_eq!(c.payload["upstream"], serde_json::json!([]));
}

/// Test: Everything fails
/// Then the summary reports zero successes
#[tokio::test]
async fn test_all_tasks_failing_still_summarizes() {
    let harness = RunHarness::with_workers(fast_config(), |w| w.failing(&["1", "2", "3"]));
    let report = harness.run(fan_in()).await;
    assert_eq!(report.summary.total, 3);
    assert_eq!(report.summary.success, 0);
    assert_eq!(report.summary.failed, 3);

    let run = harness.store.get_run(&report.run_id).unwrap().unwrap();
    assert!(run.finished_at.is_some());
}

/// Test: Concurrency bound
/// Given 8 independent tasks and a limit of 3
/// Then no more than 3 workers run at once
#[tokio::test]
async fn test_concurrency_limit_respected() {
    let config = ExecutorConfig {
        max_concurrent_tasks: 3,
        dependency_timeout: Duration::from_secs(5),
    };
    let harness = RunHarness::with_workers(config, |w| {
        w.with_default_delay(Duration::from_millis(25))
    });
    let report = harness.run(independent(8)).await;

    assert_eq!(report.summary.success, 8);
    let peak = harness.peak.load(std::sync::atomic::Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {} exceeded limit", peak);
    assert!(peak >= 2, "independent tasks should overlap, peak {}", peak);
}

/// Test: Single permit with waiting tasks
/// Given a limit of 1 and a diamond
/// Then the run completes, because waiting tasks hold no permit
#[tokio::test]
async fn test_single_permit_completes_diamond() {
    let config = ExecutorConfig {
        max_concurrent_tasks: 1,
        dependency_timeout: Duration::from_secs(5),
    };
    let harness = RunHarness::new(config);
    let tasks = diamond();
    let report = tokio::time::timeout(Duration::from_secs(5), harness.run(tasks.clone()))
        .await
        .expect("run finished");
    assert!(report.summary.all_succeeded());
    assert_eq!(harness.peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    harness.assert_dependencies_respected(&tasks);
}

/// Test: Dependency timeout
/// Given a fan-in where one branch outlasts the timeout
/// When the fast branch's unit reaches the shared task first
/// Then the shared task fails with a timeout and is never handed to a worker
#[tokio::test]
async fn test_dependency_timeout_fails_dependent() {
    let config = ExecutorConfig {
        max_concurrent_tasks: 2,
        dependency_timeout: Duration::from_millis(30),
    };
    let harness = RunHarness::with_workers(config, |w| {
        w.with_delay("slow", Duration::from_millis(200))
    });
    let tasks = TaskSet::from_tasks(vec![
        task("slow", &[]),
        task("fast", &[]),
        task("after", &["slow", "fast"]),
    ]);
    let report = harness.run(tasks).await;

    let after = harness
        .store
        .get_worker_run(&report.run_id, &TaskId::new("after"))
        .unwrap()
        .unwrap();
    assert_eq!(after.status, RunStatus::Failed);
    assert!(after
        .error
        .as_deref()
        .unwrap()
        .starts_with("Dependencies of task after not complete"));
    assert_eq!(harness.start_count("after"), 0);

    let slow = harness
        .store
        .get_worker_run(&report.run_id, &TaskId::new("slow"))
        .unwrap()
        .unwrap();
    assert_eq!(slow.status, RunStatus::Success);
}

/// Test: Output references
/// Then every successful row points at its own output record
#[tokio::test]
async fn test_output_ref_points_at_task_output() {
    let harness = RunHarness::new(fast_config());
    let report = harness.run(diamond()).await;

    for result in &report.results {
        let row = harness
            .store
            .get_worker_run(&report.run_id, &result.task_id)
            .unwrap()
            .unwrap();
        let output = harness
            .store
            .get_task_output(&report.run_id, &result.task_id)
            .unwrap()
            .unwrap();
        assert_eq!(row.output_ref, Some(output.id));
        assert_eq!(result.output_ref, Some(output.id));
        assert_eq!(output.metadata["worker"], "scripted");
    }
}

/// Test: Consolidation after a mixed run
#[tokio::test]
async fn test_consolidated_result() {
    let harness = RunHarness::with_workers(fast_config(), |w| w.failing(&["right"]));
    let report = harness.run(diamond()).await;

    let result = Consolidator::consolidate(&harness.store, &report.run_id).unwrap();
    assert_eq!(result.outputs.len(), 3);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].task_id, TaskId::new("right"));
    assert_eq!(
        result.output_of("join").unwrap().canonical_path,
        vec![
            TaskId::new("root"),
            TaskId::new("left"),
            TaskId::new("right"),
            TaskId::new("join")
        ]
    );
    assert_eq!(result.summary, report.summary);
}

/// Test: Unmappable tasks
/// Given a task list where nothing is mappable
/// Then the run ends immediately with an empty summary
#[tokio::test]
async fn test_no_mappable_tasks() {
    let harness = RunHarness::new(fast_config());
    let tasks = TaskSet::from_tasks(vec![task("x", &[]).not_mappable()]);
    let report = harness.run(tasks).await;
    assert_eq!(report.summary.total, 0);
    assert!(report.results.is_empty());
    assert!(harness.events().is_empty());
}
