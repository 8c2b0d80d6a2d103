//! Analyzer and planner behavior over admitted task sets.

use std::collections::HashSet;

use taskweave::core::{ExclusionReason, GraphAnalyzer, TaskId, TaskSet};
use taskweave::orchestration::PathPlanner;
use taskweave::Error;

use crate::fixtures::{chain, diamond, fan_in, ids, independent, messy_oracle_output, registry, task};

/// Test: Messy oracle output
/// Given duplicates, missing ids, missing agents, unmappable tasks and a
/// dangling dependency
/// When the list is admitted against the registry
/// Then only the well-formed tasks schedule and every rejection is reported
#[test]
fn test_intake_excludes_malformed_tasks() {
    let registry = registry();
    let set = TaskSet::from_raw_with(messy_oracle_output(), |a| registry.contains(a));

    let admitted: Vec<&str> = set.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(admitted, vec!["1", "2", "3"]);

    let reasons: HashSet<(String, ExclusionReason)> = set
        .exclusions()
        .iter()
        .map(|e| (e.task_id.to_string(), e.reason.clone()))
        .collect();
    let expected: HashSet<(String, ExclusionReason)> = [
        ("".to_string(), ExclusionReason::EmptyId),
        ("1".to_string(), ExclusionReason::DuplicateId),
        ("4".to_string(), ExclusionReason::UnresolvedDependency(TaskId::new("9"))),
        ("5".to_string(), ExclusionReason::DependsOnExcluded(TaskId::new("4"))),
        ("6".to_string(), ExclusionReason::Unassigned),
        ("7".to_string(), ExclusionReason::NotMappable),
    ]
    .into_iter()
    .collect();
    assert_eq!(reasons, expected);

    // The surviving duplicate is the first one.
    assert_eq!(set.get("1").unwrap().agent(), Some("sql"));
}

/// Test: One bad record among good ones
/// Given null dependencies, a string `mappable` and a fractional id
/// When the JSON is admitted
/// Then only the mistyped records and their dependents are dropped
#[test]
fn test_mistyped_records_are_rejected_per_task() {
    let registry = registry();
    let set = TaskSet::from_json_with(
        r#"[
            {"id": 1, "agent": "sql", "dependencies": null},
            {"id": 2, "agent": "web", "mappable": "no"},
            {"id": 2.5, "agent": "sql"},
            {"id": 3, "agent": "sql", "dependencies": [1]},
            {"id": 4, "agent": "sql", "dependencies": [2]}
        ]"#,
        |a| registry.contains(a),
    )
    .unwrap();

    let admitted: Vec<&str> = set.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(admitted, vec!["1", "3"]);

    let malformed: Vec<&str> = set
        .exclusions()
        .iter()
        .filter(|e| matches!(e.reason, ExclusionReason::Malformed(_)))
        .map(|e| e.task_id.as_str())
        .collect();
    assert_eq!(malformed, vec!["2", "2.5"]);
    assert!(set.exclusions().iter().any(|e| e.task_id == "4"
        && e.reason == ExclusionReason::DependsOnExcluded(TaskId::new("2"))));

    let analysis = GraphAnalyzer::analyze(&set).unwrap();
    assert_eq!(analysis.parallel_groups, vec![ids(&["1"]), ids(&["3"])]);
}

#[test]
fn test_unknown_agent_is_excluded_with_dependents() {
    let registry = registry();
    let raw = serde_json::from_value(serde_json::json!([
        {"id": "a", "agent": "ftp"},
        {"id": "b", "agent": "sql", "deps": ["a"]},
        {"id": "c", "agent": "sql"}
    ]))
    .unwrap();
    let set = TaskSet::from_raw_with(raw, |a| registry.contains(a));
    assert!(set.is_excluded("a"));
    assert!(set.is_excluded("b"));
    assert!(set.contains("c"));

    let analysis = GraphAnalyzer::analyze(&set).unwrap();
    assert_eq!(analysis.parallel_groups, vec![ids(&["c"])]);
}

/// Test: Fan-in example
/// Given [1:[], 2:[], 3:[1,2]]
/// Then groups are [[1,2],[3]], max depth 1, canonical(3) = [1,2,3]
#[test]
fn test_fan_in_analysis() {
    let analysis = GraphAnalyzer::analyze(&fan_in()).unwrap();
    assert!(!analysis.has_cycles);
    assert_eq!(analysis.parallel_groups, vec![ids(&["1", "2"]), ids(&["3"])]);
    assert_eq!(analysis.max_depth, 1);
    assert_eq!(analysis.canonical_path("3"), Some(&ids(&["1", "2", "3"])));
    assert_eq!(
        analysis.dependency_paths,
        vec![ids(&["1", "3"]), ids(&["2", "3"])]
    );
}

/// Test: Same fan-in with 1 depending on 3 is a cycle
#[test]
fn test_fan_in_with_back_edge_is_cyclic() {
    let set = TaskSet::from_tasks(vec![task("1", &["3"]), task("2", &[]), task("3", &["1", "2"])]);
    let analysis = GraphAnalyzer::analyze(&set).unwrap();
    assert!(analysis.has_cycles);
    assert!(analysis.parallel_groups.is_empty());
    assert!(analysis.dependency_paths.is_empty());
    assert!(matches!(analysis.ensure_acyclic(), Err(Error::Cycle)));
}

#[test]
fn test_chain_analysis() {
    let analysis = GraphAnalyzer::analyze(&chain()).unwrap();
    assert_eq!(analysis.max_depth, 2);
    assert_eq!(analysis.dependency_paths, vec![ids(&["a", "b", "c"])]);
    // A single incoming path is the canonical path verbatim.
    assert_eq!(analysis.canonical_path("c"), Some(&ids(&["a", "b", "c"])));
    assert_eq!(analysis.canonical_path("b"), Some(&ids(&["a", "b"])));
}

#[test]
fn test_diamond_canonical_path_merges_both_branches() {
    let analysis = GraphAnalyzer::analyze(&diamond()).unwrap();
    let join = analysis.canonical_path("join").unwrap();
    assert_eq!(join, &ids(&["root", "left", "right", "join"]));
    assert_eq!(join.iter().filter(|t| t.as_str() == "root").count(), 1);
    assert_eq!(
        analysis.parallel_groups,
        vec![ids(&["root"]), ids(&["left", "right"]), ids(&["join"])]
    );
}

#[test]
fn test_groups_partition_schedulable_tasks() {
    for set in [chain(), diamond(), fan_in(), independent(5)] {
        let analysis = GraphAnalyzer::analyze(&set).unwrap();
        let flattened: Vec<&TaskId> = analysis.parallel_groups.iter().flatten().collect();
        let unique: HashSet<&TaskId> = flattened.iter().copied().collect();
        assert_eq!(flattened.len(), set.len());
        assert_eq!(unique.len(), set.len());
    }
}

#[test]
fn test_independent_tasks() {
    let analysis = GraphAnalyzer::analyze(&independent(4)).unwrap();
    assert_eq!(analysis.independent_task_count, 4);
    assert_eq!(analysis.parallel_groups.len(), 1);
    assert_eq!(analysis.dependency_paths.len(), 4);
    assert_eq!(analysis.max_depth, 0);
}

#[test]
fn test_reanalysis_is_identical() {
    let set = diamond();
    assert_eq!(
        GraphAnalyzer::analyze(&set).unwrap(),
        GraphAnalyzer::analyze(&set).unwrap()
    );
}

/// Test: Path planning over a diamond
/// Given two paths sharing root and join
/// Then each unit scopes to its own tasks, and shared tasks appear in both
#[test]
fn test_diamond_units() {
    let registry = registry();
    let set = diamond();
    let analysis = GraphAnalyzer::analyze(&set).unwrap();
    let units = PathPlanner::new(&registry).plan_all(&analysis.dependency_paths, &set);

    assert_eq!(units.len(), 2);
    assert_eq!(units[0].path_id, "path-1");
    assert_eq!(units[0].task_ids, ids(&["root", "left", "join"]));
    assert_eq!(units[1].task_ids, ids(&["root", "right", "join"]));
    assert!(units.iter().all(|u| u.agents_referenced == vec!["sql".to_string()]));
    assert!(units[1].plan_for("left").is_none());
}

#[test]
fn test_planner_scopes_tools_per_task() {
    let registry = registry();
    let set = TaskSet::from_raw_with(messy_oracle_output(), |a| registry.contains(a));
    let analysis = GraphAnalyzer::analyze(&set).unwrap();
    let units = PathPlanner::new(&registry).plan_all(&analysis.dependency_paths, &set);

    let first = &units[0];
    assert_eq!(first.agents_referenced, vec!["sql".to_string()]);
    assert_eq!(first.plan_for("1").unwrap().tools, vec!["query".to_string()]);
    assert!(first.plan_for("3").unwrap().tools.is_empty());

    let second = &units[1];
    assert_eq!(second.agents_referenced, vec!["web".to_string(), "sql".to_string()]);
    let quote = second.plan_for("2").unwrap();
    assert_eq!(quote.tools, vec!["fetch_quote".to_string()]);
    assert_eq!(quote.tool_params["fetch_quote"]["ticker"], "ACME");
}
