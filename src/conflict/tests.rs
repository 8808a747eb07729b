//! Tests for the conflict planner.

use super::*;
use proptest::prelude::*;

fn group(id: &str, paths: &[&str]) -> ParallelGroup {
    ParallelGroup {
        group_id: id.to_string(),
        phase: "implement".to_string(),
        agents: vec![format!("{}-agent", id)],
        conflict_paths: paths.iter().map(|p| p.to_string()).collect(),
        can_parallel: true,
        priority: 0,
    }
}

fn lanes(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
    plan.parallel_batches
        .iter()
        .map(|lane| lane.iter().map(String::as_str).collect())
        .collect()
}

#[test]
fn test_same_paths_share_a_lane() {
    let plan = ConflictPlanner::default()
        .plan(&[
            group("a", &["src/x/**"]),
            group("b", &["src/x/**"]),
            group("c", &["src/y/**"]),
        ])
        .unwrap();

    assert_eq!(lanes(&plan), vec![vec!["a", "b"], vec!["c"]]);
    assert!(plan.exclusive.is_empty());
    assert_eq!(plan.conflicts.len(), 1);
    assert_eq!(plan.conflicts[0].first, "a");
    assert_eq!(plan.conflicts[0].second, "b");
}

#[test]
fn test_conflicts_are_transitive() {
    let plan = ConflictPlanner::default()
        .plan(&[
            group("a", &["src/a/**"]),
            group("b", &["src/a/lib.rs", "src/b/lib.rs"]),
            group("c", &["src/b/**"]),
            group("d", &["docs/**"]),
        ])
        .unwrap();

    assert_eq!(lanes(&plan), vec![vec!["a", "b", "c"], vec!["d"]]);
    // a and c only conflict through b
    assert_eq!(plan.conflicts.len(), 2);
}

#[test]
fn test_priority_orders_within_lane() {
    let mut first = group("first", &["src/**"]);
    first.priority = 5;
    let mut second = group("second", &["src/lib.rs"]);
    second.priority = -1;
    let third = group("third", &["src/main.rs"]);

    let plan = ConflictPlanner::default()
        .plan(&[first, second, third])
        .unwrap();
    assert_eq!(lanes(&plan), vec![vec!["second", "third", "first"]]);
}

#[test]
fn test_non_parallel_groups_run_exclusively() {
    let mut migrate = group("migrate", &["db/**"]);
    migrate.can_parallel = false;

    let plan = ConflictPlanner::default()
        .plan(&[group("api", &["src/api/**"]), migrate, group("ui", &["web/**"])])
        .unwrap();

    assert_eq!(lanes(&plan), vec![vec!["api"], vec!["ui"]]);
    assert_eq!(plan.exclusive, vec!["migrate"]);
}

#[test]
fn test_broad_declaration_is_isolated() {
    let plan = ConflictPlanner::new(BroadPolicy::Isolate)
        .plan(&[
            group("a", &["src/a/**"]),
            group("everything", &["**/*"]),
            group("b", &["src/b/**"]),
        ])
        .unwrap();

    // The broad group does not merge a and b into one lane
    assert_eq!(lanes(&plan), vec![vec!["a"], vec!["b"]]);
    assert_eq!(plan.exclusive, vec!["everything"]);
    assert_eq!(
        plan.overly_broad,
        vec![BroadDeclaration {
            group_id: "everything".to_string(),
            pattern: "**/*".to_string(),
        }]
    );
}

#[test]
fn test_broad_declaration_rejected_by_policy() {
    let result = ConflictPlanner::new(BroadPolicy::Reject)
        .plan(&[group("a", &["src/**"]), group("all", &["**"])]);
    match result {
        Err(PhaseGateError::OverlyBroadDeclaration { group_id, pattern }) => {
            assert_eq!(group_id, "all");
            assert_eq!(pattern, "**");
        }
        other => panic!("expected OverlyBroadDeclaration, got {:?}", other),
    }
}

#[test]
fn test_invalid_and_duplicate_groups() {
    let planner = ConflictPlanner::default();
    assert!(matches!(
        planner.plan(&[group("a", &["src/***"])]),
        Err(PhaseGateError::InvalidPattern { .. })
    ));
    assert!(matches!(
        planner.plan(&[group("a", &["x"]), group("a", &["y"])]),
        Err(PhaseGateError::DuplicateGroup { .. })
    ));
}

#[test]
fn test_empty_input_plans_nothing() {
    let plan = ConflictPlanner::default().plan(&[]).unwrap();
    assert_eq!(plan, ExecutionPlan::default());
}

#[test]
fn test_admission() {
    let planner = ConflictPlanner::default();
    let running = vec![group("a", &["src/a/**"]), group("b", &["docs/**"])];

    assert!(planner
        .check_admission(&running, &group("c", &["src/c/**"]))
        .is_ok());

    match planner.check_admission(&running, &group("d", &["src/a/mod.rs", "docs/x.md"])) {
        Err(PhaseGateError::ConflictDetected { candidate, running }) => {
            assert_eq!(candidate, "d");
            assert_eq!(running, vec!["a", "b"]);
        }
        other => panic!("expected ConflictDetected, got {:?}", other),
    }

    let mut solo = group("solo", &["tools/**"]);
    solo.can_parallel = false;
    assert!(planner.check_admission(&running, &solo).is_err());
    assert!(planner.check_admission(&[], &solo).is_ok());

    assert!(matches!(
        planner.check_admission(&running, &group("a", &["other/**"])),
        Err(PhaseGateError::DuplicateGroup { .. })
    ));
}

#[test]
fn test_groups_deserialize_with_defaults() {
    let yaml = r#"
- group_id: api
  conflict_paths: ["src/api/**"]
- group_id: db
  conflict_paths: ["db/**"]
  can_parallel: false
  priority: 2
"#;
    let groups: Vec<ParallelGroup> = serde_yaml::from_str(yaml).unwrap();
    assert!(groups[0].can_parallel);
    assert_eq!(groups[0].priority, 0);
    assert!(!groups[1].can_parallel);
}

fn arb_path() -> impl Strategy<Value = String> {
    let segment = prop_oneof![
        Just("src".to_string()),
        Just("docs".to_string()),
        Just("a".to_string()),
        Just("b".to_string()),
        Just("*".to_string()),
        Just("**".to_string()),
        Just("*.rs".to_string()),
        Just("lib.rs".to_string()),
    ];
    prop::collection::vec(segment, 1..4).prop_map(|segments| segments.join("/"))
}

fn arb_groups() -> impl Strategy<Value = Vec<ParallelGroup>> {
    prop::collection::vec(
        (prop::collection::vec(arb_path(), 1..3), any::<bool>(), -2i32..3),
        0..10,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (paths, can_parallel, priority))| ParallelGroup {
                group_id: format!("g{}", i),
                phase: "implement".to_string(),
                agents: Vec::new(),
                conflict_paths: paths,
                can_parallel,
                priority,
            })
            .collect()
    })
}

fn lane_of<'a>(plan: &'a ExecutionPlan, id: &str) -> Option<&'a Vec<String>> {
    plan.parallel_batches
        .iter()
        .find(|lane| lane.iter().any(|g| g == id))
}

proptest! {
    #[test]
    fn every_group_scheduled_exactly_once(groups in arb_groups()) {
        let plan = ConflictPlanner::default().plan(&groups).unwrap();
        let mut scheduled: Vec<&str> = plan.scheduled().collect();
        scheduled.sort_unstable();
        let mut expected: Vec<&str> = groups.iter().map(|g| g.group_id.as_str()).collect();
        expected.sort_unstable();
        prop_assert_eq!(scheduled, expected);
    }

    #[test]
    fn conflicting_parallel_groups_never_share_time(groups in arb_groups()) {
        let plan = ConflictPlanner::default().plan(&groups).unwrap();
        let exclusive: HashSet<&str> = plan.exclusive.iter().map(String::as_str).collect();
        for edge in &plan.conflicts {
            if exclusive.contains(edge.first.as_str()) || exclusive.contains(edge.second.as_str()) {
                continue;
            }
            // Both in lanes: they must be serialized in the same lane
            prop_assert_eq!(lane_of(&plan, &edge.first), lane_of(&plan, &edge.second));
        }
    }

    #[test]
    fn lanes_respect_priority_then_input_order(groups in arb_groups()) {
        let plan = ConflictPlanner::default().plan(&groups).unwrap();
        let key = |id: &str| {
            let index = groups.iter().position(|g| g.group_id == id).unwrap();
            (groups[index].priority, index)
        };
        for lane in &plan.parallel_batches {
            let keys: Vec<_> = lane.iter().map(|id| key(id)).collect();
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
        prop_assert!(plan.exclusive.windows(2).all(|w| key(&w[0]) < key(&w[1])));
    }

    #[test]
    fn planning_is_deterministic(groups in arb_groups()) {
        let planner = ConflictPlanner::default();
        prop_assert_eq!(planner.plan(&groups).unwrap(), planner.plan(&groups).unwrap());
    }
}
