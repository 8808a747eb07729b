use super::*;
use crate::config::BroadPolicy;
use crate::namespace::NamespaceStatus;
use crate::probe::StaticProbe;
use tempfile::TempDir;

const CONFIG: &str = r#"
orchestrator: orchestrator
signer: ci@build
lock_timeout_ms: 2000
phases:
  - name: plan
    required_artifacts:
      - path: "plans/{namespace}.md"
  - name: implement
  - name: release
"#;

struct Fixture {
    dir: TempDir,
    engine: PhaseGate,
}

fn config_with(extra: &str) -> WorkflowConfig {
    serde_yaml::from_str(&format!("{}{}", extra, CONFIG)).unwrap()
}

fn fixture_with(config: WorkflowConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let probe = StaticProbe::new(dir.path(), Vec::new(), "0123456789abcdef");
    let engine = PhaseGate::builder(dir.path().join(".phasegate"))
        .config(config)
        .probe(Arc::new(probe))
        .signer(Arc::new(HmacSigner::new(b"engine-key".to_vec())))
        .build()
        .unwrap();
    Fixture { dir, engine }
}

fn fixture() -> Fixture {
    fixture_with(config_with(""))
}

impl Fixture {
    fn create(&self) -> TaskNamespace {
        self.engine.create_namespace("task", "main", None).unwrap()
    }

    fn write_plan(&self, id: &NamespaceId) {
        let dir = self.dir.path().join("plans");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.md", id)), "plan\n").unwrap();
    }

    fn advance(&self, id: &NamespaceId, to: &str) -> Result<Phase> {
        self.engine
            .advance_phase(id, to, TransitionEvidence::default(), false)
    }

    fn event_types(&self, id: &NamespaceId) -> Vec<String> {
        self.engine
            .audit_entries(Some(id))
            .unwrap()
            .iter()
            .filter_map(|e| e.event.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }
}

#[test]
fn test_create_namespace_records_initial_phase_and_index() {
    let f = fixture();
    let ns = f.create();

    let record = f.engine.phase_record(&ns.id).unwrap();
    assert_eq!(record.current_phase, 0);
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.history[0].transition, TransitionKind::Initial);

    let entry = f.engine.query_index(&ns.id).unwrap();
    assert_eq!(entry.current_phase, "plan");
    assert_eq!(entry.status, NamespaceStatus::Active);
    assert_eq!(f.event_types(&ns.id), vec!["Created"]);
}

#[test]
fn test_create_with_unknown_parent_fails() {
    let f = fixture();
    let ghost = NamespaceId::parse("20260101T000000-1-0000000000000abc").unwrap();
    assert!(matches!(
        f.engine.create_namespace("child", "main", Some(&ghost)),
        Err(PhaseGateError::NamespaceNotFound { .. })
    ));
}

#[test]
fn test_advance_requires_signed_gate() {
    let f = fixture();
    let ns = f.create();

    assert!(matches!(
        f.advance(&ns.id, "implement"),
        Err(PhaseGateError::GateRequired { .. })
    ));
    assert!(matches!(
        f.engine.sign_gate(&ns.id, "plan"),
        Err(PhaseGateError::GateNotReady { .. })
    ));

    f.write_plan(&ns.id);
    let gate = f.engine.sign_gate(&ns.id, "plan").unwrap();
    assert!(f.engine.verify_gate(&gate));
    assert_eq!(f.engine.load_gate(&ns.id, "plan").unwrap(), Some(gate));

    let phase = f.advance(&ns.id, "implement").unwrap();
    assert_eq!(phase.name, "implement");
    assert_eq!(f.engine.get_phase(&ns.id).unwrap(), phase);
    assert_eq!(f.engine.query_index(&ns.id).unwrap().current_phase, "implement");
    assert_eq!(
        f.event_types(&ns.id),
        vec!["Created", "Signed", "PhaseChanged"]
    );
}

#[test]
fn test_rollback_requires_a_fresh_gate() {
    let f = fixture();
    let ns = f.create();
    f.write_plan(&ns.id);
    let first = f.engine.sign_gate(&ns.id, "plan").unwrap();
    f.advance(&ns.id, "implement").unwrap();

    let back = TransitionEvidence {
        gate: None,
        note: Some("plan was wrong".to_string()),
    };
    f.engine.advance_phase(&ns.id, "plan", back, true).unwrap();
    std::fs::remove_file(f.dir.path().join("plans").join(format!("{}.md", ns.id))).unwrap();

    assert!(!f.engine.validate_gate(&ns.id, "plan").unwrap().passed);
    assert!(matches!(
        f.engine.sign_gate(&ns.id, "plan"),
        Err(PhaseGateError::GateNotReady { .. })
    ));
    assert!(matches!(
        f.advance(&ns.id, "implement"),
        Err(PhaseGateError::GateRequired { .. })
    ));
    let stale = TransitionEvidence {
        gate: Some(first.clone()),
        note: None,
    };
    assert!(matches!(
        f.engine.advance_phase(&ns.id, "implement", stale, false),
        Err(PhaseGateError::GateStale { .. })
    ));
    assert_eq!(f.engine.get_phase(&ns.id).unwrap().name, "plan");

    f.write_plan(&ns.id);
    let second = f.engine.sign_gate(&ns.id, "plan").unwrap();
    assert_ne!(second, first);
    assert_eq!(f.engine.load_gate(&ns.id, "plan").unwrap(), Some(second));
    assert_eq!(f.advance(&ns.id, "implement").unwrap().name, "implement");
}

#[test]
fn test_skipping_a_phase_is_out_of_order() {
    let f = fixture();
    let ns = f.create();
    match f.advance(&ns.id, "release") {
        Err(PhaseGateError::PhaseOutOfOrder { from, to, expected, .. }) => {
            assert_eq!(from, "plan");
            assert_eq!(to, "release");
            assert_eq!(expected.as_deref(), Some("implement"));
        }
        other => panic!("expected PhaseOutOfOrder, got {:?}", other),
    }
    assert_eq!(f.engine.get_phase(&ns.id).unwrap().name, "plan");
}

#[test]
fn test_override_skips_gate_and_logs_exception() {
    let f = fixture();
    let ns = f.create();

    let evidence = TransitionEvidence {
        gate: None,
        note: Some("hotfix approved by lead".to_string()),
    };
    let phase = f.engine.advance_phase(&ns.id, "release", evidence, true).unwrap();
    assert_eq!(phase.name, "release");

    let record = f.engine.phase_record(&ns.id).unwrap();
    let exceptions: Vec<_> = record.exceptions().collect();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].exception.as_deref(), Some("hotfix approved by lead"));
    assert_eq!(
        f.event_types(&ns.id),
        vec!["Created", "PhaseChanged", "ComplianceException"]
    );

    // Rollback is an override to an earlier phase
    f.engine
        .advance_phase(&ns.id, "plan", TransitionEvidence::default(), true)
        .unwrap();
    let record = f.engine.phase_record(&ns.id).unwrap();
    assert_eq!(record.history.last().unwrap().transition, TransitionKind::Rollback);
}

#[test]
fn test_supplied_gate_must_cover_the_exited_phase() {
    let f = fixture();
    let ns = f.create();
    f.write_plan(&ns.id);
    let gate = f.engine.sign_gate(&ns.id, "plan").unwrap();

    let mut tampered = gate.clone();
    tampered.head_ref = "fedcba9876543210".to_string();
    let evidence = TransitionEvidence {
        gate: Some(tampered),
        note: None,
    };
    assert!(matches!(
        f.engine.advance_phase(&ns.id, "implement", evidence, false),
        Err(PhaseGateError::SignatureMismatch { .. })
    ));

    let evidence = TransitionEvidence {
        gate: Some(gate),
        note: None,
    };
    assert!(f.engine.advance_phase(&ns.id, "implement", evidence, false).is_ok());
}

#[test]
fn test_namespaces_advance_independently() {
    let f = fixture();
    let a = f.create();
    let b = f.create();
    f.write_plan(&a.id);
    f.engine.sign_gate(&a.id, "plan").unwrap();
    f.advance(&a.id, "implement").unwrap();

    assert_eq!(f.engine.get_phase(&a.id).unwrap().name, "implement");
    assert_eq!(f.engine.get_phase(&b.id).unwrap().name, "plan");
    assert!(matches!(
        f.advance(&b.id, "implement"),
        Err(PhaseGateError::GateRequired { .. })
    ));
}

#[test]
fn test_inactive_namespaces_reject_changes() {
    let f = fixture();
    let ns = f.create();
    f.write_plan(&ns.id);

    let (archived, tombstone) = f.engine.tombstone(&ns.id, "abandoned", "alice").unwrap();
    assert_eq!(archived.status, NamespaceStatus::Tombstoned);
    assert_eq!(tombstone.final_status, NamespaceStatus::Active);
    assert_eq!(f.engine.read_tombstone(&ns.id).unwrap(), Some(tombstone));
    assert_eq!(
        f.engine.query_index(&ns.id).unwrap().status,
        NamespaceStatus::Tombstoned
    );

    assert!(matches!(
        f.engine.advance_phase(&ns.id, "release", TransitionEvidence::default(), true),
        Err(PhaseGateError::NamespaceInactive { .. })
    ));
    assert!(matches!(
        f.engine.sign_gate(&ns.id, "plan"),
        Err(PhaseGateError::NamespaceInactive { .. })
    ));
    assert!(matches!(
        f.engine.tombstone(&ns.id, "again", "alice"),
        Err(PhaseGateError::NamespaceInactive { .. })
    ));
    assert!(f.engine.list_active().unwrap().is_empty());
    assert_eq!(f.engine.list_all().unwrap().len(), 1);
}

#[test]
fn test_complete_updates_index() {
    let f = fixture();
    let ns = f.create();
    let done = f.engine.complete(&ns.id).unwrap();
    assert_eq!(done.status, NamespaceStatus::Completed);
    assert_eq!(
        f.engine.query_index(&ns.id).unwrap().status,
        NamespaceStatus::Completed
    );
    assert!(f.event_types(&ns.id).contains(&"StatusChanged".to_string()));
}

#[test]
fn test_child_inherits_parent_gate_when_configured() {
    let f = fixture_with(config_with("child_gate_policy: inherit\n"));
    let parent = f.create();
    f.write_plan(&parent.id);
    f.engine.sign_gate(&parent.id, "plan").unwrap();

    let child = f
        .engine
        .create_namespace("child", "main", Some(&parent.id))
        .unwrap();
    assert_eq!(f.advance(&child.id, "implement").unwrap().name, "implement");
}

#[test]
fn test_child_needs_own_gate_by_default() {
    let f = fixture();
    let parent = f.create();
    f.write_plan(&parent.id);
    f.engine.sign_gate(&parent.id, "plan").unwrap();

    let child = f
        .engine
        .create_namespace("child", "main", Some(&parent.id))
        .unwrap();
    assert!(matches!(
        f.advance(&child.id, "implement"),
        Err(PhaseGateError::GateRequired { .. })
    ));
}

#[test]
fn test_gate_requirement_can_be_disabled() {
    let f = fixture_with(config_with("require_gate_to_advance: false\n"));
    let ns = f.create();
    assert!(f.advance(&ns.id, "implement").is_ok());
    assert!(f.advance(&ns.id, "release").is_ok());
}

#[test]
fn test_index_stays_fresh_across_operations() {
    let f = fixture_with(config_with("require_gate_to_advance: false\n"));
    let a = f.create();
    let b = f.create();
    f.advance(&a.id, "implement").unwrap();
    f.engine.complete(&b.id).unwrap();

    assert!(f.engine.index.check_fresh().is_ok());
    let rebuilt = f.engine.rebuild_index().unwrap();
    assert_eq!(rebuilt.entries, f.engine.query_all().unwrap().entries);
}

#[test]
fn test_concurrent_advances_on_distinct_namespaces() {
    let f = fixture_with(config_with("require_gate_to_advance: false\n"));
    let ids: Vec<NamespaceId> = (0..6).map(|_| f.create().id).collect();

    std::thread::scope(|scope| {
        for id in &ids {
            let engine = &f.engine;
            scope.spawn(move || {
                engine
                    .advance_phase(id, "implement", TransitionEvidence::default(), false)
                    .unwrap();
            });
        }
    });

    let index = f.engine.query_all().unwrap();
    assert_eq!(index.entries.len(), 6);
    assert!(index.entries.values().all(|e| e.current_phase == "implement"));
    assert!(f.engine.index.check_fresh().is_ok());
}

#[test]
fn test_plan_execution_uses_configured_broad_policy() {
    let f = fixture_with(config_with("conflict:\n  broad_policy: reject\n"));
    assert_eq!(f.engine.config().conflict.broad_policy, BroadPolicy::Reject);

    let groups = vec![ParallelGroup {
        group_id: "all".to_string(),
        phase: "implement".to_string(),
        agents: Vec::new(),
        conflict_paths: vec!["**".to_string()],
        can_parallel: true,
        priority: 0,
    }];
    assert!(matches!(
        f.engine.plan_execution(&groups),
        Err(PhaseGateError::OverlyBroadDeclaration { .. })
    ));
    assert!(f.engine.check_admission(&[], &groups[0]).is_err());
}

#[test]
fn test_invocation_evidence_through_engine() {
    let f = fixture();
    let ns = f.create();
    let inv = f
        .engine
        .record_invocation_start(&ns.id, "planner", "orchestrator", 1)
        .unwrap();
    f.engine
        .record_invocation_end(&ns.id, &inv, InvocationStatus::Success)
        .unwrap();

    let report = f.engine.compliance(&ns.id, Utc::now()).unwrap();
    assert!(report.is_compliant());
    assert_eq!(report.invocations.len(), 1);
}

#[test]
fn test_default_workspace_root_is_store_parent() {
    let dir = TempDir::new().unwrap();
    let builder = PhaseGateBuilder::new(dir.path().join(".phasegate"));
    assert_eq!(builder.default_workspace_root().unwrap(), dir.path());
}

#[test]
fn test_id_collision_surfaces_through_engine() {
    let dir = TempDir::new().unwrap();
    let ids = crate::namespace::FixedIdSource {
        at: Utc::now(),
        pid: 42,
        entropy: 0xfeed,
    };
    let engine = PhaseGate::builder(dir.path().join(".phasegate"))
        .config(config_with(""))
        .probe(Arc::new(StaticProbe::new(dir.path(), Vec::new(), "abc")))
        .signer(Arc::new(HmacSigner::new(b"k".to_vec())))
        .id_source(Arc::new(ids))
        .build()
        .unwrap();

    engine.create_namespace("first", "main", None).unwrap();
    assert!(matches!(
        engine.create_namespace("second", "main", None),
        Err(PhaseGateError::IdCollision { .. })
    ));
    assert_eq!(engine.list_all().unwrap().len(), 1);
}

#[test]
fn test_explicit_workspace_root_feeds_default_probe() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().join("repo");
    std::fs::create_dir_all(workspace.join("plans")).unwrap();
    let engine = PhaseGate::builder(dir.path().join("store"))
        .workspace_root(&workspace)
        .config(config_with(""))
        .signer(Arc::new(HmacSigner::new(b"k".to_vec())))
        .build()
        .unwrap();

    let ns = engine.create_namespace("task", "main", None).unwrap();
    std::fs::write(workspace.join("plans").join(format!("{}.md", ns.id)), "plan\n").unwrap();
    assert!(engine.validate_gate(&ns.id, "plan").unwrap().passed);
}
