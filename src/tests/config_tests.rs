use super::*;
use tempfile::tempdir;

#[test]
fn test_default_config() {
    let config = WorkflowConfig::default_config();

    let names: Vec<&str> = config.phase_names().collect();
    assert_eq!(
        names,
        vec!["discovery", "plan", "implement", "test", "review", "release", "monitor"]
    );
    assert_eq!(config.orchestrator, "orchestrator");
    assert_eq!(config.child_gate_policy, ChildGatePolicy::Independent);
    assert_eq!(config.conflict.broad_policy, BroadPolicy::Isolate);
    assert!(config.require_gate_to_advance);
}

#[test]
fn test_default_config_validates() {
    let config = WorkflowConfig::default_config();
    assert!(config.validate().is_ok());
}

#[test]
fn test_yaml_parsing_with_artifacts() {
    let yaml = r#"
orchestrator: lead
child_gate_policy: inherit
phases:
  - name: plan
    allowed_paths: ["docs/**"]
    required_artifacts:
      - path: docs/plans/{namespace}.md
        predicate: non_empty
      - path: docs/plans/{namespace}.md
        predicate:
          contains: "^## Risks"
      - path: CHANGELOG.md
        predicate:
          min_lines: 3
      - path: README.md
  - name: implement
"#;
    let config: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.orchestrator, "lead");
    assert_eq!(config.child_gate_policy, ChildGatePolicy::Inherit);

    let plan = config.phase("plan").unwrap();
    assert_eq!(plan.allowed_paths, vec!["docs/**".to_string()]);
    assert_eq!(plan.required_artifacts[0].predicate, ArtifactPredicate::NonEmpty);
    assert_eq!(
        plan.required_artifacts[1].predicate,
        ArtifactPredicate::Contains("^## Risks".to_string())
    );
    assert_eq!(plan.required_artifacts[2].predicate, ArtifactPredicate::MinLines(3));
    assert_eq!(plan.required_artifacts[3].predicate, ArtifactPredicate::Exists);

    assert_eq!(config.phase_index("implement"), Some(1));
    assert_eq!(config.phase_index("release"), None);
}

#[test]
fn test_validation_rejects_duplicate_phase() {
    let yaml = r#"
phases:
  - name: plan
  - name: plan
"#;
    let config: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_empty_phase_list() {
    let config: WorkflowConfig = serde_yaml::from_str("phases: []").unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_bad_phase_name() {
    let yaml = r#"
phases:
  - name: "Plan Phase"
"#;
    let config: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_bad_regex_and_glob() {
    let bad_regex = r#"
phases:
  - name: plan
    required_artifacts:
      - path: a.md
        predicate:
          contains: "(unclosed"
"#;
    let config: WorkflowConfig = serde_yaml::from_str(bad_regex).unwrap();
    assert!(config.validate().is_err());

    let bad_glob = r#"
phases:
  - name: plan
    allowed_paths: ["src/[a"]
"#;
    let config: WorkflowConfig = serde_yaml::from_str(bad_glob).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_fields_are_rejected() {
    let yaml = r#"
phases:
  - name: plan
surprise: true
"#;
    assert!(serde_yaml::from_str::<WorkflowConfig>(yaml).is_err());
}

#[test]
fn test_resolve_prefers_store_config() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.yaml"),
        "phases:\n  - name: only\n",
    )
    .unwrap();

    let config = WorkflowConfig::resolve(dir.path()).unwrap();
    assert_eq!(config.phase_names().collect::<Vec<_>>(), vec!["only"]);
}

#[test]
fn test_load_reports_invalid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "phases: []\n").unwrap();

    let err = WorkflowConfig::load(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("At least one phase"));
}

#[test]
fn test_explicit_signer_identity() {
    let mut config = WorkflowConfig::default_config();
    config.signer = Some("ci-bot".to_string());
    assert_eq!(config.signer_identity(), "ci-bot");

    config.signer = None;
    assert!(config.signer_identity().contains('@'));
}
