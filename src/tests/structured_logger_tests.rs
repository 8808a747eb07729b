//! Tests for the audit logger.

use super::*;
use tempfile::TempDir;

fn ns(id: &str) -> NamespaceId {
    NamespaceId::parse(id).unwrap()
}

#[test]
fn test_log_writes_jsonl_with_monotonic_seq() {
    let dir = TempDir::new().unwrap();
    let logger = StructuredLogger::new(&dir.path().join("audit")).unwrap();

    logger.log("Test", None, serde_json::json!({"type": "A"}));
    logger.log("Test", Some(&ns("20260101T000000-1-aa")), serde_json::json!({"type": "B"}));

    let entries = read_entries(logger.log_path(), None).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 1);
    assert_eq!(entries[1].seq, 2);
    assert_eq!(entries[0].pid, std::process::id());
    assert_eq!(entries[1].namespace_id.as_deref(), Some("20260101T000000-1-aa"));
    assert!(entries[0].ts.ends_with('Z'));
}

#[test]
fn test_read_entries_filters_by_namespace() {
    let dir = TempDir::new().unwrap();
    let logger = StructuredLogger::new(dir.path()).unwrap();
    let a = ns("20260101T000000-1-aa");
    let b = ns("20260101T000000-1-bb");

    logger.log("Test", Some(&a), "one");
    logger.log("Test", Some(&b), "two");
    logger.log("Test", Some(&a), "three");

    let only_a = read_entries(logger.log_path(), Some(&a)).unwrap();
    assert_eq!(only_a.len(), 2);
    assert!(only_a.iter().all(|e| e.namespace_id.as_deref() == Some(a.as_str())));
}

#[test]
fn test_read_entries_skips_garbage_and_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(read_entries(&dir.path().join("absent.jsonl"), None)
        .unwrap()
        .is_empty());

    let logger = StructuredLogger::new(dir.path()).unwrap();
    logger.log("Test", None, "ok");
    std::fs::OpenOptions::new()
        .append(true)
        .open(logger.log_path())
        .and_then(|mut f| writeln!(f, "not-json"))
        .unwrap();

    assert_eq!(read_entries(logger.log_path(), None).unwrap().len(), 1);
}

#[test]
fn test_two_loggers_share_one_file() {
    let dir = TempDir::new().unwrap();
    let first = StructuredLogger::new(dir.path()).unwrap();
    let second = StructuredLogger::new(dir.path()).unwrap();

    first.log("A", None, "x");
    second.log("B", None, "y");

    let components: Vec<String> = read_entries(first.log_path(), None)
        .unwrap()
        .into_iter()
        .map(|e| e.component)
        .collect();
    assert_eq!(components, vec!["A".to_string(), "B".to_string()]);
}
