use super::*;
use serde::Deserialize;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    count: u32,
}

fn sample(name: &str, count: u32) -> Sample {
    Sample {
        name: name.to_string(),
        count,
    }
}

#[test]
fn test_read_json_missing_is_none() {
    let dir = tempdir().unwrap();
    let read: Option<Sample> = read_json(&dir.path().join("missing.json")).unwrap();
    assert!(read.is_none());
}

#[test]
fn test_write_json_atomic_replaces_and_leaves_no_temp() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sub").join("record.json");

    write_json_atomic(&path, &sample("a", 1)).unwrap();
    write_json_atomic(&path, &sample("b", 2)).unwrap();

    let read: Sample = read_json(&path).unwrap().unwrap();
    assert_eq!(read, sample("b", 2));

    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_read_json_reports_corruption() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{not json").unwrap();

    let result: Result<Option<Sample>> = read_json(&path);
    assert!(matches!(result, Err(PhaseGateError::Serde { .. })));
}

#[test]
fn test_create_json_exclusive_never_overwrites() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gate.json");

    assert_eq!(
        create_json_exclusive(&path, &sample("first", 1)).unwrap(),
        CreateOutcome::Created
    );
    assert_eq!(
        create_json_exclusive(&path, &sample("second", 2)).unwrap(),
        CreateOutcome::AlreadyExists
    );

    let read: Sample = read_json(&path).unwrap().unwrap();
    assert_eq!(read, sample("first", 1));
}

#[test]
fn test_jsonl_append_and_skip_bad_lines() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("log.jsonl");

    append_jsonl(&path, &sample("a", 1), WAIT).unwrap();
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{{truncated"))
        .unwrap();
    append_jsonl(&path, &sample("b", 2), WAIT).unwrap();

    let read: JsonlRead<Sample> = read_jsonl(&path, WAIT).unwrap().unwrap();
    assert_eq!(read.records, vec![sample("a", 1), sample("b", 2)]);
    assert_eq!(read.skipped.len(), 1);
    assert_eq!(read.skipped[0].0, 2);
}

#[test]
fn test_read_jsonl_missing_is_none() {
    let dir = tempdir().unwrap();
    let read: Option<JsonlRead<Sample>> = read_jsonl(&dir.path().join("none.jsonl"), WAIT).unwrap();
    assert!(read.is_none());
}

#[test]
fn test_jsonl_lock_wait_is_bounded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("log.jsonl");
    append_jsonl(&path, &sample("a", 1), WAIT).unwrap();

    let holder = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    FileExt::try_lock_exclusive(&holder).unwrap();

    let started = std::time::Instant::now();
    assert!(matches!(
        append_jsonl(&path, &sample("b", 2), Duration::from_millis(50)),
        Err(PhaseGateError::LockTimeout { .. })
    ));
    assert!(matches!(
        read_jsonl::<Sample>(&path, Duration::from_millis(50)),
        Err(PhaseGateError::LockTimeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(2));

    FileExt::unlock(&holder).unwrap();
    let read: JsonlRead<Sample> = read_jsonl(&path, WAIT).unwrap().unwrap();
    assert_eq!(read.records, vec![sample("a", 1)]);
}
