use super::*;
use tempfile::tempdir;

#[test]
fn test_acquire_creates_lock_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("ns.lock");

    let guard = LockGuard::acquire(&path, Duration::from_millis(100)).unwrap();
    assert!(path.exists());
    assert_eq!(guard.path(), path.as_path());
}

#[test]
fn test_second_acquire_times_out_while_held() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.lock");

    let _held = LockGuard::acquire(&path, Duration::from_millis(100)).unwrap();
    let started = Instant::now();
    let result = LockGuard::acquire(&path, Duration::from_millis(60));

    assert!(matches!(result, Err(PhaseGateError::LockTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_lock_released_on_drop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ns.lock");

    {
        let _guard = LockGuard::acquire(&path, Duration::from_millis(100)).unwrap();
    }
    assert!(LockGuard::acquire(&path, Duration::from_millis(50)).is_ok());
}

#[test]
fn test_waiter_acquires_after_holder_releases() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ns.lock");

    let held = LockGuard::acquire(&path, Duration::from_millis(100)).unwrap();
    let waiter_path = path.clone();
    let waiter = std::thread::spawn(move || {
        LockGuard::acquire(&waiter_path, Duration::from_millis(400)).map(|_| ())
    });

    std::thread::sleep(Duration::from_millis(30));
    drop(held);

    assert!(waiter.join().unwrap().is_ok());
}
