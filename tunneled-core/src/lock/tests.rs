use super::*;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn lock_in(dir: &TempDir) -> FileLock {
    FileLock::new(dir.path().join(".tunneled-lock"))
}

#[test]
fn test_acquire_creates_empty_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    let guard = lock.acquire(false, LockTimeout::Infinite).unwrap();

    assert!(guard.is_some());
    assert!(lock.is_held());
    assert_eq!(fs::metadata(lock.path()).unwrap().len(), 0);
}

#[test]
fn test_release_removes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    let guard = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();
    guard.release().unwrap();

    assert!(!lock.is_held());
}

#[test]
fn test_release_of_missing_marker_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    let guard = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();
    fs::remove_file(lock.path()).unwrap();

    let err = guard.release().unwrap_err();
    assert!(matches!(err, LockError::ReleaseFailed { .. }));
}

#[test]
fn test_drop_removes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    {
        let _guard = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();
        assert!(lock.is_held());
    }

    assert!(!lock.is_held());
}

#[test]
fn test_drop_tolerates_missing_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    let guard = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();
    fs::remove_file(lock.path()).unwrap();

    // Must not panic
    drop(guard);
    assert!(!lock.is_held());
}

#[test]
fn test_acquire_creates_missing_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let lock = FileLock::new(dir.path().join("run").join("tunneled").join("lock"));

    let guard = lock.acquire(false, LockTimeout::Infinite).unwrap();
    assert!(guard.is_some());
}

#[test]
fn test_non_blocking_acquire_on_held_lock_returns_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let _held = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();

    let started = Instant::now();
    let second = lock.acquire(false, LockTimeout::Infinite).unwrap();

    assert!(second.is_none());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_zero_timeout_does_not_wait() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let _held = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();

    let started = Instant::now();
    let second = lock.acquire(true, LockTimeout::Bounded(Duration::ZERO)).unwrap();

    assert!(second.is_none());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_timed_acquire_gives_up_after_timeout_never_before() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let _held = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let second = lock.acquire(true, LockTimeout::Bounded(timeout)).unwrap();
    let elapsed = started.elapsed();

    assert!(second.is_none());
    assert!(elapsed >= timeout, "gave up early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(2));
}

#[test]
fn test_blocking_acquire_wakes_on_release() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let held = lock.acquire(false, LockTimeout::Infinite).unwrap().unwrap();

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        held.release().unwrap();
    });

    let started = Instant::now();
    let guard = lock
        .acquire(true, LockTimeout::Bounded(Duration::from_secs(10)))
        .unwrap();

    assert!(guard.is_some());
    assert!(started.elapsed() < Duration::from_secs(5));
    releaser.join().unwrap();
}

#[test]
fn test_blocking_acquire_wakes_when_other_process_removes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    fs::write(lock.path(), b"").unwrap();

    let mut remover = Command::new("sh")
        .arg("-c")
        .arg(format!("sleep 0.2; rm -f '{}'", lock.path().display()))
        .spawn()
        .unwrap();

    let guard = lock
        .acquire(true, LockTimeout::Bounded(Duration::from_secs(10)))
        .unwrap();

    assert!(guard.is_some());
    remover.wait().unwrap();
}

#[test]
fn test_concurrent_acquirers_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            let entries = Arc::clone(&entries);
            thread::spawn(move || {
                for _ in 0..10 {
                    let guard = lock.acquire(true, LockTimeout::Infinite).unwrap().unwrap();
                    assert!(
                        !inside.swap(true, Ordering::SeqCst),
                        "two holders at once"
                    );
                    entries.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    inside.store(false, Ordering::SeqCst);
                    guard.release().unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(entries.load(Ordering::SeqCst), 40);
    assert!(!lock.is_held());
}

/// Set in the environment of the holder processes spawned below
const HOLDER_LOCK_ENV: &str = "TUNNELED_TEST_HOLDER_LOCK";
const HOLDER_LOG_ENV: &str = "TUNNELED_TEST_HOLDER_LOG";
const HOLDER_ROUNDS: usize = 10;

/// Body of one holder process, a no-op in an ordinary test run
#[test]
fn test_lock_holder_process() {
    let (Ok(lock_path), Ok(log_path)) =
        (std::env::var(HOLDER_LOCK_ENV), std::env::var(HOLDER_LOG_ENV))
    else {
        return;
    };
    let lock = FileLock::new(lock_path);
    let pid = std::process::id();

    for _ in 0..HOLDER_ROUNDS {
        let guard = lock.acquire(true, LockTimeout::Infinite).unwrap().unwrap();
        append_line(&log_path, &format!("enter {}\n", pid));
        thread::sleep(Duration::from_millis(2));
        append_line(&log_path, &format!("exit {}\n", pid));
        guard.release().unwrap();
    }
}

fn append_line(path: &str, line: &str) {
    use std::io::Write;

    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    log.write_all(line.as_bytes()).unwrap();
}

#[test]
fn test_acquirers_in_separate_processes_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    let log_path = dir.path().join("holders.log");
    let test_binary = std::env::current_exe().unwrap();

    let holders: Vec<_> = (0..4)
        .map(|_| {
            Command::new(&test_binary)
                .args([
                    "--exact",
                    "lock::tests::test_lock_holder_process",
                    "--test-threads=1",
                    "--quiet",
                ])
                .env(HOLDER_LOCK_ENV, lock.path())
                .env(HOLDER_LOG_ENV, &log_path)
                .spawn()
                .unwrap()
        })
        .collect();

    for mut holder in holders {
        assert!(holder.wait().unwrap().success());
    }

    let log = fs::read_to_string(&log_path).unwrap();
    let lines: Vec<_> = log.lines().collect();
    assert_eq!(lines.len(), 4 * HOLDER_ROUNDS * 2);
    for pair in lines.chunks(2) {
        let enter = pair[0].strip_prefix("enter ").expect("exit without enter");
        let exit = pair[1].strip_prefix("exit ").expect("two holders at once");
        assert_eq!(enter, exit);
    }
    assert!(!lock.is_held());
}

#[test]
fn test_stale_marker_blocks_until_cleared() {
    // Given: a marker left behind by a crashed holder
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);
    fs::write(lock.path(), b"").unwrap();

    // Then: a fresh non-blocking acquire fails
    assert!(lock.acquire(false, LockTimeout::Infinite).unwrap().is_none());

    // When: the operator force-clears it
    assert!(clear_lock(lock.path()).unwrap());

    // Then: the lock is available again
    assert!(lock.acquire(false, LockTimeout::Infinite).unwrap().is_some());
}

#[test]
fn test_clear_lock_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    let lock = lock_in(&dir);

    assert!(!clear_lock(lock.path()).unwrap());
}

#[test]
fn test_timeout_from_seconds() {
    assert_eq!(LockTimeout::from_secs_f64(-1.0).unwrap(), LockTimeout::Infinite);
    assert_eq!(
        LockTimeout::from_secs_f64(0.0).unwrap(),
        LockTimeout::Bounded(Duration::ZERO)
    );
    assert_eq!(
        LockTimeout::from_secs_f64(2.5).unwrap(),
        LockTimeout::Bounded(Duration::from_millis(2500))
    );
}

#[test]
fn test_out_of_range_timeout_is_rejected() {
    for value in [-2.0, -0.5, f64::NAN, f64::NEG_INFINITY, f64::INFINITY, 1e20] {
        let err = LockTimeout::try_from(value).unwrap_err();
        assert!(matches!(err, LockError::InvalidTimeout { .. }));
    }
}

#[test]
fn test_timeout_display() {
    assert_eq!(LockTimeout::Infinite.to_string(), "infinite");
    assert_eq!(
        LockTimeout::Bounded(Duration::from_millis(1500)).to_string(),
        "1.500s"
    );
}
