//! Facade contract tests and end-to-end scenarios against the native and
//! polling backends.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use watchfs::{ErrorKind, Event, Op, Watcher};

#[cfg(not(target_os = "windows"))]
const TIMEOUT_MS: u64 = 500;
#[cfg(target_os = "windows")]
const TIMEOUT_MS: u64 = 3000;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_SETTLE: Duration = Duration::from_millis(400);

fn buffered() -> Watcher {
    Watcher::new_buffered(4096).expect("failed to create watcher")
}

fn polling() -> Watcher {
    Watcher::new_polling_buffered(POLL_INTERVAL, 4096).expect("failed to create poll watcher")
}

fn testdir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fs::canonicalize(dir.path()).expect("canonicalize");
    (dir, path)
}

fn recv_events_with_timeout(watcher: &Watcher, timeout: Duration) -> Vec<Event> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < timeout {
        while let Ok(event) = watcher.events().try_recv() {
            events.push(event);
        }
        thread::sleep(Duration::from_millis(10));
    }
    events
}

fn recv_events(watcher: &Watcher) -> Vec<Event> {
    recv_events_with_timeout(watcher, Duration::from_millis(TIMEOUT_MS))
}

fn ops(events: &[Event]) -> Vec<(PathBuf, Op)> {
    events.iter().map(|e| (e.path.clone(), e.op)).collect()
}

/// Same as `ops`, with runs of identical entries collapsed; kernels may
/// deliver several records for one logical write.
fn dedup_ops(events: &[Event]) -> Vec<(PathBuf, Op)> {
    let mut out: Vec<(PathBuf, Op)> = Vec::new();
    for pair in ops(events) {
        if out.last() != Some(&pair) {
            out.push(pair);
        }
    }
    out
}

/// Asserts that `expected` appears as a subsequence of the observed
/// (path, op) pairs, in order.
fn assert_in_order<P: AsRef<Path>>(events: &[Event], expected: &[(P, Op)]) {
    let observed = ops(events);
    let mut cursor = observed.iter();
    for (path, op) in expected {
        let path = path.as_ref();
        let found = cursor.any(|(p, o)| p.as_path() == path && o.has(*op));
        assert!(
            found,
            "missing {op} for {path:?} (in order) in {observed:#?}"
        );
    }
}

/// Waits until `check` passes, re-polling the channel; fails on timeout.
fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

// ---------------------------------------------------------------------------
// facade contracts
// ---------------------------------------------------------------------------

#[test]
fn add_missing_path_fails_with_not_found() {
    let watcher = buffered();
    let err = watcher
        .add("/watchfs/definitely/does/not/exist")
        .expect_err("add should fail");
    match err.kind {
        ErrorKind::Io(inner) => {
            assert_eq!(inner.kind(), std::io::ErrorKind::NotFound, "{inner:?}")
        }
        other => panic!("expected Io(NotFound), got {other:?}"),
    }
}

#[test]
fn add_is_idempotent_per_cleaned_path() {
    let (_guard, dir) = testdir();
    let watcher = buffered();

    watcher.add(&dir).expect("add");
    watcher.add(&dir).expect("second add");
    // a differently-spelled but equal path is the same watch
    watcher.add(dir.join(".")).expect("dotted add");

    assert_eq!(watcher.watch_list(), vec![dir.clone()]);
    watcher.close().expect("close");
}

#[test]
fn remove_is_single_shot() {
    let (_guard, dir) = testdir();
    let watcher = buffered();

    watcher.add(&dir).expect("add");
    watcher.remove(&dir).expect("first remove");
    let err = watcher.remove(&dir).expect_err("second remove should fail");
    assert!(
        matches!(err.kind, ErrorKind::NonExistentWatch),
        "{err:?}"
    );
}

#[test]
fn remove_unknown_path_reports_non_existent_watch() {
    let (_guard, dir) = testdir();
    let watcher = buffered();
    let err = watcher.remove(&dir).expect_err("remove should fail");
    assert!(matches!(err.kind, ErrorKind::NonExistentWatch), "{err:?}");
}

#[test]
fn watch_list_tracks_adds_and_removes() {
    let (_guard, dir) = testdir();
    let a = dir.join("a");
    let b = dir.join("b");
    let c = dir.join("c");
    for p in [&a, &b, &c] {
        fs::create_dir(p).expect("create_dir");
    }

    let watcher = buffered();
    watcher.add(&a).expect("add a");
    watcher.add(&b).expect("add b");
    watcher.add(&c).expect("add c");
    watcher.remove(&b).expect("remove b");

    let mut list = watcher.watch_list();
    list.sort();
    assert_eq!(list, vec![a, c]);
}

#[test]
fn operations_after_close() {
    let (_guard, dir) = testdir();
    let watcher = buffered();
    watcher.add(&dir).expect("add");
    watcher.close().expect("close");

    let err = watcher.add(&dir).expect_err("add after close");
    assert!(matches!(err.kind, ErrorKind::Closed), "{err:?}");

    // teardown already happened; removal is a success by definition
    watcher.remove(&dir).expect("remove after close");
    assert!(watcher.watch_list().is_empty());

    // closing again is fine too
    watcher.close().expect("second close");
}

#[test]
fn close_shuts_both_channels_events_first() {
    let (_guard, dir) = testdir();
    let watcher = buffered();
    watcher.add(&dir).expect("add");
    watcher.close().expect("close");

    assert!(
        matches!(
            watcher.events().recv(),
            Err(crossbeam_channel::RecvError)
        ),
        "events channel should be closed"
    );
    assert!(
        matches!(
            watcher.errors().recv(),
            Err(crossbeam_channel::RecvError)
        ),
        "errors channel should be closed"
    );
}

#[test]
fn concurrent_closes_all_succeed() {
    let (_guard, dir) = testdir();
    let watcher = Arc::new(buffered());
    watcher.add(&dir).expect("add");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let watcher = Arc::clone(&watcher);
            thread::spawn(move || watcher.close())
        })
        .collect();
    for handle in handles {
        handle.join().expect("join").expect("close");
    }
    assert!(watcher.events().recv().is_err());
    assert!(watcher.errors().recv().is_err());
}

#[test]
fn no_events_after_close() {
    let (_guard, dir) = testdir();
    let watcher = buffered();
    watcher.add(&dir).expect("add");
    watcher.close().expect("close");

    fs::write(dir.join("late"), b"data").expect("write");
    thread::sleep(Duration::from_millis(100));

    assert!(watcher.events().try_recv().is_err());
    assert!(watcher.errors().try_recv().is_err());
}

#[test]
fn dropping_a_watcher_does_not_hang() {
    let (_guard, dir) = testdir();
    let watcher = buffered();
    watcher.add(&dir).expect("add");
    drop(watcher);
}

// ---------------------------------------------------------------------------
// end-to-end scenarios, native backend
// ---------------------------------------------------------------------------

#[test]
fn multiple_creates_in_watched_dir() {
    let (_guard, dir) = testdir();
    let file = dir.join("file");
    let watcher = buffered();
    watcher.add(&dir).expect("add");

    let pause = || thread::sleep(Duration::from_millis(30));
    fs::write(&file, b"data").expect("write");
    pause();
    fs::remove_file(&file).expect("remove");
    pause();
    fs::File::create(&file).expect("touch");
    pause();
    fs::write(&file, b"data").expect("write 2");
    pause();
    fs::write(&file, b"data").expect("write 3");

    let events = recv_events(&watcher);
    assert_in_order(
        &events,
        &[
            (&file, Op::CREATE),
            (&file, Op::WRITE),
            (&file, Op::REMOVE),
            (&file, Op::CREATE),
            (&file, Op::WRITE),
            (&file, Op::WRITE),
        ],
    );
}

#[test]
fn files_created_before_watching_only_report_later_changes() {
    let (_guard, dir) = testdir();
    let before = dir.join("beforewatch");
    let file = dir.join("file");
    fs::File::create(&before).expect("touch");

    let watcher = buffered();
    watcher.add(&dir).expect("add");

    let pause = || thread::sleep(Duration::from_millis(30));
    fs::write(&file, b"data").expect("write");
    pause();
    fs::remove_file(&file).expect("remove file");
    pause();
    fs::remove_file(&before).expect("remove beforewatch");

    let events = recv_events(&watcher);
    assert!(
        !events
            .iter()
            .any(|e| e.path == before && e.has(Op::CREATE)),
        "no create for a pre-existing file: {events:#?}"
    );
    assert_in_order(
        &events,
        &[
            (&file, Op::CREATE),
            (&file, Op::WRITE),
            (&file, Op::REMOVE),
            (&before, Op::REMOVE),
        ],
    );
}

#[test]
fn rename_reports_old_name_then_new_name() {
    let (_guard, dir) = testdir();
    let file = dir.join("file");
    let renamed = dir.join("renamed");
    fs::write(&file, b"asd").expect("write");

    let watcher = buffered();
    watcher.add(&dir).expect("add");

    fs::rename(&file, &renamed).expect("rename");

    let events = recv_events(&watcher);
    assert_in_order(&events, &[(&file, Op::RENAME), (&renamed, Op::CREATE)]);

    // inotify correlates both halves through the kernel cookie
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let create = events
            .iter()
            .find(|e| e.path == renamed && e.has(Op::CREATE))
            .expect("create event");
        assert_eq!(create.renamed_from.as_deref(), Some(file.as_path()));
    }
}

#[test]
#[cfg(unix)]
fn chmod_does_not_imply_write() {
    use std::os::unix::fs::PermissionsExt;

    let (_guard, dir) = testdir();
    let file = dir.join("file");
    fs::write(&file, b"data").expect("write");

    let watcher = buffered();
    watcher.add(&file).expect("add");

    fs::set_permissions(&file, fs::Permissions::from_mode(0o700)).expect("chmod");
    thread::sleep(Duration::from_millis(30));
    fs::write(&file, b"more").expect("write 2");

    let events = recv_events(&watcher);
    assert_eq!(
        dedup_ops(&events),
        vec![(file.clone(), Op::CHMOD), (file.clone(), Op::WRITE)],
        "{events:#?}"
    );
}

#[test]
fn close_races_cleanly_with_heavy_removal() {
    let (_guard, dir) = testdir();
    let files: Vec<PathBuf> = (0..200).map(|i| dir.join(format!("file-{i}"))).collect();
    for file in &files {
        fs::File::create(file).expect("create");
    }

    // unbuffered on purpose: the reader must be interruptible while it is
    // blocked on a rendezvous send
    let watcher = Arc::new(Watcher::new().expect("watcher"));
    watcher.add(&dir).expect("add");

    let consumer = {
        let watcher = Arc::clone(&watcher);
        thread::spawn(move || while watcher.events().recv().is_ok() {})
    };
    let remover = thread::spawn(move || {
        for file in files {
            let _ = fs::remove_file(file);
        }
    });

    thread::sleep(Duration::from_millis(20));
    watcher.close().expect("close");

    remover.join().expect("remover");
    consumer.join().expect("consumer");
    assert!(watcher.events().recv().is_err());
    assert!(watcher.errors().recv().is_err());
}

#[test]
fn two_writes_to_one_descriptor_give_two_events() {
    use std::io::Write;

    let (_guard, dir) = testdir();
    let file = dir.join("file");
    let watcher = buffered();
    watcher.add(&dir).expect("add");

    let mut handle = fs::File::create(&file).expect("create");
    handle.write_all(b"X").expect("write X");
    handle.sync_all().expect("fsync");
    thread::sleep(Duration::from_millis(50));
    handle.write_all(b"Y").expect("write Y");
    handle.sync_all().expect("fsync 2");
    drop(handle);

    let events = recv_events(&watcher);
    assert_in_order(
        &events,
        &[(&file, Op::CREATE), (&file, Op::WRITE), (&file, Op::WRITE)],
    );
}

#[test]
fn kernel_deleting_a_watched_file_clears_the_watch() {
    let (_guard, dir) = testdir();
    let file = dir.join("file");
    fs::write(&file, b"data").expect("write");

    let watcher = buffered();
    watcher.add(&file).expect("add");
    fs::remove_file(&file).expect("remove");

    assert!(
        wait_until(
            || watcher.watch_list().is_empty(),
            Duration::from_millis(TIMEOUT_MS)
        ),
        "watch should disappear with the file"
    );
}

// ---------------------------------------------------------------------------
// recursive registration (inotify only)
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "linux", target_os = "android"))]
mod recursive {
    use super::*;
    use watchfs::Options;

    #[test]
    fn events_from_the_whole_tree() {
        let (_guard, dir) = testdir();
        let sub = dir.join("a/b");
        fs::create_dir_all(&sub).expect("create_dir_all");

        let watcher = buffered();
        watcher.add(dir.join("...")).expect("recursive add");

        let deep = sub.join("deep");
        fs::write(&deep, b"data").expect("write");

        let events = recv_events(&watcher);
        assert_in_order(&events, &[(&deep, Op::CREATE), (&deep, Op::WRITE)]);
    }

    #[test]
    fn new_subdirectories_are_picked_up() {
        let (_guard, dir) = testdir();
        let watcher = buffered();
        watcher.add(dir.join("...")).expect("recursive add");

        let sub = dir.join("fresh");
        fs::create_dir(&sub).expect("create_dir");
        // give the reader a moment to install the new watch
        thread::sleep(Duration::from_millis(100));
        let inner = sub.join("inner");
        fs::write(&inner, b"data").expect("write");

        let events = recv_events(&watcher);
        assert_in_order(&events, &[(&sub, Op::CREATE), (&inner, Op::CREATE)]);
    }

    #[test]
    fn synthetic_creates_for_discovered_subdirectories() {
        let (_guard, dir) = testdir();
        let a = dir.join("a");
        let b = a.join("b");
        fs::create_dir_all(&b).expect("create_dir_all");

        let watcher = buffered();
        watcher
            .add_with(
                dir.join("..."),
                Options::default().with_create_on_recursive_add(true),
            )
            .expect("recursive add");

        let events = recv_events_with_timeout(&watcher, Duration::from_millis(200));
        let created: Vec<&PathBuf> = events
            .iter()
            .filter(|e| e.has(Op::CREATE))
            .map(|e| &e.path)
            .collect();
        assert!(created.contains(&&a), "{events:#?}");
        assert!(created.contains(&&b), "{events:#?}");
        assert!(!created.contains(&&dir), "no create for the root itself");
    }

    #[test]
    fn renaming_a_subdirectory_rewrites_descendant_watches() {
        let (_guard, dir) = testdir();
        let old = dir.join("old");
        let new = dir.join("new");
        fs::create_dir(&old).expect("create_dir");

        let watcher = buffered();
        watcher.add(dir.join("...")).expect("recursive add");

        fs::rename(&old, &new).expect("rename");
        thread::sleep(Duration::from_millis(100));
        let inner = new.join("inner");
        fs::write(&inner, b"data").expect("write");

        let events = recv_events(&watcher);
        assert_in_order(
            &events,
            &[(&old, Op::RENAME), (&new, Op::CREATE), (&inner, Op::CREATE)],
        );
    }

    #[test]
    fn removing_the_root_drops_the_subtree() {
        let (_guard, dir) = testdir();
        fs::create_dir_all(dir.join("a/b")).expect("create_dir_all");

        let watcher = buffered();
        watcher.add(dir.join("...")).expect("recursive add");
        assert_eq!(watcher.watch_list(), vec![dir.clone()]);

        watcher.remove(dir.join("...")).expect("recursive remove");
        assert!(watcher.watch_list().is_empty());

        // nothing under the removed root reports anymore
        fs::write(dir.join("a/b/late"), b"data").expect("write");
        let events = recv_events_with_timeout(&watcher, Duration::from_millis(200));
        assert!(events.is_empty(), "{events:#?}");
    }

    #[test]
    fn op_mask_limits_kernel_registration() {
        let (_guard, dir) = testdir();
        let file = dir.join("file");
        fs::write(&file, b"data").expect("write");

        let watcher = buffered();
        watcher
            .add_with(&dir, Options::default().with_op_mask(Op::CREATE | Op::REMOVE))
            .expect("add");

        fs::write(&file, b"changed").expect("write 2");
        let other = dir.join("other");
        fs::File::create(&other).expect("create");

        let events = recv_events(&watcher);
        assert!(
            events.iter().all(|e| !e.has(Op::WRITE)),
            "writes are not armed: {events:#?}"
        );
        assert_in_order(&events, &[(&other, Op::CREATE)]);
    }

    #[test]
    fn unportable_ops_are_opt_in() {
        let (_guard, dir) = testdir();
        let file = dir.join("file");
        fs::write(&file, b"data").expect("write");

        let watcher = buffered();
        watcher
            .add_with(
                &file,
                Options::default().with_op_mask(Op::OPEN | Op::CLOSE_READ),
            )
            .expect("add");

        let _content = fs::read(&file).expect("read");

        let events = recv_events(&watcher);
        assert_in_order(&events, &[(&file, Op::OPEN), (&file, Op::CLOSE_READ)]);
    }
}

// ---------------------------------------------------------------------------
// polling backend
// ---------------------------------------------------------------------------

#[test]
#[cfg(unix)]
fn poll_reports_create_write_chmod_remove() {
    use std::os::unix::fs::PermissionsExt;

    let (_guard, dir) = testdir();
    let file = dir.join("file");
    let watcher = polling();
    watcher.add(&dir).expect("add");

    fs::write(&file, b"data").expect("write");
    thread::sleep(POLL_SETTLE);
    fs::write(&file, b"changed bytes").expect("write 2");
    thread::sleep(POLL_SETTLE);
    fs::set_permissions(&file, fs::Permissions::from_mode(0o700)).expect("chmod");
    thread::sleep(POLL_SETTLE);
    fs::remove_file(&file).expect("remove");
    thread::sleep(POLL_SETTLE);

    let events = recv_events_with_timeout(&watcher, POLL_SETTLE);
    assert_in_order(
        &events,
        &[
            (&file, Op::CREATE),
            (&file, Op::WRITE),
            (&file, Op::CHMOD),
            (&file, Op::REMOVE),
        ],
    );
}

#[test]
fn poll_does_not_report_preexisting_files() {
    let (_guard, dir) = testdir();
    let before = dir.join("beforewatch");
    fs::write(&before, b"data").expect("write");

    let watcher = polling();
    watcher.add(&dir).expect("add");
    thread::sleep(POLL_SETTLE);

    let events = recv_events_with_timeout(&watcher, POLL_SETTLE);
    assert!(events.is_empty(), "{events:#?}");
}

#[test]
fn poll_pairs_renames_through_identity() {
    let (_guard, dir) = testdir();
    let old = dir.join("old");
    let new = dir.join("new");
    fs::write(&old, b"data").expect("write");

    let watcher = polling();
    watcher.add(&dir).expect("add");
    thread::sleep(POLL_SETTLE);

    fs::rename(&old, &new).expect("rename");
    thread::sleep(POLL_SETTLE);

    let events = recv_events_with_timeout(&watcher, POLL_SETTLE);
    assert_in_order(&events, &[(&old, Op::RENAME), (&new, Op::CREATE)]);
    let create = events
        .iter()
        .find(|e| e.path == new && e.has(Op::CREATE))
        .expect("create half");
    assert_eq!(create.renamed_from.as_deref(), Some(old.as_path()));
}

#[test]
fn poll_drops_watch_when_root_disappears() {
    let (_guard, dir) = testdir();
    let root = dir.join("root");
    fs::create_dir(&root).expect("create_dir");
    fs::write(root.join("file"), b"data").expect("write");

    let watcher = polling();
    watcher.add(&root).expect("add");
    thread::sleep(POLL_SETTLE);

    fs::remove_dir_all(&root).expect("remove_dir_all");

    assert!(
        wait_until(|| watcher.watch_list().is_empty(), Duration::from_secs(2)),
        "watch should be dropped with its root"
    );
    let events = recv_events_with_timeout(&watcher, POLL_SETTLE);
    assert!(
        events.iter().any(|e| e.path == root && e.has(Op::REMOVE)),
        "{events:#?}"
    );
}

#[test]
fn poll_rejects_recursive_requests() {
    let (_guard, dir) = testdir();
    let watcher = polling();
    let err = watcher.add(dir.join("...")).expect_err("should fail");
    assert!(matches!(err.kind, ErrorKind::Unsupported(_)), "{err:?}");
}
