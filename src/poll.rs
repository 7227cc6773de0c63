//! Generic backend based on polling.
//!
//! Watched roots are re-scanned periodically with `stat` + `readdir` and
//! diffed against the previous snapshot. This works on every platform and
//! on filesystems that emit no change events at all (network mounts,
//! `/proc`), at the cost of latency and of missing changes that are undone
//! within one tick.

use crate::config::Options;
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::watches::{Watch, WatchTable};
use crate::{Backend, EventTx};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use filetime::FileTime;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use walkdir::WalkDir;

/// What one tick remembers about a path.
#[derive(Clone, Debug, PartialEq, Eq)]
struct FileInfo {
    mtime: FileTime,
    mode: u32,
    is_dir: bool,
    /// Filesystem identity (device, inode) where the platform provides a
    /// reliable one; rename detection degrades gracefully without it.
    ident: Option<(u64, u64)>,
}

impl FileInfo {
    fn of(metadata: &Metadata) -> Self {
        FileInfo {
            mtime: FileTime::from_last_modification_time(metadata),
            mode: mode_of(metadata),
            is_dir: metadata.is_dir(),
            ident: ident_of(metadata),
        }
    }
}

#[cfg(unix)]
fn mode_of(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_of(metadata: &Metadata) -> u32 {
    metadata.permissions().readonly() as u32
}

#[cfg(unix)]
fn ident_of(metadata: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn ident_of(_metadata: &Metadata) -> Option<(u64, u64)> {
    None
}

type Snapshot = HashMap<PathBuf, FileInfo>;

struct PollState {
    watches: RwLock<WatchTable<usize>>,
    snapshots: Mutex<HashMap<PathBuf, Snapshot>>,
}

/// Backend implementation based on periodic re-scanning
pub(crate) struct PollBackend {
    state: Arc<PollState>,
    /// Dropping the sender wakes and terminates the tick thread.
    tick_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    next_wd: AtomicUsize,
}

impl PollBackend {
    pub fn create(tx: EventTx, interval: Duration) -> Result<Self> {
        let state = Arc::new(PollState {
            watches: RwLock::new(WatchTable::new()),
            snapshots: Mutex::new(HashMap::new()),
        });
        let (tick_tx, tick_rx) = unbounded();

        let loop_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("watchfs poll loop".to_string())
            .spawn(move || poll_loop(loop_state, tx, interval, tick_rx))
            .map_err(Error::io)?;

        Ok(PollBackend {
            state,
            tick_tx: Mutex::new(Some(tick_tx)),
            handle: Mutex::new(Some(handle)),
            next_wd: AtomicUsize::new(1),
        })
    }
}

impl Backend for PollBackend {
    fn add(&self, path: PathBuf, recursive: bool, _options: Options) -> Result<()> {
        if recursive {
            return Err(Error::unsupported("recursive watch").add_path(path));
        }

        let metadata = std::fs::metadata(&path)
            .map_err(|e| Error::io(e).add_path(path.clone()))?;

        if self.state.watches.read()?.contains_path(&path) {
            return Ok(());
        }

        // Seed before publishing the watch, so the first tick diffs against
        // the state at add time instead of reporting everything as created.
        let snapshot = scan(&path);
        self.state
            .snapshots
            .lock()?
            .insert(path.clone(), snapshot);

        let mut watches = self.state.watches.write()?;
        if !watches.contains_path(&path) {
            let wd = self.next_wd.fetch_add(1, Ordering::SeqCst);
            watches.insert(Watch::new(path, wd).dir(metadata.is_dir()));
        }
        Ok(())
    }

    fn remove(&self, path: PathBuf, recursive: bool) -> Result<()> {
        let removed = self.state.watches.write()?.remove_path(&path, recursive);
        if removed.is_empty() {
            return Err(Error::non_existent_watch().add_path(path));
        }
        self.state.snapshots.lock()?.remove(&path);
        Ok(())
    }

    fn watch_list(&self) -> Vec<PathBuf> {
        self.state
            .watches
            .read()
            .map(|watches| watches.paths(true))
            .unwrap_or_default()
    }

    fn shutdown(&self) -> Result<()> {
        drop(self.tick_tx.lock()?.take());
        if let Some(handle) = self.handle.lock()?.take() {
            let _ = handle.join();
        }
        self.state.watches.write()?.drain();
        self.state.snapshots.lock()?.clear();
        Ok(())
    }
}

fn poll_loop(state: Arc<PollState>, tx: EventTx, interval: Duration, tick_rx: Receiver<()>) {
    loop {
        match tick_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            // shutdown: the sender was dropped
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if !tick(&state, &tx) {
            break;
        }
    }
    // dropping `tx` here closes the events channel, then the errors channel
}

/// One scan-and-diff cycle; false means the watcher is shutting down and
/// the in-flight cycle is dropped.
fn tick(state: &Arc<PollState>, tx: &EventTx) -> bool {
    let roots = match state.watches.read() {
        Ok(watches) => watches.paths(false),
        Err(_) => return false,
    };

    for root in roots {
        if tx.cancelled() {
            return false;
        }

        let previous = match state.snapshots.lock() {
            // not seeded yet: an add() is mid-flight, pick it up next tick
            Ok(snapshots) => match snapshots.get(&root) {
                Some(snapshot) => snapshot.clone(),
                None => continue,
            },
            Err(_) => return false,
        };

        let root_gone = !root.exists();
        let next = if root_gone { Snapshot::new() } else { scan(&root) };

        for event in diff(&previous, &next) {
            if !tx.send(event) {
                return false;
            }
        }

        match state.snapshots.lock() {
            Ok(mut snapshots) => {
                if root_gone {
                    snapshots.remove(&root);
                } else {
                    snapshots.insert(root.clone(), next);
                }
            }
            Err(_) => return false,
        }
        if root_gone {
            log::debug!("polled root disappeared, dropping watch: {}", root.display());
            if let Ok(mut watches) = state.watches.write() {
                watches.remove_path(&root, false);
            }
        }
    }
    true
}

/// Snapshots a root and its direct children. Unreadable entries are
/// skipped; they will simply never appear in a snapshot.
fn scan(root: &Path) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for entry in WalkDir::new(root)
        .follow_links(true)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if let Ok(metadata) = std::fs::metadata(entry.path()) {
            snapshot.insert(entry.path().to_path_buf(), FileInfo::of(&metadata));
        }
    }
    snapshot
}

/// Computes the events between two snapshots: writes and chmods first, then
/// renames paired by identity, then the remaining creates and removes.
fn diff(previous: &Snapshot, next: &Snapshot) -> Vec<Event> {
    let mut events = Vec::new();

    for (path, info) in next {
        if let Some(old) = previous.get(path) {
            if !info.is_dir && info.mtime != old.mtime {
                events.push(Event::new(path.clone(), Op::WRITE));
            }
            if info.mode != old.mode {
                events.push(Event::new(path.clone(), Op::CHMOD));
            }
        }
    }

    let removed: Vec<(&PathBuf, &FileInfo)> = previous
        .iter()
        .filter(|(path, _)| !next.contains_key(*path))
        .collect();
    let created: Vec<(&PathBuf, &FileInfo)> = next
        .iter()
        .filter(|(path, _)| !previous.contains_key(*path))
        .collect();

    // A remove and a create with the same identity are one object moving;
    // both events are still needed so the consumer can follow it.
    let mut claimed = vec![false; created.len()];
    let mut plain_removes = Vec::new();
    for (path, info) in &removed {
        let matched = info.ident.and_then(|ident| {
            created.iter().position(|(_, candidate)| {
                candidate.ident == Some(ident) && candidate.is_dir == info.is_dir
            })
        });
        match matched {
            Some(idx) if !claimed[idx] => {
                claimed[idx] = true;
                events.push(Event::new((*path).clone(), Op::RENAME));
                events.push(Event::renamed(
                    created[idx].0.clone(),
                    Op::CREATE,
                    Some((*path).clone()),
                ));
            }
            _ => plain_removes.push((*path).clone()),
        }
    }

    for (idx, (path, _)) in created.iter().enumerate() {
        if !claimed[idx] {
            events.push(Event::new((*path).clone(), Op::CREATE));
        }
    }
    for path in plain_removes {
        events.push(Event::new(path, Op::REMOVE));
    }

    events
}
