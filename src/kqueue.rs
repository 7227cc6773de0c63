//! Backend implementation for the kqueue API
//!
//! The kqueue() system call provides a generic method of notifying the user
//! when an event happens or a condition holds, based on the results of
//! small pieces of kernel code termed filters.
//!
//! kqueue needs one open file descriptor per watched path and reports
//! nothing about the contents of directories, so directory semantics are
//! synthesised here: a watched directory's children get internal watches,
//! and a write to the directory triggers a rescan that turns unknown
//! entries into `CREATE` events.
//!
//! Symlinks are registered under the name the user gave us; events surface
//! under that name, with the resolved target kept on the watch for
//! bookkeeping only.

use crate::config::Options;
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::watches::{Watch, WatchTable};
use crate::{Backend, EventTx};
use crossbeam_channel::{unbounded, Receiver, Sender};
use kqueue::{EventData, EventFilter, FilterFlag, Ident};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;

const KQUEUE: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// Event classes armed on watched paths. NOTE_EXTEND duplicates NOTE_WRITE
/// for our purposes, and NOTE_LINK/NOTE_REVOKE produce more noise than
/// signal, so they stay off.
fn watch_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_RENAME
}

/// Children of a watched directory only need to report their own
/// disappearance; everything else arrives via the directory itself.
fn child_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE | FilterFlag::NOTE_RENAME
}

// The EventLoop will set up a mio::Poll and use it to wait for the following:
//
// -  messages telling it what to do
//
// -  events telling it that something has happened on one of the watched files.
struct EventLoop {
    running: bool,
    poll: mio::Poll,
    event_loop_rx: Receiver<EventLoopMsg>,
    kqueue: kqueue::Watcher,
    event_tx: EventTx,
    watches: Arc<RwLock<WatchTable<PathBuf>>>,
    shutdown_ack: Option<Sender<()>>,
}

/// Backend implementation based on kqueue
pub(crate) struct KqueueBackend {
    channel: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
    watches: Arc<RwLock<WatchTable<PathBuf>>>,
}

enum EventLoopMsg {
    Add {
        path: PathBuf,
        recursive: bool,
        tx: Sender<Result<()>>,
    },
    Remove {
        path: PathBuf,
        tx: Sender<Result<()>>,
    },
    Shutdown {
        tx: Sender<()>,
    },
}

/// kqueue registrations are keyed by filename in the kernel interface we
/// use, so the descriptor index and the path index coincide.
type Descriptor = PathBuf;

fn add_filename_retry(
    kqueue: &mut kqueue::Watcher,
    path: &Path,
    flags: FilterFlag,
) -> std::io::Result<()> {
    loop {
        match kqueue.add_filename(path, EventFilter::EVFILT_VNODE, flags) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl EventLoop {
    fn new(
        kqueue: kqueue::Watcher,
        event_tx: EventTx,
        watches: Arc<RwLock<WatchTable<Descriptor>>>,
    ) -> Result<(Self, Arc<mio::Waker>, Sender<EventLoopMsg>)> {
        let (event_loop_tx, event_loop_rx) = unbounded::<EventLoopMsg>();
        let poll = mio::Poll::new().map_err(Error::io)?;

        let waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE).map_err(Error::io)?);

        let kqueue_fd = kqueue.as_raw_fd();
        let mut evented_kqueue = mio::unix::SourceFd(&kqueue_fd);
        poll.registry()
            .register(&mut evented_kqueue, KQUEUE, mio::Interest::READABLE)
            .map_err(Error::io)?;

        let event_loop = EventLoop {
            running: true,
            poll,
            event_loop_rx,
            kqueue,
            event_tx,
            watches,
            shutdown_ack: None,
        };
        Ok((event_loop, waker, event_loop_tx))
    }

    fn run(self) {
        let _ = thread::Builder::new()
            .name("watchfs kqueue loop".to_string())
            .spawn(|| self.event_loop_thread());
    }

    fn event_loop_thread(mut self) {
        let mut events = mio::Events::with_capacity(16);
        while self.running {
            match self.poll.poll(&mut events, None) {
                Err(ref e) if matches!(e.kind(), std::io::ErrorKind::Interrupted) => {
                    // System call was interrupted, we will retry
                    continue;
                }
                Err(e) => {
                    self.event_tx.error(Error::io(e));
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    KQUEUE => self.handle_kqueue(),
                    _ => unreachable!(),
                }
            }
        }

        let EventLoop {
            event_tx,
            shutdown_ack,
            ..
        } = self;
        drop(event_tx);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn handle_messages(&mut self) {
        while let Ok(msg) = self.event_loop_rx.try_recv() {
            match msg {
                EventLoopMsg::Add {
                    path,
                    recursive,
                    tx,
                } => {
                    let result = if recursive {
                        Err(Error::unsupported("recursive watch").add_path(path))
                    } else {
                        self.add_watch(path, true)
                    };
                    let _ = tx.send(result);
                }
                EventLoopMsg::Remove { path, tx } => {
                    let _ = tx.send(self.remove_watch(path, false));
                }
                EventLoopMsg::Shutdown { tx } => {
                    self.remove_all_watches();
                    self.shutdown_ack = Some(tx);
                    self.running = false;

                    while let Ok(msg) = self.event_loop_rx.try_recv() {
                        match msg {
                            EventLoopMsg::Add { tx, .. } => {
                                let _ = tx.send(Err(Error::closed()));
                            }
                            EventLoopMsg::Remove { tx, .. } => {
                                let _ = tx.send(Ok(()));
                            }
                            EventLoopMsg::Shutdown { tx } => {
                                let _ = tx.send(());
                            }
                        }
                    }
                    break;
                }
            }
        }
    }

    fn handle_kqueue(&mut self) {
        // (path, was added by user) pairs whose fd must be torn down, and
        // paths to re-stat for a replacement object afterwards
        let mut teardown: Vec<(PathBuf, bool)> = Vec::new();
        let mut rescan_dirs: Vec<PathBuf> = Vec::new();

        while let Some(event) = self.kqueue.poll(None) {
            log::trace!("kqueue event: {event:?}");

            match event {
                kqueue::Event {
                    data: EventData::Vnode(data),
                    ident: Ident::Filename(_, path),
                } => {
                    let path = PathBuf::from(path);
                    match data {
                        kqueue::Vnode::Delete => {
                            let user = self.added_by_user(&path);
                            if !self.event_tx.send(Event::new(path.clone(), Op::REMOVE)) {
                                return;
                            }
                            teardown.push((path, user));
                        }

                        kqueue::Vnode::Rename => {
                            // kqueue does not tell us the new name; the
                            // rename is reported under the name we watched
                            let user = self.added_by_user(&path);
                            if !self.event_tx.send(Event::new(path.clone(), Op::RENAME)) {
                                return;
                            }
                            teardown.push((path, user));
                        }

                        kqueue::Vnode::Attrib => {
                            if !self.event_tx.send(Event::new(path, Op::CHMOD)) {
                                return;
                            }
                        }

                        // a write to a directory means its entry set
                        // changed; figure out which names are new
                        kqueue::Vnode::Write => {
                            let is_dir = self
                                .watches
                                .read()
                                .map_or(false, |table| {
                                    table.by_path(&path).map_or(false, |watch| watch.is_dir)
                                });
                            if is_dir {
                                rescan_dirs.push(path);
                            } else if !self.event_tx.send(Event::new(path, Op::WRITE)) {
                                return;
                            }
                        }

                        // NOTE_EXTEND, NOTE_LINK and NOTE_REVOKE are not
                        // armed; other BSD variants may still define more
                        #[allow(unreachable_patterns)]
                        _ => {}
                    }
                }
                // as we don't add any other EVFILTER to kqueue we should never get here
                kqueue::Event { ident: _, data: _ } => unreachable!(),
            }
        }

        for (path, user) in teardown {
            let _ = self.remove_watch(path.clone(), true);

            // `mv a b` onto a watched name: a new object now lives at the
            // path we just tore down
            if path.exists() {
                if !self.event_tx.send(Event::new(path.clone(), Op::CREATE)) {
                    return;
                }
                if let Err(err) = self.add_watch(path, user) {
                    log::debug!("unable to re-watch replaced path: {err}");
                }
            }
        }

        for dir in rescan_dirs {
            if !self.rescan_directory(&dir) {
                return;
            }
        }
    }

    fn added_by_user(&self, path: &Path) -> bool {
        self.watches.read().map_or(false, |table| {
            table.by_path(path).map_or(false, |watch| watch.added_by_user)
        })
    }

    /// Emits `CREATE` for directory entries we have never seen and installs
    /// internal watches on them. Returns false when shutting down.
    fn rescan_directory(&mut self, dir: &Path) -> bool {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            // directory vanished between the event and the rescan; its own
            // delete kevent does the reporting
            Err(_) => return true,
        };

        let known: std::collections::HashSet<PathBuf> = match self.watches.read() {
            Ok(table) => table
                .children_of(dir)
                .into_iter()
                .map(|watch| watch.path.clone())
                .collect(),
            Err(_) => return true,
        };

        for entry in entries.filter_map(std::result::Result::ok) {
            let child = entry.path();
            if known.contains(&child) {
                continue;
            }

            if !self.event_tx.send(Event::new(child.clone(), Op::CREATE)) {
                return false;
            }
            if let Err(err) = self.add_child_watch(&child) {
                log::debug!("unable to watch new child {}: {err}", child.display());
            }
        }

        let _ = self.kqueue.watch();
        true
    }

    fn add_watch(&mut self, path: PathBuf, added_by_user: bool) -> Result<()> {
        let stat = std::fs::symlink_metadata(&path)
            .map_err(|e| Error::io(e).add_path(path.clone()))?;

        // resolve once, so we know what the name points at; the watch is
        // still keyed under the user-facing name
        let link_target = if stat.file_type().is_symlink() {
            std::fs::canonicalize(&path).ok()
        } else {
            None
        };
        let stat = if stat.file_type().is_symlink() {
            match std::fs::metadata(&path) {
                Ok(stat) => stat,
                // dangling link: nothing watchable behind it
                Err(e) => return Err(Error::io(e).add_path(path)),
            }
        } else {
            stat
        };

        let file_type = stat.file_type();
        if file_type.is_socket() || file_type.is_fifo() {
            // opening these for a vnode filter would block or misbehave
            return Ok(());
        }

        log::trace!("adding kqueue watch: {}", path.display());
        add_filename_retry(&mut self.kqueue, &path, watch_flags())
            .map_err(|e| Error::io(e).add_path(path.clone()))?;

        {
            let mut table = self.watches.write()?;
            let mut watch = Watch::new(path.clone(), path.clone())
                .flags(watch_flags().bits() as u32)
                .dir(stat.is_dir())
                .link(link_target);
            if !added_by_user {
                watch = watch.internal();
            }
            table.insert(watch);
        }

        if stat.is_dir() {
            self.scan_directory(&path);
        }

        // Only make a single `kevent` syscall to register all the watches.
        self.kqueue.watch().map_err(Error::io)?;
        Ok(())
    }

    /// Installs internal watches on the current children of a directory, so
    /// their removal is reported even though kqueue says nothing about
    /// directory contents. Unreadable or unwatchable children are recorded
    /// as seen and skipped.
    fn scan_directory(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::debug!("unable to scan directory {}: {err}", dir.display());
                return;
            }
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let child = entry.path();
            if self
                .watches
                .read()
                .map_or(true, |table| table.contains_path(&child))
            {
                continue;
            }
            if let Err(err) = self.add_child_watch(&child) {
                log::debug!("skipping child {}: {err}", child.display());
            }
        }
    }

    fn add_child_watch(&mut self, child: &Path) -> Result<()> {
        let registered = match std::fs::metadata(child) {
            Ok(stat) if stat.file_type().is_socket() || stat.file_type().is_fifo() => false,
            Ok(stat) => {
                add_filename_retry(&mut self.kqueue, child, child_flags())
                    .map_err(|e| Error::io(e).add_path(child.to_path_buf()))?;
                let mut table = self.watches.write()?;
                table.insert(
                    Watch::new(child.to_path_buf(), child.to_path_buf())
                        .flags(child_flags().bits() as u32)
                        .dir(stat.is_dir())
                        .internal(),
                );
                true
            }
            Err(_) => false,
        };

        if !registered {
            // note the name as seen, so rescans stop reporting it
            let mut table = self.watches.write()?;
            table.insert(Watch::new(child.to_path_buf(), child.to_path_buf()).internal());
        }
        Ok(())
    }

    fn remove_watch(&mut self, path: PathBuf, remove_descendants: bool) -> Result<()> {
        let is_dir = match self.watches.read()?.by_path(&path) {
            Some(watch) => watch.is_dir,
            None => return Err(Error::non_existent_watch().add_path(path)),
        };

        log::trace!("removing kqueue watch: {}", path.display());
        let removed = self
            .watches
            .write()?
            .remove_path(&path, remove_descendants || is_dir);
        for watch in removed {
            // flags == 0 marks a "seen but never registered" child
            if watch.flags != 0 {
                if let Err(err) = self
                    .kqueue
                    .remove_filename(&watch.path, EventFilter::EVFILT_VNODE)
                {
                    log::debug!("unable to deregister {}: {err}", watch.path.display());
                }
            }
        }
        self.kqueue.watch().map_err(Error::io)?;
        Ok(())
    }

    fn remove_all_watches(&mut self) {
        let drained = match self.watches.write() {
            Ok(mut table) => table.drain(),
            Err(_) => return,
        };
        for watch in drained {
            if watch.flags != 0 {
                let _ = self
                    .kqueue
                    .remove_filename(&watch.path, EventFilter::EVFILT_VNODE);
            }
        }
        let _ = self.kqueue.watch();
    }
}

impl KqueueBackend {
    pub fn create(event_tx: EventTx) -> Result<Self> {
        let kqueue = kqueue::Watcher::new().map_err(Error::io)?;
        let watches = Arc::new(RwLock::new(WatchTable::new()));
        let (event_loop, waker, channel) = EventLoop::new(kqueue, event_tx, watches.clone())?;
        event_loop.run();
        Ok(KqueueBackend {
            channel,
            waker,
            watches,
        })
    }
}

impl Backend for KqueueBackend {
    fn add(&self, path: PathBuf, recursive: bool, _options: Options) -> Result<()> {
        let (tx, rx) = unbounded();
        self.channel
            .send(EventLoopMsg::Add {
                path,
                recursive,
                tx,
            })
            .map_err(|_| Error::closed())?;
        self.waker.wake().map_err(Error::io)?;
        rx.recv().unwrap_or(Err(Error::closed()))
    }

    fn remove(&self, path: PathBuf, _recursive: bool) -> Result<()> {
        let (tx, rx) = unbounded();
        self.channel
            .send(EventLoopMsg::Remove { path, tx })
            .map_err(|_| Error::closed())?;
        self.waker.wake().map_err(Error::io)?;
        rx.recv().unwrap_or(Ok(()))
    }

    fn watch_list(&self) -> Vec<PathBuf> {
        self.watches
            .read()
            .map(|table| table.paths(true))
            .unwrap_or_default()
    }

    fn shutdown(&self) -> Result<()> {
        let (tx, rx) = unbounded();
        if self
            .channel
            .send(EventLoopMsg::Shutdown { tx })
            .is_err()
        {
            return Ok(());
        }
        self.waker.wake().map_err(Error::io)?;
        let _ = rx.recv();
        Ok(())
    }
}
