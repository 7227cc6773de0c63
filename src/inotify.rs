//! Backend implementation for the inotify Linux API
//!
//! The inotify API provides a mechanism for monitoring filesystem events.
//! Inotify can be used to monitor individual files, or to monitor
//! directories. When a directory is monitored, inotify will return events
//! for the directory itself, and for files inside the directory.
//!
//! Registration and removal run on the caller's thread against a shared
//! handle to the inotify instance; only the blocking read loop lives on the
//! reader thread. The two sides meet in the watch table.

use crate::config::Options;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, Op};
use crate::watches::{Watch, WatchTable};
use crate::{Backend, EventTx};
use crossbeam_channel::{unbounded, Receiver, Sender};
use inotify as inotify_sys;
use inotify_sys::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use std::fs::metadata;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use walkdir::WalkDir;

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// MOVED_FROM sides kept around for cookie pairing. A fixed ring instead of
/// a map: moves that leave the watched tree never see their MOVED_TO half,
/// and must not accumulate.
const COOKIE_RING_SLOTS: usize = 10;

struct CookieRing {
    slots: [Option<(u32, PathBuf)>; COOKIE_RING_SLOTS],
    next: usize,
}

impl CookieRing {
    fn new() -> Self {
        CookieRing {
            slots: std::array::from_fn(|_| None),
            next: 0,
        }
    }

    /// Stores a rename source; overflow silently overwrites the oldest slot.
    fn push(&mut self, cookie: u32, path: PathBuf) {
        self.slots[self.next] = Some((cookie, path));
        self.next = (self.next + 1) % COOKIE_RING_SLOTS;
    }

    fn take(&mut self, cookie: u32) -> Option<PathBuf> {
        self.slots.iter_mut().find_map(|slot| match slot {
            Some((c, _)) if *c == cookie => slot.take().map(|(_, path)| path),
            _ => None,
        })
    }
}

/// Maps the requested operations to the kernel event classes to arm.
fn op_to_watch_mask(op: Op) -> WatchMask {
    let mut mask = WatchMask::empty();
    if op.has(Op::CREATE) {
        mask |= WatchMask::CREATE;
    }
    if op.has(Op::WRITE) {
        mask |= WatchMask::MODIFY;
    }
    if op.has(Op::REMOVE) {
        mask |= WatchMask::DELETE | WatchMask::DELETE_SELF;
    }
    if op.has(Op::RENAME) {
        mask |= WatchMask::MOVED_FROM | WatchMask::MOVED_TO | WatchMask::MOVE_SELF;
    }
    if op.has(Op::CHMOD) {
        mask |= WatchMask::ATTRIB;
    }
    if op.has(Op::OPEN) {
        mask |= WatchMask::OPEN;
    }
    if op.has(Op::READ) {
        mask |= WatchMask::ACCESS;
    }
    if op.has(Op::CLOSE_WRITE) {
        mask |= WatchMask::CLOSE_WRITE;
    }
    if op.has(Op::CLOSE_READ) {
        mask |= WatchMask::CLOSE_NOWRITE;
    }
    mask
}

type SharedWatches = Arc<RwLock<WatchTable<WatchDescriptor>>>;

fn is_not_found(err: &Error) -> bool {
    matches!(&err.kind, ErrorKind::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

/// return `DirEntry` when it is a directory
fn filter_dir(e: walkdir::Result<walkdir::DirEntry>) -> Option<walkdir::DirEntry> {
    if let Ok(e) = e {
        if let Ok(metadata) = e.metadata() {
            if metadata.is_dir() {
                return Some(e);
            }
        }
    }
    None
}

/// The armed flags of a recursive watch on the parent directory, if any.
fn recursive_parent_flags(watches: &SharedWatches, path: &Path) -> Option<WatchMask> {
    let parent = path.parent()?;
    let table = watches.read().ok()?;
    let watch = table.by_path(parent)?;
    if watch.recurse {
        WatchMask::from_bits(watch.flags)
    } else {
        None
    }
}

/// (recursive, parent watched) for the watch at `path`.
fn watch_state(watches: &SharedWatches, path: &Path) -> (bool, bool) {
    match watches.read() {
        Ok(table) => (
            table.by_path(path).map_or(false, |watch| watch.recurse),
            path.parent().map_or(false, |p| table.contains_path(p)),
        ),
        Err(_) => (false, false),
    }
}

/// Rewrites the stored paths of a renamed directory subtree, if we were
/// watching the old name. Returns whether anything was rewritten.
fn rewrite_subtree(watches: &SharedWatches, old: &Path, new: &Path) -> bool {
    match watches.write() {
        Ok(mut table) => {
            if table.contains_path(old) {
                log::trace!(
                    "rewriting watch paths: {} -> {}",
                    old.display(),
                    new.display()
                );
                table.rewrite_prefix(old, new);
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

/// Registers one path, merging with an existing registration for the same
/// path instead of replacing it.
fn register(
    kernel: &mut Watches,
    table: &SharedWatches,
    path: PathBuf,
    mask: WatchMask,
    is_recursive: bool,
    added_by_user: bool,
) -> Result<()> {
    let mut watchmask = mask;
    let already_watched = {
        let table = table.read()?;
        match table.by_path(&path) {
            Some(existing) => {
                watchmask |= WatchMask::from_bits_truncate(existing.flags);
                watchmask |= WatchMask::MASK_ADD;
                true
            }
            None => false,
        }
    };

    log::trace!("adding inotify watch: {}", path.display());

    match kernel.add(&path, watchmask) {
        Err(e) => {
            // the fd goes away underneath us only on close
            if e.raw_os_error() == Some(libc::EBADF) {
                return Err(Error::closed());
            }
            Err(Error::io(e).add_path(path))
        }
        Ok(wd) => {
            watchmask.remove(WatchMask::MASK_ADD);

            if already_watched {
                // same path, same descriptor: only the armed classes (and
                // possibly the ownership mark) change
                let merged = watchmask.bits();
                let updated = table.write()?.update_path(&path, |watch| {
                    watch.flags = merged;
                    watch.added_by_user = watch.added_by_user || added_by_user;
                    watch.recurse = watch.recurse || is_recursive;
                });
                if updated {
                    return Ok(());
                }
                // a concurrent removal emptied the slot; fall through and
                // record the registration we just made
            }

            let is_dir = match metadata(&path) {
                Ok(stat) => stat.is_dir(),
                Err(e) => {
                    // Avoid leaking an inotify watch if we can't stat after
                    // adding it. This can happen due to racy deletions.
                    let _ = kernel.remove(wd);
                    return Err(Error::io(e).add_path(path));
                }
            };

            let mut watch = Watch::new(path, wd)
                .flags(watchmask.bits())
                .dir(is_dir)
                .recursive(is_recursive);
            if !added_by_user {
                watch = watch.internal();
            }
            table.write()?.insert(watch);
            Ok(())
        }
    }
}

/// Removes the watch for `path` (and descendants for recursive roots) from
/// the table and the kernel.
fn deregister(
    kernel: &mut Watches,
    table: &SharedWatches,
    path: &Path,
    remove_recursive: bool,
) -> Result<()> {
    let removed = table.write()?.remove_path(path, remove_recursive);
    if removed.is_empty() {
        return Err(Error::non_existent_watch().add_path(path.to_path_buf()));
    }

    log::trace!(
        "removing inotify watch for {path:?}, remove_recursive: {remove_recursive:?}"
    );
    for watch in removed {
        // The descriptor may already be invalid when the kernel tore the
        // watch down on its own (delete, unmount); there is nothing useful
        // to do with the error either way.
        if let Err(err) = kernel.remove(watch.descriptor) {
            log::info!("unable to remove watch descriptor from inotify: {err:?}");
        }
    }
    Ok(())
}

/// Implements `add`: a single registration, or a walk of the whole tree for
/// a recursive root.
fn add_watch(
    kernel: &mut Watches,
    table: &SharedWatches,
    event_tx: &EventTx,
    path: PathBuf,
    is_recursive: bool,
    options: &Options,
) -> Result<()> {
    let stat = if options.no_follow() {
        std::fs::symlink_metadata(&path)
    } else {
        metadata(&path)
    };
    let stat = stat.map_err(|e| Error::io(e).add_path(path.clone()))?;

    let mut mask = op_to_watch_mask(options.op_mask().unwrap_or(Op::PORTABLE));
    if options.no_follow() {
        mask |= WatchMask::DONT_FOLLOW;
    }

    // If the watch is not recursive, or if we determine (by stat'ing the
    // path to get its metadata) that the watched path is not a directory,
    // add a single path watch.
    if !is_recursive || !stat.is_dir() {
        register(kernel, table, path.clone(), mask, false, true)?;
        if stat.file_type().is_symlink() {
            // only reachable with no_follow: the registration covers the
            // link itself, remember what it pointed at
            let target = std::fs::read_link(&path).ok();
            table.write()?.update_path(&path, move |watch| {
                watch.is_link = true;
                watch.link_target = target;
            });
        }
        return Ok(());
    }

    for entry in WalkDir::new(&path)
        .follow_links(!options.no_follow())
        .into_iter()
        .filter_map(filter_dir)
    {
        let entry_path = entry.into_path();
        let is_root = entry_path == path;
        match register(kernel, table, entry_path.clone(), mask, true, is_root) {
            Ok(()) => {
                if !is_root && options.create_on_recursive_add() {
                    event_tx.send(Event::new(entry_path, Op::CREATE));
                }
            }
            // A subdirectory can disappear between walkdir listing it and
            // us adding a watch for it. This should not fail the overall
            // recursive watch call.
            Err(err) if !is_root && is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

// The EventLoop will set up a mio::Poll and use it to wait for the following:
//
// -  a shutdown request from the facade
//
// -  events telling it that something has happened on one of the watched files.
struct EventLoop {
    running: bool,
    poll: mio::Poll,
    event_loop_rx: Receiver<EventLoopMsg>,
    inotify: Option<Inotify>,
    kernel: Watches,
    event_tx: EventTx,
    watches: SharedWatches,
    cookies: CookieRing,
    shutdown_ack: Option<Sender<()>>,
}

/// Backend implementation based on inotify
pub(crate) struct InotifyBackend {
    kernel: Mutex<Watches>,
    /// Caller-side sender for synthetic events during recursive adds.
    /// Dropped by `shutdown`: the channels only close once every sender is
    /// gone, and the reader's copy must not be the only one accounted for.
    event_tx: Mutex<Option<EventTx>>,
    channel: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
    watches: SharedWatches,
}

enum EventLoopMsg {
    Shutdown { tx: Sender<()> },
}

impl EventLoop {
    fn new(
        mut inotify: Inotify,
        event_tx: EventTx,
        watches: SharedWatches,
    ) -> Result<(Self, Arc<mio::Waker>, Sender<EventLoopMsg>)> {
        let (event_loop_tx, event_loop_rx) = unbounded::<EventLoopMsg>();
        let poll = mio::Poll::new().map_err(Error::io)?;

        let waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE).map_err(Error::io)?);

        let inotify_fd = inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        poll.registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)
            .map_err(Error::io)?;

        let kernel = inotify.watches();
        let event_loop = EventLoop {
            running: true,
            poll,
            event_loop_rx,
            inotify: Some(inotify),
            kernel,
            event_tx,
            watches,
            cookies: CookieRing::new(),
            shutdown_ack: None,
        };
        Ok((event_loop, waker, event_loop_tx))
    }

    // Run the event loop.
    fn run(self) {
        let _ = thread::Builder::new()
            .name("watchfs inotify loop".to_string())
            .spawn(|| self.event_loop_thread());
    }

    fn event_loop_thread(mut self) {
        let mut events = mio::Events::with_capacity(16);
        while self.running {
            // Wait for something to happen.
            match self.poll.poll(&mut events, None) {
                Err(ref e) if matches!(e.kind(), std::io::ErrorKind::Interrupted) => {
                    // System call was interrupted, we will retry
                    continue;
                }
                Err(e) => {
                    // the kernel primitive is gone; exit and let the
                    // channels close
                    self.event_tx.error(Error::io(e));
                    break;
                }
                Ok(()) => {}
            }

            // Process whatever happened.
            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    INOTIFY => self.handle_inotify(),
                    _ => unreachable!(),
                }
            }
        }

        // Close the caller-facing channels (events before errors, per the
        // EventTx field order), then acknowledge the shutdown.
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
                EventLoopMsg::Shutdown { tx } => {
                    self.remove_all_watches();
                    if let Some(inotify) = self.inotify.take() {
                        let _ = inotify.close();
                    }
                    self.shutdown_ack = Some(tx);
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_inotify(&mut self) {
        let mut add_watches: Vec<(PathBuf, WatchMask)> = Vec::new();
        let mut remove_watches: Vec<PathBuf> = Vec::new();
        let mut remove_no_syscall: Vec<PathBuf> = Vec::new();

        if let Some(ref mut inotify) = self.inotify {
            let mut buffer = [0; 4096];
            // Read all buffers available.
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        let mut num_events = 0;
                        for raw in events {
                            log::trace!("inotify event: {raw:?}");
                            num_events += 1;

                            if raw.mask.contains(EventMask::Q_OVERFLOW) {
                                // the kernel dropped events on the floor
                                self.event_tx.error(Error::event_overflow());
                                continue;
                            }

                            if raw.mask.contains(EventMask::IGNORED) {
                                // kernel-side watch is gone, nothing to
                                // report; drop our record of the descriptor
                                if let Ok(mut table) = self.watches.write() {
                                    table.remove_wd(&raw.wd);
                                }
                                continue;
                            }

                            let path = {
                                let table = match self.watches.read() {
                                    Ok(table) => table,
                                    Err(_) => return,
                                };
                                match table.by_wd(&raw.wd) {
                                    Some(watch) => match raw.name {
                                        Some(name) => watch.path.join(name),
                                        None => watch.path.clone(),
                                    },
                                    None => {
                                        log::debug!(
                                            "inotify event with unknown descriptor: {raw:?}"
                                        );
                                        continue;
                                    }
                                }
                            };

                            let mut op = Op::empty();
                            let mut renamed_from = None;
                            let mut suppress = false;

                            if raw.mask.contains(EventMask::MOVED_FROM) {
                                op |= Op::RENAME;
                                self.cookies.push(raw.cookie, path.clone());
                            }
                            if raw.mask.contains(EventMask::MOVED_TO) {
                                op |= Op::CREATE;
                                renamed_from = self.cookies.take(raw.cookie);

                                if raw.mask.contains(EventMask::ISDIR) {
                                    if let Some(flags) =
                                        recursive_parent_flags(&self.watches, &path)
                                    {
                                        // a directory moved within the tree
                                        // keeps its registrations; only the
                                        // stored names are stale
                                        let rewritten = match &renamed_from {
                                            Some(old) => {
                                                rewrite_subtree(&self.watches, old, &path)
                                            }
                                            None => false,
                                        };
                                        if !rewritten {
                                            add_watches.push((path.clone(), flags));
                                        }
                                    }
                                }
                            }
                            if raw.mask.contains(EventMask::MOVE_SELF) {
                                op |= Op::RENAME;
                                // the kernel gives us no new path, so a
                                // plain watch cannot be followed; recursive
                                // members are rewritten via the parent's
                                // MOVED_TO instead
                                let (recursive, parent_watched) =
                                    watch_state(&self.watches, &path);
                                if !recursive {
                                    remove_watches.push(path.clone());
                                }
                                suppress = suppress || parent_watched;
                            }
                            if raw.mask.contains(EventMask::CREATE) {
                                op |= Op::CREATE;
                                if raw.mask.contains(EventMask::ISDIR) {
                                    if let Some(flags) =
                                        recursive_parent_flags(&self.watches, &path)
                                    {
                                        add_watches.push((path.clone(), flags));
                                    }
                                }
                            }
                            if raw.mask.contains(EventMask::DELETE) {
                                op |= Op::REMOVE;
                                let watched = self
                                    .watches
                                    .read()
                                    .map_or(false, |table| table.contains_path(&path));
                                if watched {
                                    remove_watches.push(path.clone());
                                }
                            }
                            if raw.mask.contains(EventMask::DELETE_SELF) {
                                op |= Op::REMOVE;
                                remove_watches.push(path.clone());
                                // the parent watch reports the child's
                                // removal; a second Remove from the self
                                // watch would be a duplicate
                                let (_, parent_watched) = watch_state(&self.watches, &path);
                                suppress = suppress || parent_watched;
                            }
                            if raw.mask.contains(EventMask::UNMOUNT) {
                                op |= Op::REMOVE;
                                // the kernel already dropped the watch and
                                // will emit IGNORED; no inotify_rm_watch
                                remove_no_syscall.push(path.clone());
                            }
                            if raw.mask.contains(EventMask::MODIFY) {
                                op |= Op::WRITE;
                            }
                            if raw.mask.contains(EventMask::ATTRIB) {
                                op |= Op::CHMOD;
                            }
                            if raw.mask.contains(EventMask::OPEN) {
                                op |= Op::OPEN;
                            }
                            if raw.mask.contains(EventMask::ACCESS) {
                                op |= Op::READ;
                            }
                            if raw.mask.contains(EventMask::CLOSE_WRITE) {
                                op |= Op::CLOSE_WRITE;
                            }
                            if raw.mask.contains(EventMask::CLOSE_NOWRITE) {
                                op |= Op::CLOSE_READ;
                            }

                            if !op.is_empty() && !suppress {
                                if !self.event_tx.send(Event::renamed(path, op, renamed_from)) {
                                    return;
                                }
                            }
                        }

                        // All events read. Break out.
                        if num_events == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // No events read. Break out.
                        break;
                    }
                    Err(e) => {
                        self.event_tx.error(Error::io(e));
                        break;
                    }
                }
            }
        }

        for path in remove_no_syscall {
            if let Ok(mut table) = self.watches.write() {
                table.remove_path(&path, true);
            }
        }

        for path in remove_watches {
            // the watch may already be gone (kernel teardown raced us)
            let _ = deregister(&mut self.kernel, &self.watches, &path, true);
        }

        for (path, flags) in add_watches {
            // a directory created or moved into a recursive root inherits
            // the root's flags
            if let Err(err) = register(&mut self.kernel, &self.watches, path, flags, true, false)
            {
                // ENOSPC means the inotify watch limit is reached; the
                // recursive watch is silently incomplete from here on, so
                // the caller must hear about it
                let limit_reached = matches!(
                    &err.kind,
                    ErrorKind::Io(e) if e.raw_os_error() == Some(libc::ENOSPC)
                );
                if limit_reached {
                    self.event_tx.error(err);
                    break;
                }
            }
        }
    }

    fn remove_all_watches(&mut self) {
        let drained = match self.watches.write() {
            Ok(mut table) => table.drain(),
            Err(_) => return,
        };
        for watch in drained {
            if let Err(err) = self.kernel.remove(watch.descriptor) {
                log::info!("unable to remove watch descriptor from inotify: {err:?}");
            }
        }
    }
}

impl InotifyBackend {
    pub fn create(event_tx: EventTx) -> Result<Self> {
        let mut inotify = Inotify::init().map_err(Error::io)?;
        let kernel = inotify.watches();
        let watches: SharedWatches = Arc::new(RwLock::new(WatchTable::new()));
        let (event_loop, waker, channel) =
            EventLoop::new(inotify, event_tx.clone(), watches.clone())?;
        event_loop.run();
        Ok(InotifyBackend {
            kernel: Mutex::new(kernel),
            event_tx: Mutex::new(Some(event_tx)),
            channel,
            waker,
            watches,
        })
    }
}

impl Backend for InotifyBackend {
    fn add(&self, path: PathBuf, recursive: bool, options: Options) -> Result<()> {
        let mut kernel = self.kernel.lock()?;
        let event_tx = self.event_tx.lock()?;
        let Some(event_tx) = event_tx.as_ref() else {
            return Err(Error::closed());
        };
        add_watch(
            &mut kernel,
            &self.watches,
            event_tx,
            path,
            recursive,
            &options,
        )
    }

    fn remove(&self, path: PathBuf, recursive: bool) -> Result<()> {
        let mut kernel = self.kernel.lock()?;
        deregister(&mut kernel, &self.watches, &path, recursive)
    }

    fn watch_list(&self) -> Vec<PathBuf> {
        self.watches
            .read()
            .map(|table| table.paths(true))
            .unwrap_or_default()
    }

    fn shutdown(&self) -> Result<()> {
        // give up our own sender first; the reader's copy is then the last
        drop(self.event_tx.lock()?.take());

        let (tx, rx) = unbounded();
        if self
            .channel
            .send(EventLoopMsg::Shutdown { tx })
            .is_err()
        {
            // the loop already exited (fatal read error); channels are closed
            return Ok(());
        }
        self.waker.wake().map_err(Error::io)?;
        // the ack arrives only after the loop dropped the event channels
        let _ = rx.recv();
        Ok(())
    }
}
