//! Backend implementation for Solaris/illumos file event notifications
//!
//! Event ports are a one-shot mechanism: every delivered event dissociates
//! the file from the port, so the loop has to re-associate after each event
//! it wants to keep observing. Association is keyed by a `file_obj` whose
//! timestamps must match the file's current state, and whose name pointer
//! must stay valid for the lifetime of the association; the allocations are
//! therefore pinned in boxes owned by the loop.
//!
//! A `FILE_RENAME_TO` event names the *new* path of whatever was moved over
//! the watched name, so it is reported as `REMOVE` rather than `RENAME`;
//! a `RENAME` there would point at the wrong end of the move.

use crate::config::Options;
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::watches::{Watch, WatchTable};
use crate::{Backend, EventTx};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use libc::{c_int, c_void, PORT_SOURCE_FILE, PORT_SOURCE_USER};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, RwLock};
use std::thread;

// not all FEN bits have libc definitions
const UNMOUNTED: c_int = 0x2000_0000;
const MOUNTEDOVER: c_int = 0x4000_0000;

/// Events armed on every association.
fn file_events() -> c_int {
    libc::FILE_MODIFIED | libc::FILE_ATTRIB | libc::FILE_DELETE | libc::FILE_RENAME_TO
        | libc::FILE_RENAME_FROM
}

const PERM_MASK: u32 = 0o7777;

/// One pinned association. `file_obj.fo_name` points into `name`, so the
/// struct must never move while associated; it lives in a `Box` owned by
/// the event loop and is addressed by the `file_obj` pointer the port hands
/// back as the event cookie.
struct FenWatch {
    file_obj: libc::file_obj,
    name: CString,
    path: PathBuf,
    /// Permission bits at (re-)association time; `FILE_ATTRIB` is reported
    /// as `CHMOD` only when these actually changed.
    mode: u32,
    is_dir: bool,
}

struct EventLoop {
    port: c_int,
    event_loop_rx: Receiver<EventLoopMsg>,
    event_tx: EventTx,
    watches: Arc<RwLock<WatchTable<usize>>>,
    objects: HashMap<usize, Box<FenWatch>>,
    /// Directory entries noticed but not associated (subdirectories,
    /// unreadable children); rescans must not keep reporting them.
    seen: HashSet<PathBuf>,
}

/// Backend implementation based on event ports
pub(crate) struct FenBackend {
    channel: Sender<EventLoopMsg>,
    port: c_int,
    watches: Arc<RwLock<WatchTable<usize>>>,
}

enum EventLoopMsg {
    Add {
        path: PathBuf,
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

fn cstring_of(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::generic("path contains an interior NUL byte"))
}

fn timespec(secs: i64, nanos: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as libc::c_long,
    }
}

impl EventLoop {
    fn run(self) {
        let _ = thread::Builder::new()
            .name("watchfs fen loop".to_string())
            .spawn(|| self.event_loop_thread());
    }

    fn event_loop_thread(mut self) {
        let mut shutdown_ack = None;

        'outer: loop {
            let mut pe: libc::port_event = unsafe { mem::zeroed() };
            let rc = unsafe { libc::port_get(self.port, &mut pe, ptr::null_mut()) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // port is gone; nothing left to read
                self.event_tx.error(Error::io(err));
                break;
            }

            match pe.portev_source as c_int {
                PORT_SOURCE_USER => loop {
                    match self.event_loop_rx.try_recv() {
                        Ok(EventLoopMsg::Add { path, tx }) => {
                            let _ = tx.send(self.add_watch(path, true));
                        }
                        Ok(EventLoopMsg::Remove { path, tx }) => {
                            let _ = tx.send(self.remove_watch(path));
                        }
                        Ok(EventLoopMsg::Shutdown { tx }) => {
                            shutdown_ack = Some(tx);
                            break 'outer;
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                },
                PORT_SOURCE_FILE => {
                    if !self.handle_file_event(pe.portev_object as usize, pe.portev_events as c_int)
                    {
                        break;
                    }
                }
                other => {
                    log::debug!("unexpected port event source: {other}");
                }
            }
        }

        self.teardown();
        let EventLoop { event_tx, .. } = self;
        drop(event_tx);
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    fn teardown(&mut self) {
        for (_, watch) in self.objects.iter() {
            unsafe {
                libc::port_dissociate(
                    self.port,
                    PORT_SOURCE_FILE,
                    &watch.file_obj as *const _ as usize,
                );
            }
        }
        self.objects.clear();
        if let Ok(mut table) = self.watches.write() {
            table.drain();
        }
        unsafe {
            libc::close(self.port);
        }
    }

    /// Handles one file event. Returns false when shutting down.
    fn handle_file_event(&mut self, descriptor: usize, events: c_int) -> bool {
        let (path, is_dir, old_mode) = match self.objects.get(&descriptor) {
            Some(watch) => (watch.path.clone(), watch.is_dir, watch.mode),
            None => {
                log::debug!("port event for unknown object: {descriptor:#x}");
                return true;
            }
        };
        log::trace!("fen event on {}: {events:#x}", path.display());

        // exceptional events end the association for good
        if events & libc::FILE_DELETE != 0 {
            self.drop_watch(descriptor, &path);
            return self.event_tx.send(Event::new(path, Op::REMOVE));
        }
        if events & libc::FILE_RENAME_FROM != 0 {
            self.drop_watch(descriptor, &path);
            return self.event_tx.send(Event::new(path, Op::RENAME));
        }
        if events & (libc::FILE_RENAME_TO | UNMOUNTED | MOUNTEDOVER) != 0 {
            self.drop_watch(descriptor, &path);
            return self.event_tx.send(Event::new(path, Op::REMOVE));
        }

        let mut op = Op::empty();
        if events & libc::FILE_MODIFIED != 0 {
            if is_dir {
                if !self.rescan_directory(&path) {
                    return false;
                }
            } else {
                op |= Op::WRITE;
            }
        }
        if events & libc::FILE_ATTRIB != 0 {
            match std::fs::metadata(&path) {
                Ok(stat) if stat.mode() & PERM_MASK != old_mode & PERM_MASK => {
                    op |= Op::CHMOD;
                }
                _ => {}
            }
        }

        if !op.is_empty() && !self.event_tx.send(Event::new(path.clone(), op)) {
            return false;
        }

        // one-shot model: whatever we still care about must be re-armed
        if let Err(err) = self.reassociate(descriptor) {
            let gone = matches!(
                &err.kind,
                crate::ErrorKind::Io(e) if e.kind() == std::io::ErrorKind::NotFound
            );
            self.drop_watch(descriptor, &path);
            if gone {
                return self.event_tx.send(Event::new(path, Op::REMOVE));
            }
            self.event_tx.error(err.add_path(path));
        }
        true
    }

    /// Emits `CREATE` for directory entries seen for the first time and
    /// associates the new non-directory children. Returns false when
    /// shutting down.
    fn rescan_directory(&mut self, dir: &Path) -> bool {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return true,
        };
        for entry in entries.filter_map(std::result::Result::ok) {
            let child = entry.path();
            let known = self.seen.contains(&child)
                || self
                    .watches
                    .read()
                    .map_or(true, |table| table.contains_path(&child));
            if known {
                continue;
            }
            if !self.event_tx.send(Event::new(child.clone(), Op::CREATE)) {
                return false;
            }
            if let Err(err) = self.add_child_watch(&child) {
                log::debug!("unable to associate new child {}: {err}", child.display());
            }
        }
        true
    }

    fn add_watch(&mut self, path: PathBuf, added_by_user: bool) -> Result<()> {
        let stat = std::fs::metadata(&path).map_err(|e| Error::io(e).add_path(path.clone()))?;

        if self.watches.read()?.contains_path(&path) {
            return Ok(());
        }

        let descriptor = self.associate_new(&path, &stat)?;
        {
            let mut table = self.watches.write()?;
            let mut watch = Watch::new(path.clone(), descriptor)
                .flags(file_events() as u32)
                .dir(stat.is_dir());
            if !added_by_user {
                watch = watch.internal();
            }
            table.insert(watch);
        }

        if stat.is_dir() {
            if let Ok(entries) = std::fs::read_dir(&path) {
                for entry in entries.filter_map(std::result::Result::ok) {
                    let child = entry.path();
                    if let Err(err) = self.add_child_watch(&child) {
                        log::debug!("skipping child {}: {err}", child.display());
                    }
                }
            }
        }
        Ok(())
    }

    /// Directories found during scans are only noted as seen; association
    /// is for the directory the user watches and its non-directory children.
    fn add_child_watch(&mut self, child: &Path) -> Result<()> {
        if self.seen.contains(child) || self.watches.read()?.contains_path(child) {
            return Ok(());
        }
        match std::fs::metadata(child) {
            Ok(stat) if !stat.is_dir() => {
                let descriptor = self.associate_new(child, &stat)?;
                self.watches.write()?.insert(
                    Watch::new(child.to_path_buf(), descriptor)
                        .flags(file_events() as u32)
                        .internal(),
                );
            }
            _ => {
                self.seen.insert(child.to_path_buf());
            }
        }
        Ok(())
    }

    /// Builds the pinned `file_obj` and associates it; returns the
    /// descriptor (the object's address).
    fn associate_new(&mut self, path: &Path, stat: &std::fs::Metadata) -> Result<usize> {
        let mut watch = Box::new(FenWatch {
            file_obj: unsafe { mem::zeroed() },
            name: cstring_of(path)?,
            path: path.to_path_buf(),
            mode: stat.mode(),
            is_dir: stat.is_dir(),
        });
        watch.file_obj.fo_name = watch.name.as_ptr() as *mut libc::c_char;
        fill_times(&mut watch.file_obj, stat);

        let descriptor = &watch.file_obj as *const _ as usize;
        let rc = unsafe {
            libc::port_associate(
                self.port,
                PORT_SOURCE_FILE,
                descriptor,
                file_events(),
                ptr::null_mut::<c_void>(),
            )
        };
        if rc < 0 {
            return Err(Error::io(std::io::Error::last_os_error()).add_path(path.to_path_buf()));
        }
        self.objects.insert(descriptor, watch);
        Ok(descriptor)
    }

    /// Refreshes the stored timestamps and mode, then re-arms the one-shot
    /// association.
    fn reassociate(&mut self, descriptor: usize) -> Result<()> {
        let watch = self
            .objects
            .get_mut(&descriptor)
            .ok_or_else(Error::non_existent_watch)?;
        let stat = std::fs::metadata(&watch.path).map_err(Error::io)?;
        fill_times(&mut watch.file_obj, &stat);
        watch.mode = stat.mode();

        let rc = unsafe {
            libc::port_associate(
                self.port,
                PORT_SOURCE_FILE,
                descriptor,
                file_events(),
                ptr::null_mut::<c_void>(),
            )
        };
        if rc < 0 {
            return Err(Error::io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Forgets a watch whose event already ended the association.
    fn drop_watch(&mut self, descriptor: usize, path: &Path) {
        self.objects.remove(&descriptor);
        if let Ok(mut table) = self.watches.write() {
            table.remove_path(path, false);
        }
    }

    fn remove_watch(&mut self, path: PathBuf) -> Result<()> {
        let removed = self.watches.write()?.remove_path(&path, true);
        if removed.is_empty() {
            return Err(Error::non_existent_watch().add_path(path));
        }
        for watch in removed {
            if let Some(pinned) = self.objects.remove(&watch.descriptor) {
                unsafe {
                    libc::port_dissociate(
                        self.port,
                        PORT_SOURCE_FILE,
                        &pinned.file_obj as *const _ as usize,
                    );
                }
            }
        }
        self.seen.retain(|p| !p.starts_with(&path));
        Ok(())
    }
}

fn fill_times(file_obj: &mut libc::file_obj, stat: &std::fs::Metadata) {
    file_obj.fo_atime = timespec(stat.atime(), stat.atime_nsec());
    file_obj.fo_mtime = timespec(stat.mtime(), stat.mtime_nsec());
    file_obj.fo_ctime = timespec(stat.ctime(), stat.ctime_nsec());
}

impl FenBackend {
    pub fn create(event_tx: EventTx) -> Result<Self> {
        let port = unsafe { libc::port_create() };
        if port < 0 {
            return Err(Error::io(std::io::Error::last_os_error()));
        }

        let (channel, event_loop_rx) = unbounded();
        let watches = Arc::new(RwLock::new(WatchTable::new()));
        let event_loop = EventLoop {
            port,
            event_loop_rx,
            event_tx,
            watches: watches.clone(),
            objects: HashMap::new(),
            seen: HashSet::new(),
        };
        event_loop.run();

        Ok(FenBackend {
            channel,
            port,
            watches,
        })
    }

    fn wake(&self) {
        unsafe {
            libc::port_send(self.port, 0, ptr::null_mut());
        }
    }
}

impl Backend for FenBackend {
    fn add(&self, path: PathBuf, recursive: bool, _options: Options) -> Result<()> {
        if recursive {
            return Err(Error::unsupported("recursive watch").add_path(path));
        }
        let (tx, rx) = unbounded();
        self.channel
            .send(EventLoopMsg::Add { path, tx })
            .map_err(|_| Error::closed())?;
        self.wake();
        rx.recv().unwrap_or(Err(Error::closed()))
    }

    fn remove(&self, path: PathBuf, _recursive: bool) -> Result<()> {
        let (tx, rx) = unbounded();
        self.channel
            .send(EventLoopMsg::Remove { path, tx })
            .map_err(|_| Error::closed())?;
        self.wake();
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
        if self.channel.send(EventLoopMsg::Shutdown { tx }).is_err() {
            return Ok(());
        }
        self.wake();
        let _ = rx.recv();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_events_match_the_event_model() {
        let events = file_events();
        assert_ne!(events & libc::FILE_MODIFIED, 0);
        assert_ne!(events & libc::FILE_ATTRIB, 0);
        assert_ne!(events & libc::FILE_DELETE, 0);
        assert_ne!(events & libc::FILE_RENAME_TO, 0);
        assert_ne!(events & libc::FILE_RENAME_FROM, 0);
        // plain reads never wake the port
        assert_eq!(events & libc::FILE_ACCESS, 0);
    }

    #[test]
    fn timespec_keeps_nanosecond_precision() {
        let ts = timespec(7, 123_456_789);
        assert_eq!(ts.tv_sec, 7);
        assert_eq!(ts.tv_nsec, 123_456_789);
    }

    #[test]
    fn permission_mask_drops_file_type_bits() {
        let mode = (libc::S_IFREG | 0o640) as u32;
        assert_eq!(mode & PERM_MASK, 0o640);
    }

    #[test]
    fn paths_with_interior_nul_are_rejected() {
        let bad = Path::new(std::ffi::OsStr::from_bytes(b"/tmp/\0bad"));
        assert!(cstring_of(bad).is_err());
        assert!(cstring_of(Path::new("/tmp/fine")).is_ok());
    }
}
