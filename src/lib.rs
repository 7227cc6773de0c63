//! Cross-platform filesystem change notification library.
//!
//! A [`Watcher`] delivers a stream of [`Event`]s describing modifications to
//! a set of watched paths: files and directories created, written, removed,
//! renamed, or having their attributes changed. One uniform event model is
//! synthesised on top of four kernel mechanisms (inotify on Linux, kqueue
//! on BSD and macOS, `ReadDirectoryChangesW` on Windows, event ports on
//! Solaris/illumos) plus a polling fallback for everything else.
//!
//! ```no_run
//! use watchfs::Watcher;
//!
//! fn main() -> watchfs::Result<()> {
//!     let watcher = Watcher::new_buffered(64)?;
//!     watcher.add("/tmp")?;
//!
//!     for event in watcher.events() {
//!         println!("{event}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Watching directories
//!
//! Watching a directory reports events for the directory itself and its
//! direct children. A path whose final segment is the literal `...`
//! requests recursive registration of the whole subtree; this is supported
//! on the inotify backend and returns
//! [`ErrorKind::Unsupported`] elsewhere.
//!
//! # Delivery
//!
//! Events arrive on [`Watcher::events`], asynchronous errors (queue
//! overflows, read failures) on [`Watcher::errors`]. With [`Watcher::new`]
//! both channels are rendezvous channels and the internal reader blocks
//! until the caller receives; [`Watcher::new_buffered`] absorbs short
//! bursts. After [`Watcher::close`] returns, no further items are
//! delivered and both channels are closed, events before errors.
//!
//! # Caveats
//!
//! Network filesystems and pseudo-filesystems (`/proc`, `/sys`) generally
//! do not emit change events; use [`Watcher::new_polling`] for those.
//! Exact event sequences differ between kernels; the `Op` vocabulary is
//! uniform, the sequencing is best-effort per backend.

#![deny(missing_docs)]

pub use config::{Options, DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, Op};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use std::env;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

mod config;
mod error;
mod event;
mod watches;

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod fen;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;
#[cfg(target_os = "windows")]
mod windows;

/// Tick interval used when polling is the only available backend.
#[allow(dead_code)]
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Path segment requesting recursive registration, as in `watch("/srv/...")`.
const RECURSIVE_SEGMENT: &str = "...";

/// The reader-side handle onto the caller-facing channels.
///
/// Sends are cancellable: `close` drops the other end of `cancel`, which
/// makes every blocked or future send return immediately instead of
/// stalling the reader against an unconsumed rendezvous channel.
///
/// Field order is load-bearing for shutdown: dropping an `EventTx` closes
/// the events channel before the errors channel.
#[derive(Clone)]
pub(crate) struct EventTx {
    events: Sender<Event>,
    errors: Sender<Error>,
    cancel: Receiver<()>,
}

impl EventTx {
    /// Delivers an event; false means the watcher is shutting down and the
    /// reader should stop producing.
    pub(crate) fn send(&self, event: Event) -> bool {
        log::trace!("delivering event: {event}");
        select! {
            send(self.events, event) -> res => res.is_ok(),
            recv(self.cancel) -> _ => false,
        }
    }

    /// Delivers an asynchronous error; false means shutdown.
    pub(crate) fn error(&self, error: Error) -> bool {
        select! {
            send(self.errors, error) -> res => res.is_ok(),
            recv(self.cancel) -> _ => false,
        }
    }

    /// True once `close` has begun; used by loops that emit in phases.
    pub(crate) fn cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// One platform-specific implementation of the watch set.
///
/// Exactly one backend is compiled per target. All methods are called with
/// cleaned absolute paths.
pub(crate) trait Backend: Send + Sync {
    fn add(&self, path: PathBuf, recursive: bool, options: Options) -> Result<()>;
    fn remove(&self, path: PathBuf, recursive: bool) -> Result<()>;
    fn watch_list(&self) -> Vec<PathBuf>;
    /// Tears down every watch, releases the kernel primitive, and returns
    /// once both caller-facing channels are closed.
    fn shutdown(&self) -> Result<()>;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn native_backend(tx: EventTx) -> Result<Box<dyn Backend>> {
    Ok(Box::new(inotify::InotifyBackend::create(tx)?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn native_backend(tx: EventTx) -> Result<Box<dyn Backend>> {
    Ok(Box::new(kqueue::KqueueBackend::create(tx)?))
}

#[cfg(target_os = "windows")]
fn native_backend(tx: EventTx) -> Result<Box<dyn Backend>> {
    Ok(Box::new(windows::ReadDirectoryChangesBackend::create(tx)?))
}

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
fn native_backend(tx: EventTx) -> Result<Box<dyn Backend>> {
    Ok(Box::new(fen::FenBackend::create(tx)?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "windows",
    target_os = "solaris",
    target_os = "illumos"
)))]
fn native_backend(tx: EventTx) -> Result<Box<dyn Backend>> {
    Ok(Box::new(poll::PollBackend::create(tx, DEFAULT_POLL_INTERVAL)?))
}

/// Watches a set of paths, delivering [`Event`]s on a channel.
///
/// All methods take `&self` and the type is `Send + Sync`, so a `Watcher`
/// can be shared between threads (e.g. in an `Arc`) and closed from any of
/// them.
pub struct Watcher {
    events: Receiver<Event>,
    errors: Receiver<Error>,
    backend: Box<dyn Backend>,
    /// Dropping the sender cancels blocked reader sends; guarded so that
    /// concurrent `close` calls serialise and all return after teardown.
    cancel: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl Watcher {
    /// Creates a watcher with the best backend for this platform and
    /// rendezvous (unbuffered) channels.
    pub fn new() -> Result<Watcher> {
        Self::build(0, None)
    }

    /// Creates a watcher whose events channel buffers up to `capacity`
    /// items, so short bursts do not stall the internal reader.
    pub fn new_buffered(capacity: usize) -> Result<Watcher> {
        Self::build(capacity, None)
    }

    /// Creates a watcher that polls the watched paths every `interval`
    /// instead of using the platform's native notifications. Useful for
    /// network filesystems and pseudo-filesystems.
    pub fn new_polling(interval: Duration) -> Result<Watcher> {
        Self::build(0, Some(interval))
    }

    /// [`new_polling`](Watcher::new_polling) with a buffered events channel.
    pub fn new_polling_buffered(interval: Duration, capacity: usize) -> Result<Watcher> {
        Self::build(capacity, Some(interval))
    }

    fn build(capacity: usize, poll_interval: Option<Duration>) -> Result<Watcher> {
        let (event_tx, events) = bounded(capacity);
        // Always at least one slot, so an overflow report cannot wedge the
        // reader against an unconsumed rendezvous channel.
        let (error_tx, errors) = bounded(capacity.max(1));
        let (cancel_tx, cancel_rx) = unbounded();

        let tx = EventTx {
            events: event_tx,
            errors: error_tx,
            cancel: cancel_rx,
        };

        let backend = match poll_interval {
            Some(interval) => {
                Box::new(poll::PollBackend::create(tx, interval)?) as Box<dyn Backend>
            }
            None => native_backend(tx)?,
        };

        Ok(Watcher {
            events,
            errors,
            backend,
            cancel: Mutex::new(Some(cancel_tx)),
            closed: AtomicBool::new(false),
        })
    }

    /// The event stream. Closed once [`close`](Watcher::close) completes.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Asynchronous errors from the reader (event loss, read failures).
    /// Closed once [`close`](Watcher::close) completes, after `events`.
    pub fn errors(&self) -> &Receiver<Error> {
        &self.errors
    }

    /// Starts watching `path` with default [`Options`].
    ///
    /// Adding the same (cleaned) path twice is a no-op returning success.
    /// The path must exist and be readable; failures preserve the platform
    /// error code. After [`close`](Watcher::close) this returns
    /// [`ErrorKind::Closed`].
    pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        self.add_with(path, Options::default())
    }

    /// Starts watching `path` with explicit [`Options`].
    pub fn add_with(&self, path: impl AsRef<Path>, options: Options) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed());
        }
        let (path, recursive) = recursive_request(clean_path(path.as_ref())?);
        self.backend.add(path, recursive, options)
    }

    /// Stops watching `path`.
    ///
    /// Returns [`ErrorKind::NonExistentWatch`] if the path was never added
    /// or its watch has already gone away. After
    /// [`close`](Watcher::close), removal is part of teardown and this
    /// returns success.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (path, recursive) = recursive_request(clean_path(path.as_ref())?);
        self.backend.remove(path, recursive)
    }

    /// The paths added by the user that are still being watched.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.backend.watch_list()
    }

    /// Stops the watcher: unblocks and terminates the reader, releases all
    /// kernel resources, and closes the events channel, then the errors
    /// channel.
    ///
    /// Idempotent and safe to call concurrently from any thread; every
    /// call returns only after teardown has completed.
    pub fn close(&self) -> Result<()> {
        let mut cancel = self.cancel.lock()?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Unblock any reader stuck sending into a full channel first, or
        // the shutdown handshake below could never be picked up.
        drop(cancel.take());
        self.backend.shutdown()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Makes `path` absolute and lexically resolves `.`, `..` and trailing
/// separators. Equality throughout the crate is on this cleaned form; no
/// filesystem access happens here.
fn clean_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_owned()
    } else {
        env::current_dir().map_err(Error::io)?.join(path)
    };

    let mut clean = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }
    Ok(clean)
}

/// Splits off the trailing `...` segment marking a recursive registration.
fn recursive_request(path: PathBuf) -> (PathBuf, bool) {
    if path.file_name() == Some(OsStr::new(RECURSIVE_SEGMENT)) {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(path.clone());
        (parent, true)
    } else {
        (path, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Watcher>();
    }

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(
            clean_path(Path::new("/a/b/../c/./d/")).unwrap(),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(clean_path(Path::new("/a//b")).unwrap(), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("/..")).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn clean_path_absolutises_relative_input() {
        let cleaned = clean_path(Path::new("some/dir")).unwrap();
        assert!(cleaned.is_absolute());
        assert!(cleaned.ends_with("some/dir"));
    }

    #[test]
    fn recursive_segment_is_detected() {
        let (path, recursive) = recursive_request(PathBuf::from("/srv/..."));
        assert_eq!(path, PathBuf::from("/srv"));
        assert!(recursive);

        let (path, recursive) = recursive_request(PathBuf::from("/srv/data"));
        assert_eq!(path, PathBuf::from("/srv/data"));
        assert!(!recursive);
    }

    #[test]
    fn cancelled_sender_aborts_sends() {
        let (event_tx, events) = bounded(0);
        let (error_tx, _errors) = bounded(1);
        let (cancel_tx, cancel_rx) = unbounded::<()>();
        let tx = EventTx {
            events: event_tx,
            errors: error_tx,
            cancel: cancel_rx,
        };

        assert!(!tx.cancelled());
        drop(cancel_tx);
        assert!(tx.cancelled());
        // a send into the rendezvous channel would block forever without
        // the cancel path
        assert!(!tx.send(Event::new("/x", Op::CREATE)));
        assert!(events.try_recv().is_err());
    }
}
