//! Error types.

use std::path::PathBuf;
use std::{fmt, io};

/// Type alias to use this library's `Error` type in a Result
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to
    /// this type, or for opaque internal errors.
    Generic(String),

    /// I/O errors, from the kernel registration and read paths. The
    /// underlying error preserves the platform error code, so callers can
    /// match on e.g. `EACCES` via [`io::Error::raw_os_error`].
    Io(io::Error),

    /// An operation was attempted after [`close`](crate::Watcher::close).
    Closed,

    /// A remove was requested for a path that was never added, or whose
    /// watch has already gone away.
    NonExistentWatch,

    /// The backend lost events: the inotify queue overflowed, or a Windows
    /// notification buffer was too small for a burst.
    EventOverflow,

    /// An option or operation is not supported on this platform or kernel.
    Unsupported(String),
}

/// Notification error type
#[derive(Debug)]
pub struct Error {
    /// Kind of the error
    pub kind: ErrorKind,
    /// Relevant paths to the error, if any
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new Error with empty paths
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new "closed" error
    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    /// Creates a new "non-existent watch" error
    pub fn non_existent_watch() -> Self {
        Self::new(ErrorKind::NonExistentWatch)
    }

    /// Creates a new "event overflow" error
    pub fn event_overflow() -> Self {
        Self::new(ErrorKind::EventOverflow)
    }

    /// Creates a new "unsupported" error naming the offending operation
    pub fn unsupported(op: &str) -> Self {
        Self::new(ErrorKind::Unsupported(op.into()))
    }

    /// Adds a path to the error
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Adds a list of paths to the error
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::Closed => "watcher is closed".into(),
            ErrorKind::EventOverflow => "event queue overflowed, events were lost".into(),
            ErrorKind::Generic(err) => err.clone(),
            ErrorKind::Io(err) => err.to_string(),
            ErrorKind::NonExistentWatch => "no watch exists for the given path".into(),
            ErrorKind::Unsupported(op) => format!("unsupported on this platform: {op}"),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{error} about {:?}", self.paths)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Error::generic(&format!("internal channel disconnect: {err:?}"))
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        Error::generic(&format!("internal channel disconnect: {err:?}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::generic(&format!("lock poisoned: {err}"))
    }
}
