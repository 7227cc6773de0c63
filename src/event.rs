//! The cross-platform event model: the [`Op`] bitset and the [`Event`] type.

use std::fmt;
use std::path::PathBuf;

bitflags::bitflags! {
    /// The set of operations a single [`Event`] can describe.
    ///
    /// `Op` is a bitset; backends may combine several bits into one event
    /// when the kernel reports them together. The portable bits are
    /// available on every backend, the remaining bits only where the kernel
    /// can produce them (inotify, kqueue).
    pub struct Op: u32 {
        /// A new pathname was created.
        const CREATE = 0b0_0000_0001;
        /// The pathname was written to; this includes truncation.
        const WRITE = 0b0_0000_0010;
        /// The pathname was removed.
        const REMOVE = 0b0_0000_0100;
        /// The pathname was renamed to something else; the new name is
        /// delivered as a separate `CREATE` event.
        const RENAME = 0b0_0000_1000;
        /// Attributes (permissions, timestamps) changed.
        const CHMOD = 0b0_0001_0000;

        /// The file was opened.
        const OPEN = 0b0_0010_0000;
        /// The file was read from.
        const READ = 0b0_0100_0000;
        /// A file opened for writing was closed.
        const CLOSE_WRITE = 0b0_1000_0000;
        /// A file opened read-only was closed.
        const CLOSE_READ = 0b1_0000_0000;

        /// The operations every backend can report.
        const PORTABLE = Self::CREATE.bits | Self::WRITE.bits | Self::REMOVE.bits
            | Self::RENAME.bits | Self::CHMOD.bits;
        /// The operations only some backends can report.
        const UNPORTABLE = Self::OPEN.bits | Self::READ.bits
            | Self::CLOSE_WRITE.bits | Self::CLOSE_READ.bits;
    }
}

impl Op {
    /// Reports whether all bits of `op` are set in `self`.
    ///
    /// `Op::empty().has(x)` is `false` for every non-empty `x`, and
    /// `x.has(x)` is always `true`.
    pub fn has(self, op: Op) -> bool {
        self.contains(op)
    }
}

const OP_NAMES: &[(Op, &str)] = &[
    (Op::CREATE, "CREATE"),
    (Op::WRITE, "WRITE"),
    (Op::REMOVE, "REMOVE"),
    (Op::RENAME, "RENAME"),
    (Op::CHMOD, "CHMOD"),
    (Op::OPEN, "OPEN"),
    (Op::READ, "READ"),
    (Op::CLOSE_WRITE, "CLOSE_WRITE"),
    (Op::CLOSE_READ, "CLOSE_READ"),
];

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (op, name) in OP_NAMES {
            if self.contains(*op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("<none>")?;
        }
        Ok(())
    }
}

/// A single filesystem notification.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Event {
    /// The absolute, cleaned path the event is about.
    pub path: PathBuf,

    /// The operations observed on [`path`](Event::path).
    pub op: Op,

    /// For a `CREATE` completing a rename, the path the object previously
    /// had. Only set when the backend can correlate both halves of the move
    /// (inotify cookies, Windows rename pairs, poll identity matching).
    pub renamed_from: Option<PathBuf>,
}

impl Event {
    /// Creates an event, normalising the op bits.
    ///
    /// A path that is gone has nothing left to write, so `REMOVE` clears a
    /// simultaneous `WRITE`.
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        let mut op = op;
        if op.contains(Op::REMOVE) {
            op.remove(Op::WRITE);
        }
        Event {
            path: path.into(),
            op,
            renamed_from: None,
        }
    }

    /// Creates an event carrying the source path of a completed rename.
    pub fn renamed(path: impl Into<PathBuf>, op: Op, from: Option<PathBuf>) -> Self {
        let mut event = Event::new(path, op);
        event.renamed_from = from;
        event
    }

    /// Reports whether all bits of `op` are set on this event.
    pub fn has(&self, op: Op) -> bool {
        self.op.has(op)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.op, self.path)?;
        if let Some(from) = &self.renamed_from {
            write!(f, " (from {from:?})")?;
        }
        Ok(())
    }
}
