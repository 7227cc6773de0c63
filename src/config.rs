//! Configuration types

use crate::event::Op;

/// Default Windows notification buffer size, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

/// Smallest accepted Windows notification buffer. Below this the kernel
/// cannot fit a single long-name record and every burst overflows.
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Per-watch knobs accepted by [`add_with`](crate::Watcher::add_with).
///
/// Every option is a no-op on backends it does not apply to, except where a
/// value is invalid (a too-small `buffer_size` is rejected on Windows).
///
/// ```rust
/// use watchfs::Options;
/// let options = Options::default()
///     .with_buffer_size(128 * 1024)
///     .with_no_follow(true);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// See [`Options::with_buffer_size`]
    buffer_size: usize,

    /// See [`Options::with_no_follow`]
    no_follow: bool,

    /// See [`Options::with_op_mask`]
    op_mask: Option<Op>,

    /// See [`Options::with_create_on_recursive_add`]
    create_on_recursive_add: bool,
}

impl Options {
    /// For the Windows backend: the size in bytes of the buffer the kernel
    /// fills with change records between reads. Larger buffers survive
    /// bigger bursts without [`EventOverflow`](crate::ErrorKind::EventOverflow).
    ///
    /// Defaults to 64 KiB; values below [`MIN_BUFFER_SIZE`] are rejected.
    /// No-op elsewhere.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Returns current setting
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// For the inotify backend: do not dereference the final symlink of the
    /// watched path when registering, so the link itself is watched rather
    /// than its target. Off by default. No-op elsewhere.
    pub fn with_no_follow(mut self, no_follow: bool) -> Self {
        self.no_follow = no_follow;
        self
    }

    /// Returns current setting
    pub fn no_follow(&self) -> bool {
        self.no_follow
    }

    /// For the inotify backend (advanced): register only for the kernel
    /// event classes corresponding to the given [`Op`] bits, instead of the
    /// full portable set. No-op elsewhere.
    pub fn with_op_mask(mut self, op_mask: Op) -> Self {
        self.op_mask = Some(op_mask);
        self
    }

    /// Returns current setting
    pub fn op_mask(&self) -> Option<Op> {
        self.op_mask
    }

    /// For the inotify backend: when walking a recursive root, emit one
    /// synthetic `CREATE` event for every subdirectory discovered during the
    /// walk (the root itself excluded). Off by default. No-op elsewhere.
    pub fn with_create_on_recursive_add(mut self, enabled: bool) -> Self {
        self.create_on_recursive_add = enabled;
        self
    }

    /// Returns current setting
    pub fn create_on_recursive_add(&self) -> bool {
        self.create_on_recursive_add
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            no_follow: false,
            op_mask: None,
            create_on_recursive_add: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.buffer_size(), DEFAULT_BUFFER_SIZE);
        assert!(!options.no_follow());
        assert_eq!(options.op_mask(), None);
        assert!(!options.create_on_recursive_add());
    }

    #[test]
    fn builders_set_fields() {
        let options = Options::default()
            .with_buffer_size(8192)
            .with_no_follow(true)
            .with_op_mask(Op::CREATE | Op::REMOVE)
            .with_create_on_recursive_add(true);
        assert_eq!(options.buffer_size(), 8192);
        assert!(options.no_follow());
        assert_eq!(options.op_mask(), Some(Op::CREATE | Op::REMOVE));
        assert!(options.create_on_recursive_add());
    }
}
