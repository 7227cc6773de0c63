//! The per-backend watch table.
//!
//! Every backend tracks its registrations through the same structure: a map
//! from cleaned path to [`Watch`] plus a reverse index from the backend's
//! descriptor to the path. The table is shared between the facade and the
//! reader thread behind an `RwLock`; the reader mutates it on
//! delete/rename/rescan while the facade mutates it on add/remove.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};

/// One registration, as the backends see it.
///
/// `descriptor` is whatever handle the kernel gave us for the path: an
/// inotify watch descriptor, a kqueue path key, a directory handle, or a
/// `file_obj` address. `flags` holds the kernel event classes armed on the
/// descriptor, in the backend's own encoding.
#[derive(Clone, Debug)]
pub(crate) struct Watch<D> {
    pub path: PathBuf,
    pub descriptor: D,
    pub flags: u32,
    pub is_dir: bool,
    pub is_link: bool,
    pub link_target: Option<PathBuf>,
    /// True if the path was passed to `add`; false for watches installed
    /// internally (directory children on kqueue/FEN, subdirectories of a
    /// recursive root on inotify).
    pub added_by_user: bool,
    /// True if the watch belongs to a recursive root (inotify only).
    pub recurse: bool,
}

impl<D> Watch<D> {
    pub fn new(path: PathBuf, descriptor: D) -> Self {
        Watch {
            path,
            descriptor,
            flags: 0,
            is_dir: false,
            is_link: false,
            link_target: None,
            added_by_user: true,
            recurse: false,
        }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    #[allow(dead_code)] // only the kqueue backend builds link watches this way
    pub fn link(mut self, target: Option<PathBuf>) -> Self {
        self.is_link = target.is_some();
        self.link_target = target;
        self
    }

    pub fn internal(mut self) -> Self {
        self.added_by_user = false;
        self
    }

    pub fn recursive(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }
}

/// The two indices, kept consistent under one lock.
///
/// `path → descriptor` is injective; `descriptor → watch` is total. All
/// mutating operations update both maps together.
#[derive(Debug)]
pub(crate) struct WatchTable<D> {
    by_path: HashMap<PathBuf, Watch<D>>,
    paths: HashMap<D, PathBuf>,
}

impl<D: Clone + Eq + Hash> WatchTable<D> {
    pub fn new() -> Self {
        WatchTable {
            by_path: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Inserts a watch into both indices, replacing an existing entry for
    /// the same path (and dropping its stale descriptor index).
    pub fn insert(&mut self, watch: Watch<D>) {
        if let Some(old) = self.by_path.remove(&watch.path) {
            self.paths.remove(&old.descriptor);
        }
        self.paths
            .insert(watch.descriptor.clone(), watch.path.clone());
        self.by_path.insert(watch.path.clone(), watch);
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn by_path(&self, path: &Path) -> Option<&Watch<D>> {
        self.by_path.get(path)
    }

    pub fn by_wd(&self, descriptor: &D) -> Option<&Watch<D>> {
        self.paths
            .get(descriptor)
            .and_then(|path| self.by_path.get(path))
    }

    /// Removes by descriptor; the returned watch tells the caller whether a
    /// directory vanished (descendant teardown decision).
    pub fn remove_wd(&mut self, descriptor: &D) -> Option<Watch<D>> {
        let path = self.paths.remove(descriptor)?;
        self.by_path.remove(&path)
    }

    /// Removes the watch for `path` from both indices, along with every
    /// descendant watch when the removed watch is a recursive root or
    /// `descendants` is requested. Returns the removed watches, outermost
    /// first; empty if the path was not watched.
    pub fn remove_path(&mut self, path: &Path, descendants: bool) -> Vec<Watch<D>> {
        let mut removed = Vec::new();
        let Some(watch) = self.by_path.remove(path) else {
            return removed;
        };
        self.paths.remove(&watch.descriptor);
        let sweep = descendants || watch.recurse;
        removed.push(watch);

        if sweep {
            let children: Vec<PathBuf> = self
                .by_path
                .keys()
                .filter(|p| p.starts_with(path))
                .cloned()
                .collect();
            for child in children {
                if let Some(watch) = self.by_path.remove(&child) {
                    self.paths.remove(&watch.descriptor);
                    removed.push(watch);
                }
            }
        }
        removed
    }

    /// Atomic read-modify-write of the watch for `path`; used for
    /// MASK_ADD-style flag merging. Returns false if the path is unknown.
    pub fn update_path<F: FnOnce(&mut Watch<D>)>(&mut self, path: &Path, f: F) -> bool {
        match self.by_path.get_mut(path) {
            Some(watch) => {
                f(watch);
                true
            }
            None => false,
        }
    }

    /// Rewrites the stored path of every watch under `old` to live under
    /// `new`, keeping descriptors. Used when a directory inside a recursive
    /// root is renamed: the kernel registrations survive the move, only our
    /// names are stale.
    pub fn rewrite_prefix(&mut self, old: &Path, new: &Path) {
        let moved: Vec<PathBuf> = self
            .by_path
            .keys()
            .filter(|p| p.starts_with(old))
            .cloned()
            .collect();
        for path in moved {
            if let Some(mut watch) = self.by_path.remove(&path) {
                let renamed = match path.strip_prefix(old) {
                    Ok(rest) if rest.as_os_str().is_empty() => new.to_path_buf(),
                    Ok(rest) => new.join(rest),
                    Err(_) => path,
                };
                self.paths
                    .insert(watch.descriptor.clone(), renamed.clone());
                watch.path = renamed.clone();
                self.by_path.insert(renamed, watch);
            }
        }
    }

    /// The watched paths; with `user_only`, exactly the set of paths the
    /// user asked for that are still alive.
    pub fn paths(&self, user_only: bool) -> Vec<PathBuf> {
        self.by_path
            .values()
            .filter(|watch| !user_only || watch.added_by_user)
            .map(|watch| watch.path.clone())
            .collect()
    }

    /// Watches whose path sits directly inside `dir`; the backends that
    /// synthesise directory semantics (kqueue, FEN) diff rescans against
    /// this set.
    #[allow(dead_code)]
    pub fn children_of(&self, dir: &Path) -> Vec<&Watch<D>> {
        self.by_path
            .values()
            .filter(|watch| watch.path.parent() == Some(dir))
            .collect()
    }

    /// Empties the table, handing back every watch for kernel teardown.
    pub fn drain(&mut self) -> Vec<Watch<D>> {
        self.paths.clear();
        self.by_path.drain().map(|(_, watch)| watch).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(path: &str, wd: u32) -> Watch<u32> {
        Watch::new(PathBuf::from(path), wd)
    }

    #[test]
    fn indices_stay_consistent() {
        let mut table = WatchTable::new();
        table.insert(watch("/a", 1));
        table.insert(watch("/b", 2));

        assert_eq!(table.by_wd(&1).unwrap().path, PathBuf::from("/a"));
        assert_eq!(table.by_path(Path::new("/b")).unwrap().descriptor, 2);

        // re-registering a path drops the stale descriptor index
        table.insert(watch("/a", 3));
        assert!(table.by_wd(&1).is_none());
        assert_eq!(table.by_wd(&3).unwrap().path, PathBuf::from("/a"));
    }

    #[test]
    fn remove_wd_reports_dir() {
        let mut table = WatchTable::new();
        table.insert(watch("/dir", 1).dir(true));
        let removed = table.remove_wd(&1).unwrap();
        assert!(removed.is_dir);
        assert!(table.paths(false).is_empty());
    }

    #[test]
    fn remove_path_sweeps_recursive_roots() {
        let mut table = WatchTable::new();
        table.insert(watch("/root", 1).dir(true).recursive(true));
        table.insert(watch("/root/sub", 2).dir(true).internal().recursive(true));
        table.insert(watch("/root/sub/deep", 3).dir(true).internal().recursive(true));
        table.insert(watch("/other", 4));

        let removed = table.remove_path(Path::new("/root"), false);
        assert_eq!(removed.len(), 3);
        assert!(table.contains_path(Path::new("/other")));
        assert!(!table.contains_path(Path::new("/root/sub")));
    }

    #[test]
    fn remove_path_simple_watch_is_single() {
        let mut table = WatchTable::new();
        table.insert(watch("/a", 1));
        assert_eq!(table.remove_path(Path::new("/a"), false).len(), 1);
        assert!(table.remove_path(Path::new("/a"), false).is_empty());
    }

    #[test]
    fn update_path_merges_flags() {
        let mut table = WatchTable::new();
        table.insert(watch("/a", 1).flags(0b01));
        assert!(table.update_path(Path::new("/a"), |w| w.flags |= 0b10));
        assert_eq!(table.by_path(Path::new("/a")).unwrap().flags, 0b11);
        assert!(!table.update_path(Path::new("/nope"), |_| ()));
    }

    #[test]
    fn rewrite_prefix_moves_subtree() {
        let mut table = WatchTable::new();
        table.insert(watch("/root/old", 1).dir(true));
        table.insert(watch("/root/old/child", 2));
        table.insert(watch("/root/other", 3));

        table.rewrite_prefix(Path::new("/root/old"), Path::new("/root/new"));

        assert_eq!(table.by_wd(&1).unwrap().path, PathBuf::from("/root/new"));
        assert_eq!(
            table.by_wd(&2).unwrap().path,
            PathBuf::from("/root/new/child")
        );
        assert_eq!(table.by_wd(&3).unwrap().path, PathBuf::from("/root/other"));
        assert!(table.by_path(Path::new("/root/old")).is_none());
    }

    #[test]
    fn user_only_listing_hides_internal_watches() {
        let mut table = WatchTable::new();
        table.insert(watch("/dir", 1).dir(true));
        table.insert(watch("/dir/file", 2).internal());

        let mut user = table.paths(true);
        user.sort();
        assert_eq!(user, vec![PathBuf::from("/dir")]);
        assert_eq!(table.paths(false).len(), 2);
    }

    #[test]
    fn children_of_lists_direct_entries_only() {
        let mut table = WatchTable::new();
        table.insert(watch("/dir", 1).dir(true));
        table.insert(watch("/dir/a", 2).internal());
        table.insert(watch("/dir/sub/b", 3).internal());

        let children = table.children_of(Path::new("/dir"));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, PathBuf::from("/dir/a"));
    }
}
