//! Parallel directory walker.
//!
//! Architecture:
//! ```text
//! Directory Queue (crossbeam Injector)
//! │
//! ├── Prefetcher 1: pop dir → read_dir → park listing → push subdirs
//! ├── Prefetcher 2: pop dir → read_dir → park listing → push subdirs
//! └── Prefetcher N: ...
//!
//! Sequencer (calling thread): depth-first over parked listings → visitor
//! ```
//!
//! Prefetchers read directories ahead in whatever order the queue hands them
//! out. Only the sequencer calls the visitor, so the output is the same
//! sorted depth-first order for any worker count. When the listing it needs
//! has not been picked up yet, the sequencer reads it itself.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, FileType};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use nix::errno::Errno;
use nix::sys::stat::SFlag;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{Traversal, WalkVisitor};
use crate::config::default_walk_workers;
use crate::protocol::DirEntry;

/// Idle prefetchers back off for this long before polling the queue again.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// Listings read ahead of the sequencer before prefetchers wait.
const MAX_PARKED: usize = 1024;

/// Walks a tree with a fixed pool of worker threads.
///
/// Entries come out in depth-first order with the children of each
/// directory sorted by name bytes, which makes the whole sequence sorted by
/// path. Directory paths carry a trailing `/` and the mode of each entry is
/// its file-type bits. The calling thread counts as one of the workers.
#[derive(Debug, Clone)]
pub struct ParallelWalker {
    workers: usize,
}

impl ParallelWalker {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for ParallelWalker {
    fn default() -> Self {
        Self::new(default_walk_workers())
    }
}

/// One node found while listing a directory.
#[derive(Debug)]
enum Child {
    Entry(DirEntry),
    Failed(PathBuf, io::Error),
}

impl Child {
    fn path(&self) -> &Path {
        match self {
            Child::Entry(entry) => &entry.path,
            Child::Failed(path, _) => path,
        }
    }
}

/// Sorted contents of one directory.
#[derive(Debug, Default)]
struct Listing {
    /// Failures while iterating the directory itself.
    errors: Vec<io::Error>,
    children: Vec<Child>,
}

enum Slot {
    /// A prefetcher is reading it.
    Reading,
    Ready(io::Result<Listing>),
    /// The sequencer got to it first; the queued copy is stale.
    Taken,
}

#[derive(Default)]
struct Parked {
    slots: HashMap<PathBuf, Slot>,
    ready: usize,
}

/// Shared state of one walk.
struct WalkState {
    queue: Injector<PathBuf>,
    /// Whether any prefetcher runs. Without one nothing is queued.
    prefetch: bool,
    parked: Mutex<Parked>,
    changed: Condvar,
    done: AtomicBool,
}

impl WalkState {
    fn new(prefetch: bool) -> Self {
        Self {
            queue: Injector::new(),
            prefetch,
            parked: Mutex::new(Parked::default()),
            changed: Condvar::new(),
            done: AtomicBool::new(false),
        }
    }

    fn next_dir(&self) -> Option<PathBuf> {
        loop {
            match self.queue.steal() {
                Steal::Success(dir) => return Some(dir),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn finish(&self) {
        // Hold the lock so a prefetcher can't miss the wakeup between its
        // check and its wait.
        let _parked = self.parked.lock();
        self.done.store(true, Ordering::SeqCst);
        self.changed.notify_all();
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Read and sort `dir`, queueing its subdirectories for prefetch.
    fn read_listing(&self, dir: &Path) -> io::Result<Listing> {
        let mut listing = Listing::default();

        for entry in fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    listing.errors.push(e);
                    continue;
                }
            };

            let mut path = dir.as_os_str().to_owned();
            path.push(entry.file_name());

            let child = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {
                    let path = with_trailing_slash(&path);
                    if self.prefetch {
                        self.queue.push(path.clone());
                    }
                    Child::Entry(DirEntry::new(path, type_bits(&file_type), entry.ino()))
                }
                Ok(file_type) => {
                    Child::Entry(DirEntry::new(path, type_bits(&file_type), entry.ino()))
                }
                Err(e) => Child::Failed(path.into(), e),
            };
            listing.children.push(child);
        }

        // Children share the directory prefix, so this is name order.
        listing
            .children
            .sort_by(|a, b| a.path().as_os_str().as_bytes().cmp(b.path().as_os_str().as_bytes()));
        Ok(listing)
    }

    /// The listing of `dir`, from a prefetcher if one has it.
    fn take_listing(&self, dir: &Path) -> io::Result<Listing> {
        let mut parked = self.parked.lock();
        loop {
            match parked.slots.remove(dir) {
                Some(Slot::Ready(listing)) => {
                    parked.ready -= 1;
                    self.changed.notify_all();
                    return listing;
                }
                Some(Slot::Reading) => {
                    parked.slots.insert(dir.to_path_buf(), Slot::Reading);
                    self.changed.wait(&mut parked);
                }
                Some(Slot::Taken) | None => break,
            }
        }

        if self.prefetch {
            parked.slots.insert(dir.to_path_buf(), Slot::Taken);
        }
        drop(parked);

        self.read_listing(dir)
    }
}

impl Traversal for ParallelWalker {
    fn walk(&self, root: &Path, visitor: &dyn WalkVisitor) -> io::Result<()> {
        if root.as_os_str().is_empty() {
            return Err(Errno::EINVAL.into());
        }

        let meta = fs::symlink_metadata(root).map_err(|e| root_failed("lstat", root, e))?;
        let file_type = meta.file_type();

        if !file_type.is_dir() {
            return visitor.visit(DirEntry::new(
                root.to_path_buf(),
                type_bits(&file_type),
                meta.ino(),
            ));
        }

        let root_path = with_trailing_slash(root.as_os_str());
        let state = WalkState::new(self.workers > 1);
        let listing = state
            .read_listing(&root_path)
            .map_err(|e| root_failed("open", root, e))?;

        visitor.visit(DirEntry::new(
            root_path.clone(),
            type_bits(&file_type),
            meta.ino(),
        ))?;

        thread::scope(|scope| {
            for id in 1..self.workers {
                let state = &state;
                scope.spawn(move || prefetch_loop(id, state));
            }

            let result = sequence(&state, visitor, &root_path, listing);
            state.finish();
            result
        })
    }
}

fn prefetch_loop(id: usize, state: &WalkState) {
    debug!("Prefetcher {} started", id);

    while !state.is_done() {
        let Some(dir) = state.next_dir() else {
            thread::sleep(IDLE_BACKOFF);
            continue;
        };

        {
            let mut parked = state.parked.lock();
            while parked.ready >= MAX_PARKED && !state.is_done() {
                state.changed.wait(&mut parked);
            }
            if state.is_done() {
                break;
            }
            if parked.slots.remove(&dir).is_some() {
                // Only the sequencer inserts ahead of the queue: it is taken.
                continue;
            }
            parked.slots.insert(dir.clone(), Slot::Reading);
        }

        let listing = state.read_listing(&dir);

        let mut parked = state.parked.lock();
        parked.slots.insert(dir, Slot::Ready(listing));
        parked.ready += 1;
        state.changed.notify_all();
    }

    debug!("Prefetcher {} finished", id);
}

/// Hand every node under `root` to the visitor, depth first.
///
/// Only visitor failures are returned; filesystem errors go to the visitor.
fn sequence(
    state: &WalkState,
    visitor: &dyn WalkVisitor,
    root: &Path,
    listing: Listing,
) -> io::Result<()> {
    let mut stack = vec![open_listing(visitor, root, Ok(listing))?];

    while let Some(children) = stack.last_mut() {
        let Some(child) = children.next() else {
            stack.pop();
            continue;
        };

        match child {
            Child::Entry(entry) if entry.is_dir() => {
                let dir = entry.path.clone();
                visitor.visit(entry)?;
                let listing = state.take_listing(&dir);
                stack.push(open_listing(visitor, &dir, listing)?);
            }
            Child::Entry(entry) => visitor.visit(entry)?,
            Child::Failed(path, err) => visitor.visit_error(&path, err)?,
        }
    }

    Ok(())
}

/// Report the failures of a listing and return its children.
fn open_listing(
    visitor: &dyn WalkVisitor,
    dir: &Path,
    listing: io::Result<Listing>,
) -> io::Result<std::vec::IntoIter<Child>> {
    match listing {
        Ok(listing) => {
            for err in listing.errors {
                visitor.visit_error(dir, err)?;
            }
            Ok(listing.children.into_iter())
        }
        Err(err) => {
            visitor.visit_error(dir, err)?;
            Ok(Vec::new().into_iter())
        }
    }
}

/// Fatal error for a root that could not be stat'ed or listed.
fn root_failed(op: &str, root: &Path, err: io::Error) -> io::Error {
    io::Error::new(
        err.kind(),
        format!("{op} {}: {}", root.display(), describe(&err)),
    )
}

fn with_trailing_slash(path: &OsStr) -> PathBuf {
    let mut owned = OsString::from(path);
    if !path.as_bytes().ends_with(b"/") {
        owned.push("/");
    }
    PathBuf::from(owned)
}

/// `S_IFMT` bits for a file type.
fn type_bits(file_type: &FileType) -> u32 {
    let flag = if file_type.is_dir() {
        SFlag::S_IFDIR
    } else if file_type.is_symlink() {
        SFlag::S_IFLNK
    } else if file_type.is_file() {
        SFlag::S_IFREG
    } else if file_type.is_block_device() {
        SFlag::S_IFBLK
    } else if file_type.is_char_device() {
        SFlag::S_IFCHR
    } else if file_type.is_fifo() {
        SFlag::S_IFIFO
    } else if file_type.is_socket() {
        SFlag::S_IFSOCK
    } else {
        SFlag::empty()
    };

    flag.bits()
}

fn describe(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_string(),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;

    #[derive(Default)]
    struct Collector {
        entries: Mutex<Vec<DirEntry>>,
        errors: Mutex<Vec<(PathBuf, Option<i32>)>>,
        stop_after: Option<usize>,
    }

    impl Collector {
        fn paths(&self) -> Vec<Vec<u8>> {
            self.entries
                .lock()
                .iter()
                .map(|e| e.path.as_os_str().as_bytes().to_vec())
                .collect()
        }
    }

    impl WalkVisitor for Collector {
        fn visit(&self, entry: DirEntry) -> io::Result<()> {
            let mut entries = self.entries.lock();
            entries.push(entry);
            match self.stop_after {
                Some(limit) if entries.len() >= limit => {
                    Err(io::Error::new(io::ErrorKind::Other, "enough"))
                }
                _ => Ok(()),
            }
        }

        fn visit_error(&self, path: &Path, err: io::Error) -> io::Result<()> {
            self.errors
                .lock()
                .push((path.to_path_buf(), err.raw_os_error()));
            Ok(())
        }
    }

    /// root/{a,b}/{1,2} plus root/file.
    fn fill_tree(root: &Path) -> usize {
        for dir in ["a", "b"] {
            fs::create_dir(root.join(dir)).unwrap();
            for file in ["1", "2"] {
                fs::write(root.join(dir).join(file), file).unwrap();
            }
        }
        fs::write(root.join("file"), b"x").unwrap();
        // root + 2 dirs + 4 files + file
        8
    }

    /// Names that sort differently with and without the trailing slash,
    /// spread over enough directories to keep several prefetchers busy.
    fn fill_wide_tree(root: &Path) -> usize {
        let mut count = 1;
        for dir in ["a", "a-b", "a.c", "a0", "b"] {
            for sub in ["x", "x-y", "x0"] {
                fs::create_dir_all(root.join(dir).join(sub)).unwrap();
                for file in ["1", "10", "1.txt", "2"] {
                    fs::write(root.join(dir).join(sub).join(file), b"").unwrap();
                }
                fs::write(root.join(dir).join(format!("{sub}.f")), b"").unwrap();
                count += 1 + 4 + 1;
            }
            count += 1;
        }
        fs::write(root.join("a.d"), b"").unwrap();
        count + 1
    }

    fn is_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn with_root(root: &Path, rel: &str) -> Vec<u8> {
        format!("{}/{rel}", root.display()).into_bytes()
    }

    #[test]
    fn test_worker_count_is_at_least_one() {
        assert_eq!(ParallelWalker::new(0).workers(), 1);
        assert_eq!(ParallelWalker::new(6).workers(), 6);
        assert!(ParallelWalker::default().workers() >= 1);
    }

    #[test]
    fn test_walk_visits_every_node_once() {
        let tmp = tempfile::tempdir().unwrap();
        let expected = fill_tree(tmp.path());
        let collector = Collector::default();

        ParallelWalker::new(4).walk(tmp.path(), &collector).unwrap();

        assert!(collector.errors.lock().is_empty());
        let paths = collector.paths();
        assert_eq!(paths.len(), expected);
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), expected);
    }

    #[test]
    fn test_root_first_with_trailing_slash() {
        let tmp = tempfile::tempdir().unwrap();
        fill_tree(tmp.path());
        let collector = Collector::default();

        ParallelWalker::new(2).walk(tmp.path(), &collector).unwrap();

        let entries = collector.entries.into_inner();
        let root = &entries[0];
        assert_eq!(root.path.as_os_str().as_bytes(), with_root(tmp.path(), ""));
        assert!(root.is_dir());
        assert_eq!(root.inode, fs::symlink_metadata(tmp.path()).unwrap().ino());
    }

    #[test]
    fn test_entries_carry_type_bits_and_inode() {
        let tmp = tempfile::tempdir().unwrap();
        fill_tree(tmp.path());
        std::os::unix::fs::symlink("file", tmp.path().join("link")).unwrap();
        let collector = Collector::default();

        ParallelWalker::new(1).walk(tmp.path(), &collector).unwrap();

        for entry in collector.entries.into_inner() {
            let meta = fs::symlink_metadata(&entry.path).unwrap();
            assert_eq!(entry.inode, meta.ino());
            assert_eq!(entry.mode, meta.mode() & SFlag::S_IFMT.bits());
            assert_eq!(
                entry.path.as_os_str().as_bytes().ends_with(b"/"),
                entry.is_dir()
            );
        }
    }

    #[test]
    fn test_order_is_depth_first_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        fill_tree(tmp.path());
        let collector = Collector::default();

        ParallelWalker::new(1).walk(tmp.path(), &collector).unwrap();

        let expected: Vec<_> = ["", "a/", "a/1", "a/2", "b/", "b/1", "b/2", "file"]
            .iter()
            .map(|rel| with_root(tmp.path(), rel))
            .collect();
        assert_eq!(collector.paths(), expected);
    }

    #[test]
    fn test_order_is_sorted_for_any_worker_count() {
        let tmp = tempfile::tempdir().unwrap();
        let expected = fill_wide_tree(tmp.path());

        for workers in [1, 2, 8] {
            for _ in 0..10 {
                let collector = Collector::default();
                ParallelWalker::new(workers)
                    .walk(tmp.path(), &collector)
                    .unwrap();

                let paths = collector.paths();
                assert_eq!(paths.len(), expected, "workers={workers}");
                let mut sorted = paths.clone();
                sorted.sort();
                assert_eq!(paths, sorted, "workers={workers}");
            }
        }
    }

    #[test]
    fn test_file_root_is_single_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("only");
        fs::write(&file, b"1").unwrap();
        let collector = Collector::default();

        ParallelWalker::new(2).walk(&file, &collector).unwrap();

        let entries = collector.entries.into_inner();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, file);
        assert_eq!(entries[0].mode, SFlag::S_IFREG.bits());
    }

    #[test]
    fn test_empty_root_is_invalid_argument() {
        let collector = Collector::default();
        let err = ParallelWalker::new(1)
            .walk(Path::new(""), &collector)
            .unwrap_err();

        assert_eq!(err.raw_os_error(), Some(Errno::EINVAL as i32));
        assert!(collector.entries.into_inner().is_empty());
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing");
        let collector = Collector::default();

        let err = ParallelWalker::new(1).walk(&missing, &collector).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            format!("lstat {}: No such file or directory", missing.display())
        );
    }

    #[test]
    fn test_root_failure_message() {
        let err = root_failed("open", Path::new("/data"), Errno::EACCES.into());

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "open /data: Permission denied");
    }

    #[test]
    fn test_unreadable_root_is_fatal() {
        if is_root() {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0)).unwrap();

        let collector = Collector::default();
        let result = ParallelWalker::new(2).walk(&locked, &collector);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();

        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("open {}: Permission denied", locked.display())
        );
        assert!(collector.entries.into_inner().is_empty());
        assert!(collector.errors.into_inner().is_empty());
    }

    #[test]
    fn test_unreadable_directory_reported_and_walk_continues() {
        if is_root() {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let expected = fill_tree(tmp.path());
        let locked = tmp.path().join("a");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0)).unwrap();

        let collector = Collector::default();
        let result = ParallelWalker::new(3).walk(tmp.path(), &collector);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
        result.unwrap();

        // a's two files are unreachable; the walk goes on into b.
        let paths = collector.paths();
        let errors = collector.errors.into_inner();
        assert_eq!(paths.len(), expected - 2);
        assert_eq!(paths.last().unwrap(), &with_root(tmp.path(), "file"));
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].0.as_os_str().as_bytes(),
            with_root(tmp.path(), "a/")
        );
        assert_eq!(errors[0].1, Some(Errno::EACCES as i32));
    }

    #[test]
    fn test_visitor_error_stops_walk() {
        let tmp = tempfile::tempdir().unwrap();
        fill_wide_tree(tmp.path());

        for workers in [1, 4] {
            let collector = Collector {
                stop_after: Some(3),
                ..Default::default()
            };

            let err = ParallelWalker::new(workers)
                .walk(tmp.path(), &collector)
                .unwrap_err();

            assert_eq!(err.to_string(), "enough");
            assert_eq!(collector.entries.into_inner().len(), 3);
        }
    }
}
