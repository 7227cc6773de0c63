//! Backend implementation for Windows' directory management APIs
//!
//! For more information see the [ReadDirectoryChangesW reference][ref].
//!
//! Each watched directory gets a handle opened for asynchronous reads and a
//! caller-sized buffer the kernel fills with change records; a completion
//! routine decodes the records and immediately reissues the read. A server
//! thread in an alertable wait owns the handles, so the completion routines
//! have somewhere to run.
//!
//! Known platform quirks that callers should expect: removing a watched
//! directory produces one event for the directory itself but not
//! necessarily one per file inside it; attribute changes are folded into
//! `WRITE` by the kernel's action codes; renaming the watched directory
//! itself neither drops the watch nor rewrites the stored paths.
//!
//! [ref]: https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-readdirectorychangesw

use crate::config::{Options, MIN_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::watches::{Watch, WatchTable};
use crate::{Backend, EventTx};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::alloc;
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::raw::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::ptr;
use std::slice;
use std::sync::{Arc, RwLock};
use std::thread;
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, ERROR_SUCCESS, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObjectEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

#[derive(Clone)]
struct ReadData {
    dir: PathBuf,          // directory that is being watched
    file: Option<PathBuf>, // if a file is being watched, this is its full path
    buffer_size: usize,
    complete_sem: HANDLE,
}

struct ReadDirectoryRequest {
    event_tx: EventTx,
    buffer: Vec<u8>,
    handle: HANDLE,
    data: ReadData,
    action_tx: Sender<Action>,
}

impl ReadDirectoryRequest {
    fn unwatch(&self) {
        let _ = self.action_tx.send(Action::Unwatch {
            path: self.data.dir.clone(),
            tx: None,
        });
    }
}

enum Action {
    Watch {
        path: PathBuf,
        buffer_size: usize,
        tx: Sender<Result<()>>,
    },
    Unwatch {
        path: PathBuf,
        tx: Option<Sender<Result<()>>>,
    },
    Stop {
        tx: Sender<()>,
    },
}

struct WatchState {
    dir_handle: HANDLE,
    complete_sem: HANDLE,
}

struct ReadDirectoryChangesServer {
    tx: Sender<Action>,
    rx: Receiver<Action>,
    event_tx: EventTx,
    watches: HashMap<PathBuf, WatchState>,
    table: Arc<RwLock<WatchTable<usize>>>,
    wakeup_sem: HANDLE,
}

impl ReadDirectoryChangesServer {
    fn start(
        event_tx: EventTx,
        table: Arc<RwLock<WatchTable<usize>>>,
        wakeup_sem: HANDLE,
    ) -> Sender<Action> {
        let (action_tx, action_rx) = unbounded();
        // smuggle the handle through as an integer; semaphore handles are
        // process-wide, only the raw-pointer type is thread-hostile
        let sem_temp = wakeup_sem as usize;
        let _ = thread::Builder::new()
            .name("watchfs windows loop".to_string())
            .spawn({
                let tx = action_tx.clone();
                move || {
                    let wakeup_sem = sem_temp as HANDLE;
                    let server = ReadDirectoryChangesServer {
                        tx,
                        rx: action_rx,
                        event_tx,
                        watches: HashMap::new(),
                        table,
                        wakeup_sem,
                    };
                    server.run();
                }
            });
        action_tx
    }

    fn run(mut self) {
        let mut stop_ack = None;

        loop {
            // process all available actions first
            while let Ok(action) = self.rx.try_recv() {
                match action {
                    Action::Watch {
                        path,
                        buffer_size,
                        tx,
                    } => {
                        let res = self.add_watch(path, buffer_size);
                        let _ = tx.send(res);
                    }
                    Action::Unwatch { path, tx } => {
                        let res = self.remove_watch(path);
                        if let Some(tx) = tx {
                            let _ = tx.send(res);
                        }
                    }
                    Action::Stop { tx } => {
                        let paths: Vec<PathBuf> = self.watches.keys().cloned().collect();
                        for path in paths {
                            let _ = self.remove_watch(path);
                        }
                        stop_ack = Some(tx);
                        break;
                    }
                }
            }

            if stop_ack.is_some() {
                break;
            }

            unsafe {
                // the wait must be alertable, or queued completion
                // routines would never get to run on this thread
                WaitForSingleObjectEx(self.wakeup_sem, 100, 1);
            }
        }

        // the facade side may already be gone, so the semaphore is ours
        // to release
        unsafe {
            CloseHandle(self.wakeup_sem);
        }

        // outstanding requests were drained by remove_watch above, so this
        // is the last sender: events close, then errors, then the ack
        let ReadDirectoryChangesServer { event_tx, .. } = self;
        drop(event_tx);
        if let Some(ack) = stop_ack {
            let _ = ack.send(());
        }
    }

    fn add_watch(&mut self, path: PathBuf, buffer_size: usize) -> Result<()> {
        // path must exist and be either a file or directory
        if !path.is_dir() && !path.is_file() {
            return Err(Error::io(std::io::Error::from(std::io::ErrorKind::NotFound))
                .add_path(path));
        }

        if self.watches.contains_key(&path) {
            // adding the same cleaned path twice is a no-op
            return Ok(());
        }

        let (watching_file, dir_target) = {
            if path.is_dir() {
                (false, path.clone())
            } else {
                // the kernel only watches directories; a file watch opens
                // the parent and filters on the file's name
                (true, path.parent().unwrap().to_path_buf())
            }
        };

        let encoded_path: Vec<u16> = dir_target
            .as_os_str()
            .encode_wide()
            .chain(Some(0))
            .collect();
        let handle;
        unsafe {
            handle = CreateFileW(
                encoded_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            );

            if handle == INVALID_HANDLE_VALUE {
                return Err(if watching_file {
                    // a single-file watch rides on its parent directory, so
                    // that is the handle that failed to open
                    Error::generic("cannot open the parent directory of the watched file")
                        .add_path(path)
                } else {
                    Error::io(std::io::Error::last_os_error()).add_path(path)
                });
            }
        }
        let wf = if watching_file {
            Some(path.clone())
        } else {
            None
        };
        // per-watch semaphore, signalled when the read chain has ended
        let semaphore = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if semaphore.is_null() || semaphore == INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(handle);
            }
            return Err(Error::generic("could not create the completion semaphore").add_path(path));
        }
        let rd = ReadData {
            dir: dir_target,
            file: wf,
            buffer_size,
            complete_sem: semaphore,
        };
        let ws = WatchState {
            dir_handle: handle,
            complete_sem: semaphore,
        };
        self.watches.insert(path.clone(), ws);
        if let Ok(mut table) = self.table.write() {
            table.insert(
                Watch::new(path.clone(), handle as usize)
                    .flags(filter_mask())
                    .dir(!watching_file),
            );
        }
        start_read(&rd, self.event_tx.clone(), handle, self.tx.clone());
        Ok(())
    }

    fn remove_watch(&mut self, path: PathBuf) -> Result<()> {
        let Some(ws) = self.watches.remove(&path) else {
            return Err(Error::non_existent_watch().add_path(path));
        };
        if let Ok(mut table) = self.table.write() {
            table.remove_path(&path, false);
        }
        stop_watch(&ws);
        Ok(())
    }
}

fn stop_watch(ws: &WatchState) {
    unsafe {
        let cio = CancelIo(ws.dir_handle);
        let ch = CloseHandle(ws.dir_handle);
        // the leaked request box is only reclaimed by the completion
        // routine, so block (alertably, draining the APC queue) until it
        // has fired for the cancelled read
        if cio != 0 && ch != 0 {
            while WaitForSingleObjectEx(ws.complete_sem, INFINITE, 1) != WAIT_OBJECT_0 {}
        }
        CloseHandle(ws.complete_sem);
    }
}

fn filter_mask() -> u32 {
    FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_CREATION
}

fn start_read(rd: &ReadData, event_tx: EventTx, handle: HANDLE, action_tx: Sender<Action>) {
    let request = Box::new(ReadDirectoryRequest {
        event_tx,
        handle,
        buffer: vec![0u8; rd.buffer_size],
        data: rd.clone(),
        action_tx,
    });

    unsafe {
        let overlapped = alloc::alloc_zeroed(alloc::Layout::new::<OVERLAPPED>()) as *mut OVERLAPPED;
        // hEvent is unused by completion-routine I/O, so it carries the
        // request pointer over to the callback
        let request = Box::leak(request);
        (*overlapped).hEvent = request as *mut _ as _;

        let ret = ReadDirectoryChangesW(
            handle,
            request.buffer.as_mut_ptr() as *mut c_void,
            request.data.buffer_size as u32,
            0, // single directory; recursion is not part of this backend
            filter_mask(),
            &mut 0u32 as *mut u32, // byte count is only written for synchronous calls
            overlapped,
            Some(handle_event),
        );

        if ret == 0 {
            // error issuing the read; ownership of the allocations was not
            // passed to the kernel, so claim it back and let drop clean up
            let _overlapped = Box::from_raw(overlapped);
            let request = Box::from_raw(request);
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
        }
    }
}

unsafe extern "system" fn handle_event(
    error_code: u32,
    bytes_written: u32,
    overlapped: *mut OVERLAPPED,
) {
    let overlapped: Box<OVERLAPPED> = Box::from_raw(overlapped);
    let request: Box<ReadDirectoryRequest> = Box::from_raw(overlapped.hEvent as *mut _);

    match error_code {
        ERROR_OPERATION_ABORTED => {
            // the read was cancelled (unwatch or shutdown); the request box
            // falls out of scope here, which is the cleanup
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return;
        }
        ERROR_ACCESS_DENIED => {
            // This could happen when the watched directory is deleted or
            // trashed; check if that's the case and tear the watch down.
            if !request.data.dir.exists() {
                request.unwatch();
                ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
                return;
            }
        }
        ERROR_SUCCESS => {
            // continue to handle the event
        }
        _ => {
            log::error!(
                "unknown error in ReadDirectoryChangesW for directory {}: {}",
                request.data.dir.display(),
                error_code
            );
            request.unwatch();
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return;
        }
    }

    // Get the next request queued up as soon as possible
    start_read(
        &request.data,
        request.event_tx.clone(),
        request.handle,
        request.action_tx.clone(),
    );

    if bytes_written == 0 {
        // the kernel could not fit the burst into our buffer and dropped
        // the details on the floor
        request.event_tx.error(Error::event_overflow());
        return;
    }

    // The buffer holds a chain of variable-length FILE_NOTIFY_INFORMATION
    // records, each ending in an inline UTF-16 name and carrying the byte
    // offset of the next record. Record starts are not guaranteed to be
    // 4-byte aligned for us (Wine lays them out on WCHAR boundaries), so
    // every record is copied out with an unaligned read.
    let mut cur_offset: *const u8 = request.buffer.as_ptr();
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    // the old-name half of a rename, waiting for its new-name half
    let mut pending_rename: Option<PathBuf> = None;
    loop {
        // FileNameLength counts bytes; the name is UTF-16 code units
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset.offset(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName) as isize)
                as _,
            len,
        );
        // record names are relative to the watched directory
        let path = request
            .data
            .dir
            .join(PathBuf::from(OsString::from_wide(encoded_path)));

        // single-file watches see the whole parent directory; everything
        // that is not the file itself is noise
        let skip = match request.data.file {
            None => false,
            Some(ref watch_path) => *watch_path != path,
        };

        if !skip {
            log::trace!(
                "windows event: path = `{}`, action = {:?}",
                path.display(),
                cur_entry.Action
            );

            if cur_entry.Action == FILE_ACTION_RENAMED_NEW_NAME {
                match pending_rename.take() {
                    Some(old) => {
                        // the documented cross-platform shape of a rename:
                        // RENAME under the old name, CREATE under the new
                        request.event_tx.send(Event::new(old.clone(), Op::RENAME));
                        request
                            .event_tx
                            .send(Event::renamed(path, Op::CREATE, Some(old)));
                    }
                    // moved into the watched directory from outside
                    None => {
                        request.event_tx.send(Event::new(path, Op::CREATE));
                    }
                }
            } else {
                // a lone old-name half means the object left the watched
                // directory; all we can report is the rename itself
                if let Some(old) = pending_rename.take() {
                    request.event_tx.send(Event::new(old, Op::RENAME));
                }

                match cur_entry.Action {
                    FILE_ACTION_RENAMED_OLD_NAME => {
                        pending_rename = Some(path);
                    }
                    FILE_ACTION_ADDED => {
                        request.event_tx.send(Event::new(path, Op::CREATE));
                    }
                    FILE_ACTION_REMOVED => {
                        request.event_tx.send(Event::new(path, Op::REMOVE));
                    }
                    FILE_ACTION_MODIFIED => {
                        request.event_tx.send(Event::new(path, Op::WRITE));
                    }
                    _ => (),
                };
            }
        }

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    }

    if let Some(old) = pending_rename.take() {
        request.event_tx.send(Event::new(old, Op::RENAME));
    }
}

/// Backend implementation based on ReadDirectoryChangesW
pub(crate) struct ReadDirectoryChangesBackend {
    tx: Sender<Action>,
    wakeup_sem: usize,
    watches: Arc<RwLock<WatchTable<usize>>>,
}

impl ReadDirectoryChangesBackend {
    pub fn create(event_tx: EventTx) -> Result<ReadDirectoryChangesBackend> {
        let wakeup_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if wakeup_sem.is_null() || wakeup_sem == INVALID_HANDLE_VALUE {
            return Err(Error::generic("could not create the wakeup semaphore"));
        }

        let watches = Arc::new(RwLock::new(WatchTable::new()));
        let tx = ReadDirectoryChangesServer::start(event_tx, watches.clone(), wakeup_sem);

        Ok(ReadDirectoryChangesBackend {
            tx,
            wakeup_sem: wakeup_sem as usize,
            watches,
        })
    }

    fn wakeup_server(&self) {
        // breaks the server out of its wait state, so actions don't sit
        // for up to 100ms until the next alertable-wait timeout
        unsafe {
            ReleaseSemaphore(self.wakeup_sem as HANDLE, 1, ptr::null_mut());
        }
    }
}

impl Backend for ReadDirectoryChangesBackend {
    fn add(&self, path: PathBuf, recursive: bool, options: Options) -> Result<()> {
        if recursive {
            return Err(Error::unsupported("recursive watch").add_path(path));
        }
        if options.buffer_size() < MIN_BUFFER_SIZE {
            return Err(Error::generic(&format!(
                "buffer size must be at least {MIN_BUFFER_SIZE} bytes"
            )));
        }

        let (tx, rx) = unbounded();
        self.tx
            .send(Action::Watch {
                path,
                buffer_size: options.buffer_size(),
                tx,
            })
            .map_err(|_| Error::closed())?;
        self.wakeup_server();
        rx.recv().unwrap_or(Err(Error::closed()))
    }

    fn remove(&self, path: PathBuf, _recursive: bool) -> Result<()> {
        let (tx, rx) = unbounded();
        self.tx
            .send(Action::Unwatch { path, tx: Some(tx) })
            .map_err(|_| Error::closed())?;
        self.wakeup_server();
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
        if self.tx.send(Action::Stop { tx }).is_err() {
            return Ok(());
        }
        self.wakeup_server();
        let _ = rx.recv();
        Ok(())
    }
}

// The raw semaphore handle is only ever passed back to the kernel; sharing
// it across threads is explicitly fine.
unsafe impl Send for ReadDirectoryChangesBackend {}
unsafe impl Sync for ReadDirectoryChangesBackend {}
