//! Delayed-close batching.
//!
//! Objects whose last handle went away stay resident on per-volume FIFO
//! queues (plain files and directories separately) so an immediate reopen
//! is cheap. Crossing a class's high watermark starts a single drain task
//! that retires entries oldest-first down to the low watermark. Control
//! operations force full or subtree-scoped drains.

use crate::close;
use crate::config::DriverParams;
use crate::error::DriverError;
use crate::hier::{LockLedger, Mode, Rank};
use crate::object::{FileFlags, FileId, FileNode};
use crate::volume::{Volume, VolumeFlags};
use log::debug;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
pub struct DelayedCloseEntry {
    pub file: FileId,
    /// Walk length the closing handle carried; the budget for the
    /// eventual cleanup chain.
    pub tree_length: u32,
}

#[derive(Default)]
struct Queues {
    files: VecDeque<DelayedCloseEntry>,
    dirs: VecDeque<DelayedCloseEntry>,
    /// Drain targets; drains run until the class is back at its low
    /// watermark, even as new entries arrive.
    reduce_files: bool,
    reduce_dirs: bool,
}

/// Per-volume delayed-close state. The queue mutex guards only pushes and
/// pops; the actual closes run without it.
pub struct DelayedCloseQueues {
    inner: Mutex<Queues>,
    file_count: AtomicUsize,
    dir_count: AtomicUsize,
    drain_active: AtomicBool,
    max_files: usize,
    min_files: usize,
    max_dirs: usize,
    min_dirs: usize,
}

impl DelayedCloseQueues {
    pub(crate) fn new(params: &DriverParams) -> Self {
        Self {
            inner: Mutex::new(Queues::default()),
            file_count: AtomicUsize::new(0),
            dir_count: AtomicUsize::new(0),
            drain_active: AtomicBool::new(false),
            max_files: params.max_delayed_close,
            min_files: params.min_delayed_close,
            max_dirs: params.max_dir_delayed_close,
            min_dirs: params.min_dir_delayed_close,
        }
    }

    pub fn file_backlog(&self) -> usize {
        self.file_count.load(Ordering::SeqCst)
    }

    pub fn dir_backlog(&self) -> usize {
        self.dir_count.load(Ordering::SeqCst)
    }

    pub fn drain_active(&self) -> bool {
        self.drain_active.load(Ordering::SeqCst)
    }
}

/// Park a node whose last handle just closed. Fails when the node must
/// close for real instead (delete pending) or is already parked.
pub(crate) fn schedule(
    vol: &Arc<Volume>,
    node: &Arc<FileNode>,
    tree_length: u32,
) -> Result<(), DriverError> {
    if node.has_flag(FileFlags::DELETE_ON_CLOSE) {
        node.clear_flag(FileFlags::DELAY_CLOSE);
        return Err(DriverError::DeletePending);
    }
    if node.has_flag(FileFlags::DELAY_QUEUED) || node.has_flag(FileFlags::RENAME_POSTED) {
        node.clear_flag(FileFlags::DELAY_CLOSE);
        return Err(DriverError::AlreadyQueued);
    }

    let d = &vol.delayed;
    let is_dir = node.is_directory();
    let entry = DelayedCloseEntry { file: node.id, tree_length };
    let start_drain;
    {
        let mut q = d.inner.lock().unwrap();
        node.set_flag(FileFlags::DELAY_QUEUED);
        if is_dir {
            q.dirs.push_back(entry);
            let count = d.dir_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count > d.max_dirs {
                q.reduce_dirs = true;
            }
            start_drain = q.reduce_dirs;
        } else {
            q.files.push_back(entry);
            let count = d.file_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count > d.max_files {
                q.reduce_files = true;
            }
            start_drain = q.reduce_files;
        }
    }
    if start_drain && !d.drain_active.swap(true, Ordering::SeqCst) {
        let vol = vol.clone();
        tokio::spawn(async move { drain(vol).await });
    }
    Ok(())
}

/// Retire entries oldest-first until both classes are back at their low
/// watermarks. Exactly one drain task runs per volume at a time.
async fn drain(vol: Arc<Volume>) {
    let ledger = LockLedger::new();
    let d = &vol.delayed;
    loop {
        let entry = {
            let mut q = d.inner.lock().unwrap();
            if q.reduce_files && d.file_count.load(Ordering::SeqCst) > d.min_files {
                q.files.pop_front().inspect(|_| {
                    d.file_count.fetch_sub(1, Ordering::SeqCst);
                })
            } else if q.reduce_dirs && d.dir_count.load(Ordering::SeqCst) > d.min_dirs {
                q.dirs.pop_front().inspect(|_| {
                    d.dir_count.fetch_sub(1, Ordering::SeqCst);
                })
            } else {
                q.reduce_files = false;
                q.reduce_dirs = false;
                None
            }
        };
        match entry {
            Some(e) => retire(&vol, e, &ledger).await,
            None => break,
        }
    }
    d.drain_active.store(false, Ordering::SeqCst);
}

/// Revoke a parked entry because its node is being reopened. Returns the
/// parked walk length so the caller can give those references back, or 0
/// when the node was not parked (or a drain already claimed the entry).
pub(crate) fn cancel(vol: &Volume, node: &Arc<FileNode>) -> u32 {
    if !node.has_flag(FileFlags::DELAY_QUEUED) {
        return 0;
    }
    let d = &vol.delayed;
    let mut q = d.inner.lock().unwrap();
    let entry = if let Some(pos) = q.files.iter().position(|e| e.file == node.id) {
        d.file_count.fetch_sub(1, Ordering::SeqCst);
        q.files.remove(pos)
    } else if let Some(pos) = q.dirs.iter().position(|e| e.file == node.id) {
        d.dir_count.fetch_sub(1, Ordering::SeqCst);
        q.dirs.remove(pos)
    } else {
        // a drain popped it first; retire settles the references
        None
    };
    match entry {
        Some(e) => {
            node.clear_flag(FileFlags::DELAY_QUEUED);
            e.tree_length
        }
        None => 0,
    }
}

/// Close a parked entry for real. A node reopened after the entry was
/// claimed still gives back the parked walk's references; the new handles
/// keep it alive through the chain.
async fn retire(vol: &Arc<Volume>, entry: DelayedCloseEntry, ledger: &LockLedger) {
    if let Some(node) = vol.files.get(entry.file) {
        node.clear_flag(FileFlags::DELAY_QUEUED);
        if node.open_handles() == 0 {
            node.clear_flag(FileFlags::DELAY_CLOSE);
        } else {
            debug!("vol {}: node {} reopened while parked", vol.id, entry.file);
        }
    }
    if let Err(e) = close::cleanup_chain(vol, entry.file, entry.tree_length, ledger).await {
        debug!("vol {}: delayed close of {}: {}", vol.id, entry.file, e);
    }
}

/// Drain both classes completely, ignoring the low watermarks.
pub(crate) async fn close_all(vol: &Arc<Volume>, ledger: &LockLedger) {
    let drained: Vec<DelayedCloseEntry> = {
        let mut q = vol.delayed.inner.lock().unwrap();
        vol.delayed.file_count.store(0, Ordering::SeqCst);
        vol.delayed.dir_count.store(0, Ordering::SeqCst);
        let mut all: Vec<DelayedCloseEntry> = q.files.drain(..).collect();
        all.extend(q.dirs.drain(..));
        all
    };
    for entry in drained {
        retire(vol, entry, ledger).await;
    }
}

/// What a subtree drain selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Only nodes parked on the delayed-close queues; they are dequeued
    /// and closed.
    Queued,
    /// Every handleless-but-referenced node; dirty metadata is flushed and
    /// the cached metadata handle purged, queue membership untouched.
    System,
}

/// Drain the subtree under `root` according to `policy`.
///
/// Enumeration happens under the volume lock held exclusively; matching
/// nodes are pinned in a worklist of strong references because the lock is
/// dropped before the per-node work, which reacquires it shared. The
/// worklist is serviced newest-first so children retire before parents.
pub(crate) async fn close_all_in_subtree(
    vol: &Arc<Volume>,
    root: FileId,
    policy: DrainPolicy,
    ledger: &LockLedger,
) -> Result<(), DriverError> {
    if !ledger.check_before_acquire(Rank::Volume, vol.id, Mode::Exclusive) {
        return Err(DriverError::Internal);
    }
    let matched: Vec<Arc<FileNode>> = {
        ledger.note(Rank::Volume, vol.id, Mode::Exclusive);
        let _vs = vol.state.write().await;
        let mut seen: HashSet<FileId> = HashSet::new();
        let mut found = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = vol.files.get(id) else { continue };
            let st = node.main.read().await;
            stack.extend(st.children.values().copied());
            let selected = match policy {
                DrainPolicy::Queued => node.has_flag(FileFlags::DELAY_QUEUED),
                DrainPolicy::System => {
                    node.open_handles() == 0
                        && node.ref_count.load(Ordering::SeqCst) > 0
                        && st.meta.is_some()
                }
            };
            drop(st);
            if selected {
                found.push(node);
            }
        }
        ledger.done(Rank::Volume, vol.id);
        found
    };

    if matched.is_empty() {
        return Ok(());
    }
    debug!(
        "vol {}: subtree drain under {} selected {} nodes ({:?})",
        vol.id,
        root,
        matched.len(),
        policy
    );

    match policy {
        DrainPolicy::System => {
            let was_suppressed = vol.has_vflag(VolumeFlags::NO_DELAYED_CLOSE);
            vol.set_vflag(VolumeFlags::NO_DELAYED_CLOSE);
            let mut first_err: Option<DriverError> = None;
            for node in matched.iter().rev() {
                ledger.note(Rank::Volume, vol.id, Mode::Shared);
                let _vs = vol.state.read().await;
                ledger.note(Rank::File, node.id, Mode::Exclusive);
                let mut st = node.main.write().await;
                let mut flushed = Ok(());
                if !node.has_flag(FileFlags::DELETED) {
                    if let Some(meta) = &st.meta {
                        if meta.is_dirty() {
                            flushed = meta.flush().await;
                        }
                    }
                }
                match flushed {
                    Ok(()) => {
                        st.meta.take();
                    }
                    // a failed flush keeps the handle so a retry can still
                    // reach the dirty state
                    Err(e) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
                drop(st);
                ledger.done(Rank::File, node.id);
                ledger.done(Rank::Volume, vol.id);
            }
            if !was_suppressed {
                vol.clear_vflag(VolumeFlags::NO_DELAYED_CLOSE);
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        }
        DrainPolicy::Queued => {
            for node in matched.iter().rev() {
                let entry = {
                    let mut q = vol.delayed.inner.lock().unwrap();
                    if let Some(pos) = q.files.iter().position(|e| e.file == node.id) {
                        vol.delayed.file_count.fetch_sub(1, Ordering::SeqCst);
                        q.files.remove(pos)
                    } else if let Some(pos) = q.dirs.iter().position(|e| e.file == node.id) {
                        vol.delayed.dir_count.fetch_sub(1, Ordering::SeqCst);
                        q.dirs.remove(pos)
                    } else {
                        None
                    }
                };
                if let Some(entry) = entry {
                    retire(vol, entry, ledger).await;
                }
            }
        }
    }
    Ok(())
}
