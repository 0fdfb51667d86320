//! Per-volume state and the mount/dismount state machine.
//!
//! A [`Volume`] owns the file-object arena, the dispatcher's overflow queue,
//! the delayed-close queues and the volume-wide lock. Its `condition` moves
//! `NotMounted -> Mounted -> DismountInProgress -> Invalid` (terminal); the
//! raw-mount degraded path is treated as `Mounted` for queuing and locking.
//! Condition transitions happen only while the volume lock is held
//! exclusively, except the terminal transition to `Invalid`, which is an
//! idempotent atomic swap so it can race with teardown.

use crate::close;
use crate::config::DriverParams;
use crate::delayed::{self, DelayedCloseQueues, DrainPolicy};
use crate::dispatch::DispatchQueue;
use crate::error::DriverError;
use crate::hier::{LockLedger, Mode, Rank};
use crate::object::{
    FileFlags, FileId, FileNode, FileState, FileTable, HandleContext, HandleFlags, HandleId,
};
use crate::registry::Registry;
use crate::store::{
    BlockDevice, DriverEvent, EventSink, MetadataStore, RangeLockService, BLOCK_SIZE,
};
use bitflags::bitflags;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

/// References a volume keeps for itself (the root object and internal
/// bookkeeping); teardown is legal only at or below this count.
pub const RESIDUAL_REFERENCE: u32 = 2;

/// Teardown backoff while waiting for the dispatcher to drain.
const TEARDOWN_BACKOFF: Duration = Duration::from_millis(10);
const TEARDOWN_MAX_POLLS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeCondition {
    NotMounted = 0,
    Mounted = 1,
    DismountInProgress = 2,
    Invalid = 3,
}

impl VolumeCondition {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => VolumeCondition::NotMounted,
            1 => VolumeCondition::Mounted,
            2 => VolumeCondition::DismountInProgress,
            _ => VolumeCondition::Invalid,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VolumeFlags: u32 {
        const NO_DELAYED_CLOSE = 1 << 0;
        const READ_ONLY        = 1 << 1;
        /// Structural validation failed; mounted raw/degraded.
        const RAW_MOUNT        = 1 << 2;
        const SHUTDOWN         = 1 << 3;
        const REMOVABLE        = 1 << 4;
        const VOLUME_LOCKED    = 1 << 5;
    }
}

/// State guarded by the volume-wide lock.
pub struct VolumeState {
    /// Handle that holds the volume lock, if any.
    pub lock_holder: Option<HandleId>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read_only: bool,
    pub delete_on_close: bool,
    pub page_file: bool,
}

/// In-memory state for one mounted volume.
pub struct Volume {
    pub id: u64,
    pub params: DriverParams,
    condition: AtomicU8,
    flags: AtomicU32,
    /// Residual + user references; teardown requires this at or below
    /// [`RESIDUAL_REFERENCE`].
    open_count: AtomicU32,
    /// Set once the residual references were given back; the release runs
    /// at most once even when teardown is reached via several ladders.
    residual_released: AtomicBool,
    /// The volume-wide lock (rank `Volume` in the hierarchy).
    pub state: RwLock<VolumeState>,
    /// Overflow FIFO and worker counters; short critical sections only.
    pub(crate) queue: Mutex<DispatchQueue>,
    pub(crate) delayed: DelayedCloseQueues,
    pub files: FileTable,
    pub root: FileId,
    handles: Mutex<HashMap<HandleId, Arc<HandleContext>>>,
    next_handle: AtomicU64,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) range_locks: Arc<dyn RangeLockService>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) registry: Weak<Registry>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("condition", &self.condition())
            .field("open_count", &self.open_count())
            .finish_non_exhaustive()
    }
}

impl Volume {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        params: DriverParams,
        device: Arc<dyn BlockDevice>,
        store: Arc<dyn MetadataStore>,
        range_locks: Arc<dyn RangeLockService>,
        events: Arc<dyn EventSink>,
        raw: bool,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let mut flags = VolumeFlags::empty();
        if params.features.read_only {
            flags |= VolumeFlags::READ_ONLY;
        }
        if params.features.no_delayed_close {
            flags |= VolumeFlags::NO_DELAYED_CLOSE;
        }
        if params.features.removable {
            flags |= VolumeFlags::REMOVABLE;
        }
        if raw {
            flags |= VolumeFlags::RAW_MOUNT;
        }

        let files = FileTable::new();
        let root_id = files.alloc_id();
        let root_info = store.root();
        let root = Arc::new(FileNode::new(
            root_id,
            None,
            FileState {
                name: "/".to_string(),
                children: HashMap::new(),
                meta: None,
                object: root_info.object,
                base_lba: root_info.base_lba,
                size: root_info.size,
            },
            FileFlags::DIRECTORY,
        ));
        // the mount-time residual reference on the root
        root.reference();
        files.insert(root);

        Arc::new(Self {
            id,
            delayed: DelayedCloseQueues::new(&params),
            params,
            condition: AtomicU8::new(VolumeCondition::NotMounted as u8),
            flags: AtomicU32::new(flags.bits()),
            open_count: AtomicU32::new(RESIDUAL_REFERENCE),
            residual_released: AtomicBool::new(false),
            state: RwLock::new(VolumeState { lock_holder: None }),
            queue: Mutex::new(DispatchQueue::new()),
            files,
            root: root_id,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            device,
            store,
            range_locks,
            events,
            registry,
        })
    }

    // -- condition & flags ---------------------------------------------------

    pub fn condition(&self) -> VolumeCondition {
        VolumeCondition::from_u8(self.condition.load(Ordering::SeqCst))
    }

    /// Transition the condition. Requires the volume lock held exclusively,
    /// witnessed by the state guard.
    pub(crate) fn set_condition(&self, _state: &mut VolumeState, condition: VolumeCondition) {
        self.condition.store(condition as u8, Ordering::SeqCst);
    }

    /// Terminal transition; may race with teardown and is idempotent.
    pub fn invalidate(&self) -> VolumeCondition {
        VolumeCondition::from_u8(
            self.condition
                .swap(VolumeCondition::Invalid as u8, Ordering::SeqCst),
        )
    }

    pub fn volume_flags(&self) -> VolumeFlags {
        VolumeFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn has_vflag(&self, flag: VolumeFlags) -> bool {
        self.volume_flags().contains(flag)
    }

    pub(crate) fn set_vflag(&self, flag: VolumeFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_vflag(&self, flag: VolumeFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_open_count(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_open_count(&self) {
        self.open_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Residual references still counted in `open_count`.
    pub(crate) fn residual_remaining(&self) -> u32 {
        if self.residual_released.load(Ordering::SeqCst) {
            0
        } else {
            RESIDUAL_REFERENCE
        }
    }

    /// Delayed-close bookkeeping, exposed for observation.
    pub fn delayed_queues(&self) -> &DelayedCloseQueues {
        &self.delayed
    }

    /// Worker tasks currently servicing this volume.
    pub fn posted_requests(&self) -> u32 {
        self.queue.lock().unwrap().posted
    }

    pub fn overflow_backlog(&self) -> usize {
        self.queue.lock().unwrap().overflow.len()
    }

    fn mounted_gate(&self) -> Result<(), DriverError> {
        match self.condition() {
            VolumeCondition::Mounted => Ok(()),
            VolumeCondition::Invalid => Err(DriverError::VolumeUnavailable),
            _ => Err(DriverError::VolumeNotMounted),
        }
    }

    // -- handles -------------------------------------------------------------

    pub fn handle(&self, id: HandleId) -> Option<Arc<HandleContext>> {
        self.handles.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn take_handle(&self, id: HandleId) -> Option<Arc<HandleContext>> {
        self.handles.lock().unwrap().remove(&id)
    }

    fn insert_handle(&self, handle: Arc<HandleContext>) {
        self.handles.lock().unwrap().insert(handle.id, handle);
    }

    pub fn open_handle_total(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    // -- open paths ----------------------------------------------------------

    fn components(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Open an on-disk object by path, materializing file objects along the
    /// way. Every node on the path takes one traversal and one liveness
    /// reference; the handle remembers the walk length so close can unwind
    /// exactly what open referenced.
    pub async fn open(
        &self,
        path: &str,
        opts: OpenOptions,
        ledger: &LockLedger,
    ) -> Result<HandleId, DriverError> {
        self.mounted_gate()?;
        if opts.delete_on_close && self.has_vflag(VolumeFlags::READ_ONLY) {
            return Err(DriverError::AccessDenied);
        }

        ledger.note(Rank::Volume, self.id, Mode::Shared);
        let vs = self.state.read().await;

        let mut referenced: Vec<FileId> = Vec::new();
        let result = self.walk_path(path, &mut referenced).await;
        let target = match result {
            Ok(id) => id,
            Err(e) => {
                ledger.done(Rank::Volume, self.id);
                drop(vs);
                // give the walk's references back and free whatever it
                // materialized that nothing else holds
                if let Some(&deepest) = referenced.last() {
                    if let Err(ce) =
                        close::cleanup_chain(self, deepest, referenced.len() as u32, ledger).await
                    {
                        debug!("vol {}: unwind of failed open {}: {}", self.id, path, ce);
                    }
                }
                return Err(e);
            }
        };

        let node = self.files.get(target).ok_or(DriverError::NotFound)?;
        if opts.delete_on_close {
            node.set_flag(FileFlags::DELETE_ON_CLOSE);
            node.clear_flag(FileFlags::DELAY_CLOSE);
        }
        if opts.page_file {
            node.set_flag(FileFlags::PAGE_FILE);
            node.clear_flag(FileFlags::DELAY_CLOSE);
        }

        let mut hflags = HandleFlags::empty();
        if opts.read_only {
            hflags |= HandleFlags::READ_ONLY;
        }
        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(HandleContext::new(
            handle_id,
            target,
            hflags,
            referenced.len() as u32,
        ));
        node.attach_handle(handle_id);
        self.inc_open_count();
        self.insert_handle(handle);

        ledger.done(Rank::Volume, self.id);
        drop(vs);

        // a reopen revokes any parked delayed close; the parked walk's
        // references come back here while the new handle pins the node
        let parked = delayed::cancel(self, &node);
        if parked > 0 {
            if let Err(e) = close::cleanup_chain(self, target, parked, ledger).await {
                debug!("vol {}: revoking parked close of {}: {}", self.id, target, e);
            }
        }

        debug!(
            "vol {}: opened {} as handle {} (tree length {})",
            self.id,
            path,
            handle_id,
            referenced.len()
        );
        Ok(handle_id)
    }

    async fn walk_path(
        &self,
        path: &str,
        referenced: &mut Vec<FileId>,
    ) -> Result<FileId, DriverError> {
        let mut cur = self.root;
        let root = self.files.get(cur).ok_or(DriverError::NotFound)?;
        root.reference();
        referenced.push(cur);

        for comp in Self::components(path) {
            let node = self.files.get(cur).ok_or(DriverError::NotFound)?;
            if !node.is_directory() {
                return Err(DriverError::NotADirectory);
            }
            let existing = {
                let st = node.main.read().await;
                st.children.get(comp).copied()
            };
            let child_id = match existing {
                Some(id) => id,
                None => self.materialize_child(&node, comp).await?,
            };
            let child = self.files.get(child_id).ok_or(DriverError::NotFound)?;
            child.reference();
            referenced.push(child_id);
            cur = child_id;
        }
        Ok(cur)
    }

    /// Bring a directory entry into the arena, consulting the metadata
    /// layer. Caller must not hold the parent's main lock.
    async fn materialize_child(
        &self,
        parent: &Arc<FileNode>,
        name: &str,
    ) -> Result<FileId, DriverError> {
        let mut st = parent.main.write().await;
        // lost the race to another opener?
        if let Some(&id) = st.children.get(name) {
            return Ok(id);
        }
        let info = self
            .store
            .lookup(st.object, name)
            .await?
            .ok_or(DriverError::NotFound)?;
        let meta = self.store.attach(info.object).await?;
        let id = self.files.alloc_id();
        let mut flags = FileFlags::DELAY_CLOSE;
        if info.directory {
            flags |= FileFlags::DIRECTORY;
        }
        let node = Arc::new(FileNode::new(
            id,
            Some(parent.id),
            FileState {
                name: name.to_string(),
                children: HashMap::new(),
                meta: Some(meta),
                object: info.object,
                base_lba: info.base_lba,
                size: info.size,
            },
            flags,
        ));
        self.files.insert(node);
        st.children.insert(name.to_string(), id);
        Ok(id)
    }

    /// Resolve a path against the in-memory tree without referencing or
    /// materializing anything.
    pub async fn peek_path(&self, path: &str) -> Option<FileId> {
        let mut cur = self.root;
        for comp in Self::components(path) {
            let node = self.files.get(cur)?;
            let st = node.main.read().await;
            cur = *st.children.get(comp)?;
        }
        self.files.get(cur).map(|n| n.id)
    }

    /// Open a handle against the volume itself, used for lock/dismount
    /// control operations.
    pub async fn open_volume(&self) -> Result<HandleId, DriverError> {
        self.mounted_gate()?;
        let _vs = self.state.read().await;
        let root = self.files.get(self.root).ok_or(DriverError::NotFound)?;
        root.reference();
        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.insert_handle(Arc::new(HandleContext::new(
            handle_id,
            self.root,
            HandleFlags::VOLUME_OPEN,
            0,
        )));
        self.inc_open_count();
        Ok(handle_id)
    }

    // -- data paths ----------------------------------------------------------

    /// Fast-path read: admission via the external range-lock service under
    /// `main`, then block I/O under the paging lock.
    pub async fn read(
        &self,
        handle: HandleId,
        offset: u64,
        len: usize,
        ledger: &LockLedger,
    ) -> Result<Bytes, DriverError> {
        self.mounted_gate()?;
        let h = self.handle(handle).ok_or(DriverError::NotFound)?;
        if h.has_flag(HandleFlags::VOLUME_OPEN) {
            return Err(DriverError::InvalidParameter);
        }
        let node = self.files.get(h.file).ok_or(DriverError::NotFound)?;
        if node.is_directory() {
            return Err(DriverError::IsADirectory);
        }

        ledger.note(Rank::File, node.id, Mode::Shared);
        let st = node.main.read().await;
        if !self
            .range_locks
            .check_access(st.object, offset, len, false)
        {
            ledger.done(Rank::File, node.id);
            return Err(DriverError::AccessDenied);
        }
        if offset >= st.size || len == 0 {
            ledger.done(Rank::File, node.id);
            return Ok(Bytes::new());
        }
        let len = len.min((st.size - offset) as usize);

        ledger.note(Rank::Paging, node.id, Mode::Shared);
        let _pg = node.paging.read().await;
        let first = offset / BLOCK_SIZE as u64;
        let skip = (offset % BLOCK_SIZE as u64) as usize;
        let blocks = (skip + len).div_ceil(BLOCK_SIZE) as u32;
        let data = self.device.read_blocks(st.base_lba + first, blocks).await;
        ledger.done(Rank::Paging, node.id);
        ledger.done(Rank::File, node.id);
        let data = data?;
        h.set_flag(HandleFlags::ACCESSED);
        Ok(data.slice(skip..skip + len))
    }

    /// Fast-path write; read-modify-write on the covering blocks.
    pub async fn write(
        &self,
        handle: HandleId,
        offset: u64,
        data: &[u8],
        ledger: &LockLedger,
    ) -> Result<usize, DriverError> {
        self.mounted_gate()?;
        if self.has_vflag(VolumeFlags::READ_ONLY) {
            return Err(DriverError::AccessDenied);
        }
        let h = self.handle(handle).ok_or(DriverError::NotFound)?;
        if h.has_flag(HandleFlags::VOLUME_OPEN) {
            return Err(DriverError::InvalidParameter);
        }
        if h.has_flag(HandleFlags::READ_ONLY) {
            return Err(DriverError::AccessDenied);
        }
        let node = self.files.get(h.file).ok_or(DriverError::NotFound)?;
        if node.is_directory() {
            return Err(DriverError::IsADirectory);
        }

        ledger.note(Rank::File, node.id, Mode::Exclusive);
        let mut st = node.main.write().await;
        if !self
            .range_locks
            .check_access(st.object, offset, data.len(), true)
        {
            ledger.done(Rank::File, node.id);
            return Err(DriverError::AccessDenied);
        }

        ledger.note(Rank::Paging, node.id, Mode::Exclusive);
        let result = async {
            let _pg = node.paging.write().await;
            let first = offset / BLOCK_SIZE as u64;
            let skip = (offset % BLOCK_SIZE as u64) as usize;
            let blocks = (skip + data.len()).div_ceil(BLOCK_SIZE) as u32;
            let mut buf = self
                .device
                .read_blocks(st.base_lba + first, blocks)
                .await?
                .to_vec();
            buf[skip..skip + data.len()].copy_from_slice(data);
            self.device.write_blocks(st.base_lba + first, &buf).await
        }
        .await;
        ledger.done(Rank::Paging, node.id);

        match result {
            Ok(()) => {
                st.size = st.size.max(offset + data.len() as u64);
                if let Some(meta) = &st.meta {
                    meta.mark_dirty();
                }
                ledger.done(Rank::File, node.id);
                h.set_flag(HandleFlags::ACCESSED);
                Ok(data.len())
            }
            Err(e) => {
                ledger.done(Rank::File, node.id);
                Err(e)
            }
        }
    }

    /// Flush every dirty cached-metadata handle, then the store itself.
    pub async fn flush_all(&self) -> Result<(), DriverError> {
        for node in self.files.snapshot() {
            let st = node.main.read().await;
            if let Some(meta) = &st.meta {
                if meta.is_dirty() {
                    meta.flush().await?;
                }
            }
        }
        self.store.flush_volume().await
    }

    // -- volume control ------------------------------------------------------

    fn volume_open_gate(&self, handle: HandleId) -> Result<Arc<HandleContext>, DriverError> {
        let h = self.handle(handle).ok_or(DriverError::InvalidParameter)?;
        if !h.has_flag(HandleFlags::VOLUME_OPEN) {
            return Err(DriverError::InvalidParameter);
        }
        Ok(h)
    }

    /// Lock the volume for exclusive maintenance. Forces a full
    /// delayed-close drain and a volume flush first; admits only the last
    /// remaining user handle.
    pub async fn lock_volume(
        self: &Arc<Self>,
        handle: HandleId,
        ledger: &LockLedger,
    ) -> Result<(), DriverError> {
        self.volume_open_gate(handle)?;
        self.mounted_gate()?;

        if !self.has_vflag(VolumeFlags::RAW_MOUNT) {
            delayed::close_all_in_subtree(self, self.root, DrainPolicy::System, ledger).await?;
        }
        delayed::close_all(self, ledger).await;
        self.flush_all().await?;

        ledger.note(Rank::Volume, self.id, Mode::Exclusive);
        let mut st = self.state.write().await;
        let admitted = !self.has_vflag(VolumeFlags::VOLUME_LOCKED)
            && st.lock_holder.is_none()
            && self.open_count() <= self.residual_remaining() + 1;
        let res = if admitted {
            self.set_vflag(VolumeFlags::VOLUME_LOCKED);
            st.lock_holder = Some(handle);
            info!("vol {}: locked by handle {}", self.id, handle);
            Ok(())
        } else {
            debug!(
                "vol {}: lock denied (open_count {}, locked {})",
                self.id,
                self.open_count(),
                self.has_vflag(VolumeFlags::VOLUME_LOCKED)
            );
            Err(DriverError::AccessDenied)
        };
        drop(st);
        ledger.done(Rank::Volume, self.id);
        res
    }

    pub async fn unlock_volume(
        self: &Arc<Self>,
        handle: HandleId,
        ledger: &LockLedger,
    ) -> Result<(), DriverError> {
        self.volume_open_gate(handle)?;
        ledger.note(Rank::Volume, self.id, Mode::Exclusive);
        let mut st = self.state.write().await;
        let res = if st.lock_holder == Some(handle) {
            st.lock_holder = None;
            self.clear_vflag(VolumeFlags::VOLUME_LOCKED);
            Ok(())
        } else {
            Err(DriverError::NotLocked)
        };
        drop(st);
        ledger.done(Rank::Volume, self.id);
        res
    }

    /// Dismount a volume locked by this handle. Yields
    /// `DismountInProgress` when the residual cleanup fully vaporized the
    /// in-memory tree, `Invalid` otherwise; never a silent no-op.
    pub async fn dismount(
        self: &Arc<Self>,
        handle: HandleId,
        ledger: &LockLedger,
    ) -> Result<(), DriverError> {
        let h = self.volume_open_gate(handle)?;

        {
            let st = self.state.read().await;
            if self.condition() != VolumeCondition::Mounted {
                return Err(DriverError::VolumeNotMounted);
            }
            if !self.has_vflag(VolumeFlags::VOLUME_LOCKED)
                || self.open_count() > self.residual_remaining() + 1
            {
                return Err(DriverError::NotLocked);
            }
            if st.lock_holder != Some(handle) {
                return Err(DriverError::InvalidParameter);
            }
        }

        let vaporized = self.dismount_sequence(ledger).await;
        let mut st = self.state.write().await;
        if vaporized {
            self.set_condition(&mut st, VolumeCondition::DismountInProgress);
        } else if self.condition() != VolumeCondition::DismountInProgress {
            self.set_condition(&mut st, VolumeCondition::Invalid);
        }
        drop(st);

        // the final close of this handle completes the teardown
        h.set_flag(HandleFlags::DISMOUNT_ON_CLOSE);
        info!(
            "vol {}: dismount requested, condition {:?}",
            self.id,
            self.condition()
        );
        Ok(())
    }

    /// Suppress new delayed closes, drain everything, and release the
    /// residual references. Returns whether the in-memory tree is gone.
    pub(crate) async fn dismount_sequence(self: &Arc<Self>, ledger: &LockLedger) -> bool {
        self.set_vflag(VolumeFlags::NO_DELAYED_CLOSE);
        if !self.has_vflag(VolumeFlags::RAW_MOUNT) {
            if let Err(e) =
                delayed::close_all_in_subtree(self, self.root, DrainPolicy::System, ledger).await
            {
                debug!("vol {}: system drain during dismount: {}", self.id, e);
            }
        }
        delayed::close_all(self, ledger).await;
        self.close_residual(ledger).await;
        !self.files.contains(self.root)
    }

    /// Release the references the volume holds for itself: the root chain
    /// and the internal bookkeeping reference. One-shot; later calls only
    /// sweep the root in case an outstanding walk kept it pinned.
    pub(crate) async fn close_residual(self: &Arc<Self>, ledger: &LockLedger) {
        if !self.residual_released.swap(true, Ordering::SeqCst) {
            if self.files.contains(self.root) {
                if let Err(e) = close::cleanup_chain(self, self.root, 1, ledger).await {
                    warn!("vol {}: residual cleanup: {}", self.id, e);
                }
            }
            let residual = self.open_count.load(Ordering::SeqCst).min(RESIDUAL_REFERENCE);
            self.open_count.fetch_sub(residual, Ordering::SeqCst);
        } else if self.files.contains(self.root) {
            if let Err(e) = close::cleanup_chain(self, self.root, 0, ledger).await {
                warn!("vol {}: residual sweep: {}", self.id, e);
            }
        }
    }

    /// Surprise removal / device invalidation. Runs the forced teardown
    /// ladder and waits for the dispatcher to drain.
    pub async fn surprise_remove(self: &Arc<Self>) {
        let ledger = LockLedger::new();
        self.events
            .log_event(DriverEvent::ForcedDismount, "surprise removal");
        self.set_vflag(VolumeFlags::NO_DELAYED_CLOSE);
        delayed::close_all(self, &ledger).await;
        self.close_residual(&ledger).await;
        if self.condition() != VolumeCondition::DismountInProgress {
            self.invalidate();
        }
        self.check_for_dismount(true).await;
    }

    /// Host shutdown; identical ladder with the shutdown marker set.
    pub async fn shutdown(self: &Arc<Self>) {
        self.set_vflag(VolumeFlags::SHUTDOWN);
        self.surprise_remove().await;
    }

    /// Tear the volume down if (or once, when `can_wait`) the residual
    /// threshold is reached and no worker remains posted. Returns whether
    /// the volume was released.
    pub(crate) async fn check_for_dismount(self: &Arc<Self>, can_wait: bool) -> bool {
        let mut polls = 0u32;
        loop {
            let posted = self.posted_requests();
            let opens = self.open_count();
            if opens <= self.residual_remaining() && posted == 0 {
                break;
            }
            if !can_wait {
                return false;
            }
            polls += 1;
            if polls > TEARDOWN_MAX_POLLS {
                warn!(
                    "vol {}: teardown stalled (open_count {}, posted {})",
                    self.id, opens, posted
                );
                return false;
            }
            tokio::time::sleep(TEARDOWN_BACKOFF).await;
        }

        let ledger = LockLedger::new();
        self.close_residual(&ledger).await;
        {
            let mut st = self.state.write().await;
            self.set_condition(&mut st, VolumeCondition::Invalid);
            st.lock_holder = None;
        }
        self.queue.lock().unwrap().stopped = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id).await;
        }
        info!("vol {}: released", self.id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemDevice, MemStore, NullRangeLocks, RecordingEventSink};

    async fn mounted_volume() -> (Arc<Volume>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        store.add_entry(1, "a.bin", false, 4, 3 * BLOCK_SIZE as u64);
        let dev = Arc::new(MemDevice::new(256));
        let vol = Volume::new(
            1,
            DriverParams::default(),
            dev,
            store.clone(),
            Arc::new(NullRangeLocks::default()),
            Arc::new(RecordingEventSink::default()),
            false,
            Weak::new(),
        );
        {
            let mut st = vol.state.write().await;
            vol.set_condition(&mut st, VolumeCondition::Mounted);
        }
        (vol, store)
    }

    #[tokio::test]
    async fn open_references_whole_path() {
        let (vol, store) = mounted_volume().await;
        store.add_entry(1, "dir", true, 0, 0);
        store.add_entry(store.lookup(1, "dir").await.unwrap().unwrap().object, "f", false, 8, 10);
        let ledger = LockLedger::new();
        let h = vol.open("/dir/f", OpenOptions::default(), &ledger).await.unwrap();
        let handle = vol.handle(h).unwrap();
        assert_eq!(handle.tree_length, 3); // root, dir, f
        let root = vol.files.get(vol.root).unwrap();
        // mount residual + this open
        assert_eq!(root.common_ref_count.load(Ordering::SeqCst), 2);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn open_missing_object_unwinds_references() {
        let (vol, _) = mounted_volume().await;
        let ledger = LockLedger::new();
        let err = vol.open("/nope", OpenOptions::default(), &ledger).await.unwrap_err();
        assert_eq!(err, DriverError::NotFound);
        let root = vol.files.get(vol.root).unwrap();
        assert_eq!(root.common_ref_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_midpath_open_frees_materialized_nodes() {
        let (vol, store) = mounted_volume().await;
        store.add_entry(1, "dir", true, 0, 0);
        let dir_obj = store.lookup(1, "dir").await.unwrap().unwrap().object;
        store.add_entry(dir_obj, "plain", false, 8, 4);
        let ledger = LockLedger::new();
        let err = vol
            .open("/dir/plain/x", OpenOptions::default(), &ledger)
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::NotADirectory);
        // nothing the failed walk materialized stays reachable
        assert!(vol.peek_path("/dir").await.is_none());
        assert_eq!(vol.files.len(), 1);
        let root = vol.files.get(vol.root).unwrap();
        assert_eq!(root.common_ref_count.load(Ordering::SeqCst), 1);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn two_opens_share_one_node() {
        let (vol, _) = mounted_volume().await;
        let ledger = LockLedger::new();
        let h1 = vol.open("/a.bin", OpenOptions::default(), &ledger).await.unwrap();
        let h2 = vol.open("/a.bin", OpenOptions::default(), &ledger).await.unwrap();
        let f1 = vol.handle(h1).unwrap().file;
        let f2 = vol.handle(h2).unwrap().file;
        assert_eq!(f1, f2);
        assert_eq!(vol.files.get(f1).unwrap().open_handles(), 2);
    }

    #[tokio::test]
    async fn read_write_round_trip_and_admission() {
        let (vol, store) = mounted_volume().await;
        let ledger = LockLedger::new();
        let h = vol.open("/a.bin", OpenOptions::default(), &ledger).await.unwrap();
        let payload = vec![0xA5u8; 100];
        let n = vol.write(h, 10, &payload, &ledger).await.unwrap();
        assert_eq!(n, 100);
        let back = vol.read(h, 10, 100, &ledger).await.unwrap();
        assert_eq!(&back[..], &payload[..]);

        // conflicting byte-range lock denies admission
        let locks = Arc::new(NullRangeLocks::default());
        locks.deny(store.lookup(1, "a.bin").await.unwrap().unwrap().object);
        let vol2 = Volume::new(
            2,
            DriverParams::default(),
            Arc::new(MemDevice::new(256)),
            store.clone(),
            locks,
            Arc::new(RecordingEventSink::default()),
            false,
            Weak::new(),
        );
        {
            let mut st = vol2.state.write().await;
            vol2.set_condition(&mut st, VolumeCondition::Mounted);
        }
        let h2 = vol2.open("/a.bin", OpenOptions::default(), &ledger).await.unwrap();
        assert_eq!(
            vol2.read(h2, 0, 8, &ledger).await.unwrap_err(),
            DriverError::AccessDenied
        );
    }

    #[tokio::test]
    async fn read_only_handle_rejects_write() {
        let (vol, _) = mounted_volume().await;
        let ledger = LockLedger::new();
        let h = vol
            .open("/a.bin", OpenOptions { read_only: true, ..Default::default() }, &ledger)
            .await
            .unwrap();
        assert_eq!(
            vol.write(h, 0, b"x", &ledger).await.unwrap_err(),
            DriverError::AccessDenied
        );
    }

    #[tokio::test]
    async fn lock_requires_last_handle() {
        let (vol, _) = mounted_volume().await;
        let ledger = LockLedger::new();
        let vh = vol.open_volume().await.unwrap();
        let extra = vol.open("/a.bin", OpenOptions::default(), &ledger).await.unwrap();
        assert_eq!(
            vol.lock_volume(vh, &ledger).await.unwrap_err(),
            DriverError::AccessDenied
        );
        crate::close::close_handle(&vol, extra, &ledger).await.unwrap();
        vol.lock_volume(vh, &ledger).await.unwrap();
        assert!(vol.has_vflag(VolumeFlags::VOLUME_LOCKED));
        vol.unlock_volume(vh, &ledger).await.unwrap();
        assert!(!vol.has_vflag(VolumeFlags::VOLUME_LOCKED));
    }

    #[tokio::test]
    async fn dismount_requires_lock_and_is_never_a_noop() {
        let (vol, _) = mounted_volume().await;
        let ledger = LockLedger::new();
        let vh = vol.open_volume().await.unwrap();
        assert_eq!(
            vol.dismount(vh, &ledger).await.unwrap_err(),
            DriverError::NotLocked
        );
        vol.lock_volume(vh, &ledger).await.unwrap();
        vol.dismount(vh, &ledger).await.unwrap();
        assert!(matches!(
            vol.condition(),
            VolumeCondition::DismountInProgress | VolumeCondition::Invalid
        ));
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let (vol, _) = mounted_volume().await;
        assert_eq!(vol.invalidate(), VolumeCondition::Mounted);
        assert_eq!(vol.invalidate(), VolumeCondition::Invalid);
        assert_eq!(vol.condition(), VolumeCondition::Invalid);
    }
}
