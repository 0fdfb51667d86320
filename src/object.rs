//! In-memory file objects and open handles.
//!
//! A [`FileNode`] is shared by every handle open against one on-disk object.
//! Nodes live in the per-volume [`FileTable`] arena and refer to their
//! parents by [`FileId`], never by owning pointer, so the parent/child and
//! object/handle back-references cannot form ownership cycles. A node may
//! only leave the arena once both `common_ref_count` and
//! `open_handle_count` are zero.

use crate::store::CachedMetadata;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Stable arena index of a file object within its volume.
pub type FileId = u64;
/// Identifier of one open instance.
pub type HandleId = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const DIRECTORY      = 1 << 0;
        /// Object has been physically deleted; skip further flushes.
        const DELETED        = 1 << 1;
        const DELETE_ON_CLOSE = 1 << 2;
        /// Deleting this node must also force deletion of its parent.
        const DELETE_PARENT  = 1 << 3;
        /// Eligible for delayed close when the last handle goes away.
        const DELAY_CLOSE    = 1 << 4;
        /// Currently sitting on a delayed-close queue.
        const DELAY_QUEUED   = 1 << 5;
        const PAGE_FILE      = 1 << 6;
        /// A rename against this node is posted; defeats delayed close.
        const RENAME_POSTED  = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const READ_ONLY         = 1 << 0;
        /// Handle opened against the volume itself rather than an object.
        const VOLUME_OPEN       = 1 << 1;
        const ACCESSED          = 1 << 2;
        /// Finish volume teardown when this handle closes.
        const DISMOUNT_ON_CLOSE = 1 << 3;
    }
}

/// State guarded by the node's `main` lock.
pub struct FileState {
    pub name: String,
    pub children: HashMap<String, FileId>,
    /// Opaque decoded on-disk state; released by dropping on final cleanup.
    pub meta: Option<Box<dyn CachedMetadata>>,
    /// On-disk object id the metadata layer knows this node by.
    pub object: u64,
    pub base_lba: u64,
    pub size: u64,
}

/// One per uniquely-identified on-disk object.
pub struct FileNode {
    pub id: FileId,
    /// Non-owning back-reference, resolved through the arena. None for the
    /// volume root.
    pub parent: Option<FileId>,
    flags: AtomicU32,
    /// References taken by the current traversal context; decremented one
    /// step per close-walk level. Never exceeds `common_ref_count`.
    pub ref_count: AtomicI64,
    /// Global liveness count across every path to this object.
    pub common_ref_count: AtomicI64,
    pub open_handle_count: AtomicU32,
    pub main: RwLock<FileState>,
    pub paging: RwLock<()>,
    /// Handle list, guarded separately from `main`.
    handles: Mutex<Vec<HandleId>>,
}

impl FileNode {
    pub fn new(id: FileId, parent: Option<FileId>, state: FileState, flags: FileFlags) -> Self {
        Self {
            id,
            parent,
            flags: AtomicU32::new(flags.bits()),
            ref_count: AtomicI64::new(0),
            common_ref_count: AtomicI64::new(0),
            open_handle_count: AtomicU32::new(0),
            main: RwLock::new(state),
            paging: RwLock::new(()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn has_flag(&self, flag: FileFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn set_flag(&self, flag: FileFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: FileFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    pub fn is_directory(&self) -> bool {
        self.has_flag(FileFlags::DIRECTORY)
    }

    /// Take one traversal reference and one liveness reference.
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        self.common_ref_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn attach_handle(&self, handle: HandleId) {
        self.handles.lock().unwrap().push(handle);
        self.open_handle_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Detach a handle from the node's handle list. Returns false when the
    /// handle was not attached (a double close).
    pub fn detach_handle(&self, handle: HandleId) -> bool {
        let mut handles = self.handles.lock().unwrap();
        if let Some(pos) = handles.iter().position(|h| *h == handle) {
            handles.remove(pos);
            self.open_handle_count.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn open_handles(&self) -> u32 {
        self.open_handle_count.load(Ordering::SeqCst)
    }
}

/// Per-open-instance state.
pub struct HandleContext {
    pub id: HandleId,
    pub file: FileId,
    flags: AtomicU32,
    /// Nodes referenced along the open path; the traversal budget the close
    /// walk is allowed to decrement.
    pub tree_length: u32,
}

impl HandleContext {
    pub fn new(id: HandleId, file: FileId, flags: HandleFlags, tree_length: u32) -> Self {
        Self {
            id,
            file,
            flags: AtomicU32::new(flags.bits()),
            tree_length,
        }
    }

    pub fn has_flag(&self, flag: HandleFlags) -> bool {
        HandleFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst)).contains(flag)
    }

    pub fn set_flag(&self, flag: HandleFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }
}

/// Arena of live file objects for one volume.
#[derive(Default)]
pub struct FileTable {
    nodes: Mutex<HashMap<FileId, Arc<FileNode>>>,
    next_id: AtomicU64,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn alloc_id(&self) -> FileId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, node: Arc<FileNode>) {
        self.nodes.lock().unwrap().insert(node.id, node);
    }

    pub fn get(&self, id: FileId) -> Option<Arc<FileNode>> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    /// Detach a node from the arena; the node is freed when the last Arc
    /// drops.
    pub fn remove(&self, id: FileId) -> Option<Arc<FileNode>> {
        self.nodes.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.nodes.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().unwrap().is_empty()
    }

    /// Snapshot of the live nodes, for drains and shutdown sweeps that must
    /// not hold the table lock while acting.
    pub fn snapshot(&self) -> Vec<Arc<FileNode>> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_node(table: &FileTable, parent: Option<FileId>, name: &str) -> Arc<FileNode> {
        let id = table.alloc_id();
        let node = Arc::new(FileNode::new(
            id,
            parent,
            FileState {
                name: name.to_string(),
                children: HashMap::new(),
                meta: None,
                object: id,
                base_lba: 0,
                size: 0,
            },
            FileFlags::empty(),
        ));
        table.insert(node.clone());
        node
    }

    #[test]
    fn handle_attach_detach_counts() {
        let table = FileTable::new();
        let node = bare_node(&table, None, "f");
        node.attach_handle(1);
        node.attach_handle(2);
        assert_eq!(node.open_handles(), 2);
        assert!(node.detach_handle(1));
        assert!(!node.detach_handle(1));
        assert_eq!(node.open_handles(), 1);
    }

    #[test]
    fn flags_are_independent_bits() {
        let table = FileTable::new();
        let node = bare_node(&table, None, "d");
        node.set_flag(FileFlags::DIRECTORY | FileFlags::DELAY_CLOSE);
        node.clear_flag(FileFlags::DELAY_CLOSE);
        assert!(node.is_directory());
        assert!(!node.has_flag(FileFlags::DELAY_CLOSE));
    }

    #[test]
    fn table_remove_detaches_but_arc_survives() {
        let table = FileTable::new();
        let node = bare_node(&table, None, "f");
        let id = node.id;
        let held = table.remove(id).unwrap();
        assert!(!table.contains(id));
        assert_eq!(held.id, id);
    }
}
