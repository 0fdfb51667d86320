//! Handle close and the cascading leaf-to-root cleanup walk.
//!
//! Closing the last handle on an object does not free it immediately; the
//! object may instead park on a delayed-close queue. The real release work
//! is [`cleanup_chain`], which walks from a node toward the root, dropping
//! one traversal and one liveness reference per step while a budget lasts
//! and freeing nodes whose counts reach zero. A retry after a mid-walk
//! failure resumes with budget 0 so no reference is ever dropped twice.

use crate::delayed;
use crate::error::DriverError;
use crate::hier::{LockLedger, Mode, Rank};
use crate::object::{FileFlags, FileId, FileNode, FileState, HandleFlags, HandleId};
use crate::volume::{Volume, VolumeCondition, VolumeFlags, VolumeState};
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};

/// Close a handle. Volume handles release their root reference and may
/// trigger teardown; file handles either park on the delayed-close queue
/// or run the cleanup chain inline.
pub(crate) async fn close_handle(
    vol: &Arc<Volume>,
    handle: HandleId,
    ledger: &LockLedger,
) -> Result<(), DriverError> {
    let h = vol.take_handle(handle).ok_or(DriverError::NotFound)?;

    if h.has_flag(HandleFlags::VOLUME_OPEN) {
        {
            ledger.note(Rank::Volume, vol.id, Mode::Shared);
            let _vs = vol.state.read().await;
            if let Some(root) = vol.files.get(vol.root) {
                root.ref_count.fetch_sub(1, Ordering::SeqCst);
                root.common_ref_count.fetch_sub(1, Ordering::SeqCst);
            }
            vol.dec_open_count();
            ledger.done(Rank::Volume, vol.id);
        }
        let teardown = h.has_flag(HandleFlags::DISMOUNT_ON_CLOSE)
            || matches!(
                vol.condition(),
                VolumeCondition::DismountInProgress | VolumeCondition::Invalid
            )
            || (vol.condition() == VolumeCondition::NotMounted
                && vol.open_count() <= vol.residual_remaining());
        if teardown {
            vol.check_for_dismount(true).await;
        }
        return Ok(());
    }

    let node = vol.files.get(h.file).ok_or(DriverError::NotFound)?;
    if !node.detach_handle(handle) {
        warn!("vol {}: double close of handle {}", vol.id, handle);
        return Err(DriverError::InvalidParameter);
    }
    vol.dec_open_count();
    if h.has_flag(HandleFlags::ACCESSED) && !h.has_flag(HandleFlags::READ_ONLY) {
        let st = node.main.read().await;
        if let Some(meta) = &st.meta {
            meta.mark_dirty();
        }
    }

    let delay_eligible = node.has_flag(FileFlags::DELAY_CLOSE)
        && !node.has_flag(FileFlags::PAGE_FILE)
        && node.open_handles() == 0
        && vol.condition() == VolumeCondition::Mounted
        && !vol.has_vflag(VolumeFlags::NO_DELAYED_CLOSE);
    if delay_eligible {
        match delayed::schedule(vol, &node, h.tree_length) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("vol {}: delayed close refused ({}), closing now", vol.id, e),
        }
    }

    cleanup_chain(vol, h.file, h.tree_length, ledger).await
}

enum ParentGuard<'a> {
    File(RwLockWriteGuard<'a, FileState>),
    Volume(RwLockReadGuard<'a, VolumeState>),
}

/// Walk from `start` toward the root, releasing one traversal and one
/// liveness reference per node while `budget` lasts.
///
/// Per node, parent-before-child: the parent's main lock exclusive (or the
/// volume lock shared at the root), then the node's main lock exclusive.
/// Both are released before the walk advances, child before parent. When
/// the traversal count reaches zero with no open handles the node is
/// deleted or its metadata flushed; when the liveness count also reaches
/// zero it is freed and a `DELETE_PARENT` mark propagates one level up.
/// A liveness count still above zero leaves the node visible and, if the
/// budget is spent, stops the walk.
///
/// On a mid-walk store failure the error propagates after all locks held
/// for that node are released; counts already dropped stay dropped, so the
/// caller retries with budget 0.
pub(crate) async fn cleanup_chain(
    vol: &Volume,
    start: FileId,
    budget: u32,
    ledger: &LockLedger,
) -> Result<(), DriverError> {
    let mut budget = budget;
    let mut delete_next = false;
    let mut cur = Some(start);

    while let Some(id) = cur {
        let Some(node) = vol.files.get(id) else { break };
        let parent_node: Option<Arc<FileNode>> =
            node.parent.and_then(|p| vol.files.get(p));

        let (parent_rank, parent_owner, parent_mode) = match &parent_node {
            Some(p) => (Rank::File, p.id, Mode::Exclusive),
            None => (Rank::Volume, vol.id, Mode::Shared),
        };
        if !ledger.check_before_acquire(parent_rank, parent_owner, parent_mode)
            || !ledger.check_before_acquire(Rank::File, id, Mode::Exclusive)
        {
            return Err(DriverError::Internal);
        }
        ledger.note(parent_rank, parent_owner, parent_mode);
        let mut parent_guard = match &parent_node {
            Some(p) => ParentGuard::File(p.main.write().await),
            None => ParentGuard::Volume(vol.state.read().await),
        };
        ledger.note(Rank::File, id, Mode::Exclusive);
        let mut st = node.main.write().await;

        let (refs, liveness) = if budget > 0 {
            budget -= 1;
            (
                node.ref_count.fetch_sub(1, Ordering::SeqCst) - 1,
                node.common_ref_count.fetch_sub(1, Ordering::SeqCst) - 1,
            )
        } else {
            (
                node.ref_count.load(Ordering::SeqCst),
                node.common_ref_count.load(Ordering::SeqCst),
            )
        };

        let mut freed = false;
        let mut step: Result<(), DriverError> = Ok(());

        if refs == 0 && node.open_handles() == 0 {
            if vol.has_vflag(VolumeFlags::RAW_MOUNT) {
                // no on-disk structure to maintain on a raw mount
                delete_next = false;
            } else if (delete_next || node.has_flag(FileFlags::DELETE_ON_CLOSE))
                && !node.has_flag(FileFlags::DELETED)
            {
                match vol.store.unlink(st.object).await {
                    Ok(()) => {
                        if let ParentGuard::File(pg) = &mut parent_guard {
                            pg.children.remove(&st.name);
                        }
                        node.set_flag(FileFlags::DELETED);
                        delete_next = false;
                    }
                    Err(e) => step = Err(e),
                }
            } else if !node.has_flag(FileFlags::DELETED) {
                if let Some(meta) = &st.meta {
                    if meta.is_dirty() {
                        if let Err(e) = meta.flush().await {
                            step = Err(e);
                        }
                    }
                }
                delete_next = false;
            }

            if step.is_ok() {
                if node.has_flag(FileFlags::DELETE_PARENT) {
                    delete_next = true;
                }
                if liveness == 0 {
                    st.meta.take();
                    if !node.has_flag(FileFlags::DELETED) {
                        if let ParentGuard::File(pg) = &mut parent_guard {
                            pg.children.remove(&st.name);
                        }
                    }
                    freed = true;
                }
                // liveness > 0: another path still pins the shared state;
                // leave the node visible
            }
        } else {
            delete_next = false;
        }

        // child before parent
        drop(st);
        ledger.done(Rank::File, id);
        drop(parent_guard);
        ledger.done(parent_rank, parent_owner);

        if freed {
            vol.files.remove(id);
            debug!("vol {}: freed node {} ({:?})", vol.id, id, node.parent);
        }
        step?;

        if !freed && budget == 0 {
            break;
        }
        cur = node.parent;
    }
    Ok(())
}
