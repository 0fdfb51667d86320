//! Volume registry: mount entry point, lookup, the periodic sweep for
//! volumes that finished dismounting, and host shutdown.

use crate::config::DriverParams;
use crate::error::DriverError;
use crate::store::{BlockDevice, DriverEvent, EventSink, MetadataStore, RangeLockService};
use crate::volume::{Volume, VolumeCondition};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct Registry {
    volumes: RwLock<HashMap<u64, Arc<Volume>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            volumes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mount a volume: probe the medium, validate the on-disk structure
    /// (falling back to a raw mount when permitted), then publish the
    /// volume as `Mounted`. Failure before publication leaves no trace.
    pub async fn mount(
        self: &Arc<Self>,
        device: Arc<dyn BlockDevice>,
        store: Arc<dyn MetadataStore>,
        range_locks: Arc<dyn RangeLockService>,
        events: Arc<dyn EventSink>,
        params: DriverParams,
    ) -> Result<Arc<Volume>, DriverError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DriverError::VolumeUnavailable);
        }
        // medium probe comes first; no structure without readable media
        device.read_blocks(0, 1).await?;

        let mut raw = false;
        if let Err(e) = store.validate().await {
            if params.features.allow_raw_mount {
                events.log_event(DriverEvent::MountFallback, "structure validation failed");
                warn!("structure validation failed ({e}), mounting raw");
                raw = true;
            } else {
                return Err(e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let vol = Volume::new(
            id,
            params,
            device,
            store,
            range_locks,
            events,
            raw,
            Arc::downgrade(self),
        );
        {
            let mut st = vol.state.write().await;
            vol.set_condition(&mut st, VolumeCondition::Mounted);
        }
        {
            let mut vols = self.volumes.write().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                // lost the race against shutdown; never publish
                vol.invalidate();
                return Err(DriverError::VolumeUnavailable);
            }
            vols.insert(id, vol.clone());
        }
        info!("vol {}: mounted{}", id, if raw { " (raw)" } else { "" });
        Ok(vol)
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Volume>> {
        self.volumes.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.volumes.read().await.is_empty()
    }

    pub(crate) async fn deregister(&self, id: u64) {
        if self.volumes.write().await.remove(&id).is_some() {
            info!("vol {}: deregistered", id);
        }
    }

    /// Sweep for volumes whose dismount can now complete. Non-blocking;
    /// a volume that is still draining is picked up by a later sweep.
    pub async fn scan_for_dismounted(self: &Arc<Self>) {
        let candidates: Vec<Arc<Volume>> = {
            let vols = self.volumes.read().await;
            vols.values()
                .filter(|v| {
                    matches!(
                        v.condition(),
                        VolumeCondition::DismountInProgress | VolumeCondition::Invalid
                    ) || (v.condition() == VolumeCondition::NotMounted
                        && v.open_count() <= v.residual_remaining())
                })
                .cloned()
                .collect()
        };
        for vol in candidates {
            vol.check_for_dismount(false).await;
        }
    }

    /// Host shutdown: refuse new mounts, then run every volume through
    /// the forced-teardown ladder.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let vols: Vec<Arc<Volume>> = self.volumes.read().await.values().cloned().collect();
        for vol in vols {
            vol.shutdown().await;
        }
        self.volumes.write().await.clear();
        info!("registry: shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemDevice, MemStore, NullRangeLocks, RecordingEventSink};

    fn backing() -> (
        Arc<MemDevice>,
        Arc<MemStore>,
        Arc<NullRangeLocks>,
        Arc<RecordingEventSink>,
    ) {
        let store = Arc::new(MemStore::new());
        store.add_entry(1, "f", false, 8, 64);
        (
            Arc::new(MemDevice::new(64)),
            store,
            Arc::new(NullRangeLocks::default()),
            Arc::new(RecordingEventSink::default()),
        )
    }

    #[tokio::test]
    async fn mount_publishes_a_mounted_volume() {
        let reg = Registry::new();
        let (dev, store, locks, events) = backing();
        let vol = reg
            .mount(dev, store, locks, events, DriverParams::default())
            .await
            .unwrap();
        assert_eq!(vol.condition(), VolumeCondition::Mounted);
        assert_eq!(reg.len().await, 1);
        assert!(reg.get(vol.id).await.is_some());
    }

    #[tokio::test]
    async fn invalid_structure_without_raw_fallback_fails() {
        let reg = Registry::new();
        let (dev, store, locks, events) = backing();
        store.set_valid(false);
        let err = reg
            .mount(dev, store, locks, events, DriverParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Media(_)));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_structure_with_raw_fallback_mounts_degraded() {
        let reg = Registry::new();
        let (dev, store, locks, events) = backing();
        store.set_valid(false);
        let mut params = DriverParams::default();
        params.features.allow_raw_mount = true;
        let vol = reg
            .mount(dev, store, locks, events.clone(), params)
            .await
            .unwrap();
        assert!(vol.has_vflag(crate::volume::VolumeFlags::RAW_MOUNT));
        assert!(events
            .events()
            .iter()
            .any(|(e, _)| *e == DriverEvent::MountFallback));
    }

    #[tokio::test]
    async fn sweep_releases_invalidated_volumes() {
        let reg = Registry::new();
        let (dev, store, locks, events) = backing();
        let vol = reg
            .mount(dev, store, locks, events, DriverParams::default())
            .await
            .unwrap();
        vol.surprise_remove().await;
        reg.scan_for_dismounted().await;
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_mounts() {
        let reg = Registry::new();
        let (dev, store, locks, events) = backing();
        reg.shutdown().await;
        let err = reg
            .mount(dev, store, locks, events, DriverParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::VolumeUnavailable);
    }
}
