//! Seams to the out-of-scope collaborators: physical block I/O, the on-disk
//! metadata layer, the byte-range lock service and the event sink. The core
//! creates, flushes and releases cached metadata but never interprets it.
//!
//! The in-memory implementations at the bottom serve development and tests.

use crate::error::DriverError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Fixed logical block size for the volumes this driver serves.
pub const BLOCK_SIZE: usize = 2048;

/// What the metadata layer knows about one on-disk object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Stable on-disk identifier, distinct from the in-memory arena id.
    pub object: u64,
    pub directory: bool,
    /// First block of the object's (linearized) data extent.
    pub base_lba: u64,
    pub size: u64,
}

/// Physical sector I/O. Invoked only while the relevant object lock is held
/// per the hierarchy.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    async fn read_blocks(&self, lba: u64, count: u32) -> Result<Bytes, DriverError>;
    async fn write_blocks(&self, lba: u64, data: &[u8]) -> Result<(), DriverError>;
    fn block_count(&self) -> u64;
}

/// Opaque decoded on-disk state attached to a file object. Owned by the
/// metadata layer; the core only flushes it and drops it on final cleanup.
#[async_trait]
pub trait CachedMetadata: Send + Sync {
    fn is_dirty(&self) -> bool;
    fn mark_dirty(&self);
    async fn flush(&self) -> Result<(), DriverError>;
}

/// On-disk decode/encode layer.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Structural validation at mount time. Failure triggers the raw/blank
    /// fallback rather than propagating.
    async fn validate(&self) -> Result<(), DriverError>;
    fn root(&self) -> ObjectInfo;
    async fn lookup(&self, parent: u64, name: &str) -> Result<Option<ObjectInfo>, DriverError>;
    async fn attach(&self, object: u64) -> Result<Box<dyn CachedMetadata>, DriverError>;
    /// Physically delete the object. Callers must keep in-memory state
    /// retry-consistent when this fails.
    async fn unlink(&self, object: u64) -> Result<(), DriverError>;
    async fn flush_volume(&self) -> Result<(), DriverError>;
}

/// Byte-range lock bookkeeping, delegated to an external service. The core
/// only gates fast-path admission through it while `main` is held.
pub trait RangeLockService: Send + Sync {
    fn check_access(&self, object: u64, offset: u64, len: usize, write: bool) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    InternalError,
    MediaFailure,
    MountFallback,
    ForcedDismount,
}

/// Fire-and-forget notification sink. Failures in here must never reach the
/// core's control flow, so the interface is infallible by construction.
pub trait EventSink: Send + Sync {
    fn log_event(&self, event: DriverEvent, detail: &str);
}

// ---------------------------------------------------------------------------
// in-memory implementations
// ---------------------------------------------------------------------------

/// Block device backed by a memory map, with an optional per-read latency
/// and concurrency probes so dispatcher tests can observe parallelism.
pub struct MemDevice {
    blocks: Mutex<HashMap<u64, Bytes>>,
    block_count: u64,
    latency: Option<std::time::Duration>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    access_log: Mutex<Vec<u64>>,
    fail_reads: AtomicBool,
}

impl MemDevice {
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
            latency: None,
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            access_log: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn with_latency(block_count: u64, latency: std::time::Duration) -> Self {
        let mut d = Self::new(block_count);
        d.latency = Some(latency);
        d
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Highest number of concurrently outstanding reads observed.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// LBAs in the order reads reached the device.
    pub fn access_log(&self) -> Vec<u64> {
        self.access_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockDevice for MemDevice {
    async fn read_blocks(&self, lba: u64, count: u32) -> Result<Bytes, DriverError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::Media("read failure injected".into()));
        }
        if lba + count as u64 > self.block_count {
            return Err(DriverError::Media(format!("read past end of device: {lba}")));
        }
        let cur = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(cur, Ordering::SeqCst);
        self.access_log.lock().unwrap().push(lba);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut out = Vec::with_capacity(count as usize * BLOCK_SIZE);
        {
            let blocks = self.blocks.lock().unwrap();
            for i in 0..count as u64 {
                match blocks.get(&(lba + i)) {
                    Some(b) => out.extend_from_slice(b),
                    None => out.extend_from_slice(&[0u8; BLOCK_SIZE]),
                }
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Bytes::from(out))
    }

    async fn write_blocks(&self, lba: u64, data: &[u8]) -> Result<(), DriverError> {
        if lba + data.len().div_ceil(BLOCK_SIZE) as u64 > self.block_count {
            return Err(DriverError::Media(format!("write past end of device: {lba}")));
        }
        let mut blocks = self.blocks.lock().unwrap();
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut block = vec![0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            blocks.insert(lba + i as u64, Bytes::from(block));
        }
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

pub struct MemMetadata {
    object: u64,
    dirty: AtomicBool,
    flushes: std::sync::Arc<AtomicUsize>,
    fail_flush: std::sync::Arc<AtomicBool>,
}

#[async_trait]
impl CachedMetadata for MemMetadata {
    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn flush(&self) -> Result<(), DriverError> {
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(DriverError::Media("metadata flush failure injected".into()));
        }
        log::debug!("flush metadata for object {}", self.object);
        self.dirty.store(false, Ordering::SeqCst);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Metadata store over a static namespace description, enough to exercise
/// open/lookup/unlink against a small tree.
pub struct MemStore {
    root: ObjectInfo,
    entries: Mutex<HashMap<(u64, String), ObjectInfo>>,
    valid: AtomicBool,
    next_object: AtomicUsize,
    flushes: std::sync::Arc<AtomicUsize>,
    volume_flushes: AtomicUsize,
    unlinked: Mutex<Vec<u64>>,
    fail_unlink: AtomicBool,
    fail_meta_flush: std::sync::Arc<AtomicBool>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            root: ObjectInfo { object: 1, directory: true, base_lba: 0, size: 0 },
            entries: Mutex::new(HashMap::new()),
            valid: AtomicBool::new(true),
            next_object: AtomicUsize::new(2),
            flushes: std::sync::Arc::new(AtomicUsize::new(0)),
            volume_flushes: AtomicUsize::new(0),
            unlinked: Mutex::new(Vec::new()),
            fail_unlink: AtomicBool::new(false),
            fail_meta_flush: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Populate a child entry; directories get a zero extent.
    pub fn add_entry(&self, parent: u64, name: &str, directory: bool, base_lba: u64, size: u64) -> u64 {
        let object = self.next_object.fetch_add(1, Ordering::SeqCst) as u64;
        self.entries.lock().unwrap().insert(
            (parent, name.to_string()),
            ObjectInfo { object, directory, base_lba, size },
        );
        object
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_fail_unlink(&self, fail: bool) {
        self.fail_unlink.store(fail, Ordering::SeqCst);
    }

    /// Make every cached-metadata flush attached by this store fail.
    pub fn set_fail_meta_flush(&self, fail: bool) {
        self.fail_meta_flush.store(fail, Ordering::SeqCst);
    }

    pub fn metadata_flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn volume_flushes(&self) -> usize {
        self.volume_flushes.load(Ordering::SeqCst)
    }

    pub fn unlinked(&self) -> Vec<u64> {
        self.unlinked.lock().unwrap().clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemStore {
    async fn validate(&self) -> Result<(), DriverError> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::Media("structural validation failed".into()))
        }
    }

    fn root(&self) -> ObjectInfo {
        self.root
    }

    async fn lookup(&self, parent: u64, name: &str) -> Result<Option<ObjectInfo>, DriverError> {
        Ok(self.entries.lock().unwrap().get(&(parent, name.to_string())).copied())
    }

    async fn attach(&self, object: u64) -> Result<Box<dyn CachedMetadata>, DriverError> {
        Ok(Box::new(MemMetadata {
            object,
            dirty: AtomicBool::new(false),
            flushes: self.flushes.clone(),
            fail_flush: self.fail_meta_flush.clone(),
        }))
    }

    async fn unlink(&self, object: u64) -> Result<(), DriverError> {
        if self.fail_unlink.load(Ordering::SeqCst) {
            return Err(DriverError::Media("unlink failure injected".into()));
        }
        self.entries.lock().unwrap().retain(|_, info| info.object != object);
        self.unlinked.lock().unwrap().push(object);
        Ok(())
    }

    async fn flush_volume(&self) -> Result<(), DriverError> {
        self.volume_flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Range-lock service that admits everything except explicitly denied
/// objects; tests use the deny list to exercise the admission gate.
#[derive(Default)]
pub struct NullRangeLocks {
    denied: Mutex<Vec<u64>>,
}

impl NullRangeLocks {
    pub fn deny(&self, object: u64) {
        self.denied.lock().unwrap().push(object);
    }
}

impl RangeLockService for NullRangeLocks {
    fn check_access(&self, object: u64, _offset: u64, _len: usize, _write: bool) -> bool {
        !self.denied.lock().unwrap().contains(&object)
    }
}

/// Sink that forwards to the `log` facade and remembers what it saw.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(DriverEvent, String)>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<(DriverEvent, String)> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn log_event(&self, event: DriverEvent, detail: &str) {
        log::info!("event {:?}: {}", event, detail);
        self.events.lock().unwrap().push((event, detail.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_device_round_trip_and_holes() {
        let dev = MemDevice::new(64);
        dev.write_blocks(3, &[7u8; BLOCK_SIZE]).await.unwrap();
        let data = dev.read_blocks(2, 2).await.unwrap();
        assert_eq!(&data[..BLOCK_SIZE], &[0u8; BLOCK_SIZE][..]);
        assert_eq!(&data[BLOCK_SIZE..], &[7u8; BLOCK_SIZE][..]);
        assert!(dev.read_blocks(63, 2).await.is_err());
    }

    #[tokio::test]
    async fn mem_store_lookup_and_unlink() {
        let store = MemStore::new();
        let obj = store.add_entry(1, "a.bin", false, 10, 4096);
        let info = store.lookup(1, "a.bin").await.unwrap().unwrap();
        assert_eq!(info.object, obj);
        store.unlink(obj).await.unwrap();
        assert!(store.lookup(1, "a.bin").await.unwrap().is_none());
        assert_eq!(store.unlinked(), vec![obj]);
    }

    #[tokio::test]
    async fn metadata_dirty_flush_cycle() {
        let store = MemStore::new();
        let meta = store.attach(5).await.unwrap();
        assert!(!meta.is_dirty());
        meta.mark_dirty();
        assert!(meta.is_dirty());
        meta.flush().await.unwrap();
        assert!(!meta.is_dirty());
        assert_eq!(store.metadata_flushes(), 1);
    }
}
