//! Dispatcher saturation and randomized interleaving under a
//! multi-threaded runtime.

use libvolfs::config::DriverParams;
use libvolfs::dispatch::{self, Operation};
use libvolfs::registry::Registry;
use libvolfs::store::{MemDevice, MemStore, NullRangeLocks, RecordingEventSink, BLOCK_SIZE};
use libvolfs::volume::{OpenOptions, Volume, VolumeCondition, RESIDUAL_REFERENCE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

async fn mounted(
    reg: &Arc<Registry>,
    params: DriverParams,
    dev: Arc<MemDevice>,
    file_count: usize,
) -> Arc<Volume> {
    let store = Arc::new(MemStore::new());
    for i in 0..file_count {
        store.add_entry(
            1,
            &format!("file{i}"),
            false,
            16 + 4 * i as u64,
            4 * BLOCK_SIZE as u64,
        );
    }
    reg.mount(
        dev,
        store,
        Arc::new(NullRangeLocks::default()),
        Arc::new(RecordingEventSink::default()),
        params,
    )
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn saturation_respects_the_posting_threshold() {
    let reg = Registry::new();
    let mut params = DriverParams::default();
    params.posted_request_threshold = 3;
    let dev = Arc::new(MemDevice::with_latency(1024, Duration::from_millis(15)));
    let vol = mounted(&reg, params, dev.clone(), 8).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let h = dispatch::submit(
            &vol,
            Operation::Open { path: format!("/file{i}"), opts: OpenOptions::default() },
            true,
        )
        .await
        .wait()
        .await
        .unwrap()
        .handle
        .unwrap();
        handles.push(h);
    }

    let mut pending = Vec::new();
    for &h in &handles {
        let sub = dispatch::submit(
            &vol,
            Operation::Read { handle: h, offset: 0, len: BLOCK_SIZE },
            false,
        )
        .await;
        assert!(vol.posted_requests() <= 3);
        pending.push(sub);
    }
    for sub in pending {
        assert_eq!(sub.wait().await.unwrap().data.unwrap().len(), BLOCK_SIZE);
    }
    // the device never saw more readers than the threshold allows
    assert!(dev.max_in_flight() <= 3);
    assert!(dev.max_in_flight() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn randomized_interleaving_settles_to_residual_state() {
    let reg = Registry::new();
    let mut params = DriverParams::default();
    params.posted_request_threshold = 2;
    params.max_delayed_close = 5;
    params.min_delayed_close = 1;
    let dev = Arc::new(MemDevice::new(2048));
    let vol = mounted(&reg, params, dev, 16).await;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut tasks = Vec::new();
    for t in 0..12 {
        let vol = vol.clone();
        let file = rng.random_range(0..16usize);
        let do_write = rng.random_range(0..3u8) == 0;
        let offset = rng.random_range(0..512u64);
        tasks.push(tokio::spawn(async move {
            let h = dispatch::submit(
                &vol,
                Operation::Open { path: format!("/file{file}"), opts: OpenOptions::default() },
                true,
            )
            .await
            .wait()
            .await
            .unwrap()
            .handle
            .unwrap();
            if do_write {
                let data = vec![t as u8; 64];
                dispatch::submit(
                    &vol,
                    Operation::Write { handle: h, offset, data: data.into() },
                    true,
                )
                .await
                .wait()
                .await
                .unwrap();
            } else {
                dispatch::submit(
                    &vol,
                    Operation::Read { handle: h, offset, len: 64 },
                    false,
                )
                .await
                .wait()
                .await
                .unwrap();
            }
            dispatch::submit(&vol, Operation::Close { handle: h }, true)
                .await
                .wait()
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // every handle returned; only parked nodes and residuals remain
    assert_eq!(vol.open_count(), RESIDUAL_REFERENCE);
    assert_eq!(vol.open_handle_total(), 0);
    for _ in 0..100 {
        if vol.posted_requests() == 0 && !vol.delayed_queues().drain_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(vol.posted_requests(), 0);

    // teardown vaporizes whatever the parked queues still pin
    vol.surprise_remove().await;
    assert_eq!(vol.condition(), VolumeCondition::Invalid);
    assert!(vol.files.is_empty());
    assert!(reg.is_empty().await);
}
