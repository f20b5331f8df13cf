//! Mutual exclusion across providers sharing one IPC database file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zstate_store::config::IpcConfig;
use zstate_store::ipc::{
    DownMarker, FileDownMarker, MemoryDownMarker, MutexPolicy, SqliteIpcProvider,
};
use zstate_store::{InterProcessData, IpcProvider, IpcType};

async fn provider(
    config: &IpcConfig,
    down: Arc<dyn DownMarker>,
    policy: MutexPolicy,
) -> SqliteIpcProvider {
    SqliteIpcProvider::connect(config, down)
        .await
        .unwrap()
        .with_policy(policy)
}

fn config(dir: &tempfile::TempDir) -> IpcConfig {
    IpcConfig {
        database: dir.path().join("ipc.db"),
        down_lock_file: dir.path().join("ipc-down"),
        ..IpcConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_holder_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let policy = MutexPolicy {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(2),
    };

    let holders = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();

    for _ in 0..4 {
        // Each task plays a separate process with its own pool.
        let ipc = InterProcessData::with_provider(
            IpcType(42),
            Arc::new(provider(&config, Arc::new(MemoryDownMarker::new()), policy).await),
        );
        let holders = Arc::clone(&holders);
        let peak = Arc::clone(&peak);

        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let ran = ipc
                    .locked(|| async {
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        holders.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
                assert!(ran.is_some());
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn waiter_gives_up_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let holder = provider(
        &config,
        Arc::new(MemoryDownMarker::new()),
        MutexPolicy {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        },
    )
    .await;
    let waiter = provider(
        &config,
        Arc::new(MemoryDownMarker::new()),
        MutexPolicy {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        },
    )
    .await;

    assert!(holder.block_mutex(IpcType(7)).await.is_some());

    let started = Instant::now();
    assert!(waiter.block_mutex(IpcType(7)).await.is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "gave up after {elapsed:?}");

    // Other partitions are independent.
    assert!(holder.block_mutex(IpcType(8)).await.is_some());
}

#[tokio::test]
async fn down_marker_file_is_shared() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let fast = MutexPolicy {
        timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
    };

    let slow = MutexPolicy {
        timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(5),
    };

    let holder = provider(&config, Arc::new(MemoryDownMarker::new()), slow).await;
    let marker = || Arc::new(FileDownMarker::new(&config.down_lock_file));
    let a = provider(&config, marker(), fast).await;
    let b = provider(&config, marker(), fast).await;

    assert!(holder.block_mutex(IpcType(1)).await.is_some());
    assert!(a.block_mutex(IpcType(1)).await.is_none());

    // `b` never failed itself but sees the marker.
    assert!(!b.is_active().await);
    assert!(b.block_mutex(IpcType(2)).await.is_none());
}
