//! Tests for the worker pool and the batch engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use cloudctl_core::scheduler::{
    BatchConfig, BatchEngine, BatchHandler, FnHandler, WorkerPool, WorkerPoolConfig,
};
use cloudctl_core::{AgentError, DeviceError};
use futures::future::join_all;

#[tokio::test]
async fn test_concurrency_never_exceeds_thread_count() {
    let pool = WorkerPool::new(WorkerPoolConfig::with_threads(2)).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let ops = (0..8).map(|_| {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        pool.run(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, AgentError>(())
        })
    });
    for result in join_all(ops).await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.stats().tasks_executed, 8);
}

#[tokio::test]
async fn test_backlog_limit_rejects_with_queue_full() {
    let pool = WorkerPool::new(WorkerPoolConfig {
        num_threads: 1,
        queue_size: 1,
        ..WorkerPoolConfig::default()
    })
    .unwrap();

    let (release, gate) = mpsc::channel::<()>();
    pool.spawn_detached("blocker", move || {
        let _ = gate.recv();
        Ok::<_, AgentError>(())
    })
    .unwrap();
    while pool.stats().active == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    pool.spawn_detached("queued", || Ok::<_, AgentError>(())).unwrap();
    let err = pool
        .spawn_detached("overflow", || Ok::<_, AgentError>(()))
        .unwrap_err();
    assert_eq!(err, DeviceError::QueueFull);

    release.send(()).unwrap();
}

#[tokio::test]
async fn test_run_after_shutdown_is_rejected() {
    let pool = WorkerPool::new(WorkerPoolConfig::with_threads(1)).unwrap();
    pool.shutdown();
    assert!(pool.is_shutdown());
    let err = pool.run(|| Ok::<_, AgentError>(())).await.unwrap_err();
    assert_eq!(err, DeviceError::ShuttingDown);
}

fn counting_handler(calls: Arc<AtomicUsize>) -> Arc<dyn BatchHandler<u32, u32>> {
    Arc::new(FnHandler(move |n: u32| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DeviceError>(n + 100)
        }
    }))
}

#[tokio::test]
async fn test_groups_fail_independently() {
    let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
        batch_size: 6,
        flush_interval: Duration::from_millis(20),
    });
    let touches = Arc::new(AtomicUsize::new(0));
    engine.register_handler("touch", counting_handler(Arc::clone(&touches)));
    engine.register_handler(
        "input",
        Arc::new(FnHandler(|n: u32| async move {
            if n == 2 {
                Err(DeviceError::Unavailable("keyboard gone".into()))
            } else {
                Ok(n)
            }
        })),
    );
    assert!(engine.start());

    let a = engine.submit("touch", 1);
    let b = engine.submit("input", 2);
    let c = engine.submit("touch", 3);
    let d = engine.submit("input", 4);
    let e = engine.submit("swipe", 5);

    assert_eq!(a.await, Ok(101));
    assert_eq!(b.await, Err(DeviceError::Unavailable("keyboard gone".into())));
    assert_eq!(c.await, Ok(103));
    assert_eq!(d.await, Ok(4), "a failed item does not fail its group");
    assert_eq!(e.await, Err(DeviceError::Unrecognized("swipe".into())));
    assert_eq!(touches.load(Ordering::SeqCst), 2);

    engine.stop().await;
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
        batch_size: 2,
        flush_interval: Duration::from_millis(20),
    });
    engine.register_handler(
        "key",
        Arc::new(FnHandler(|n: u32| async move {
            if n == 0 {
                panic!("bad key");
            }
            Ok::<_, DeviceError>(n)
        })),
    );
    engine.start();

    let first = engine.submit("key", 0);
    let second = engine.submit("key", 9);
    assert!(matches!(first.await, Err(DeviceError::Unavailable(_))));
    assert_eq!(second.await, Ok(9));

    // Loop survived the panic.
    assert_eq!(engine.submit("key", 3).await, Ok(3));
    engine.stop().await;
}

#[tokio::test]
async fn test_stop_rejects_later_submissions() {
    let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig::default());
    engine.register_handler("touch", counting_handler(Arc::new(AtomicUsize::new(0))));
    engine.start();
    engine.stop().await;

    assert!(!engine.is_running());
    assert_eq!(engine.submit("touch", 1).await, Err(DeviceError::ShuttingDown));
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_flush_only_finishes_the_in_flight_item() {
    let engine: Arc<BatchEngine<&'static str, u32, u32>> = Arc::new(BatchEngine::new(BatchConfig {
        batch_size: 1,
        flush_interval: Duration::from_millis(10),
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        engine.register_handler(
            "touch",
            Arc::new(FnHandler(move |n: u32| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, DeviceError>(n)
                }
            })),
        );
    }
    engine.start();

    let items: Vec<_> = (0..5).map(|n| engine.submit("touch", n)).collect();
    let stopper = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.stop().await;
        })
    };

    let results = join_all(items).await;
    stopper.await.unwrap();

    assert_eq!(results[0], Ok(0));
    for result in &results[1..] {
        assert!(matches!(result, Err(DeviceError::Cancelled(_))), "{result:?}");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().pending, 0);
}

#[tokio::test]
async fn test_stats_track_flushes() {
    let engine: BatchEngine<&'static str, u32, u32> = BatchEngine::new(BatchConfig {
        batch_size: 3,
        flush_interval: Duration::from_millis(10),
    });
    engine.register_handler("touch", counting_handler(Arc::new(AtomicUsize::new(0))));
    engine.start();

    let items: Vec<_> = (0..3).map(|n| engine.submit("touch", n)).collect();
    for item in join_all(items).await {
        item.unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.pending, 0);
    assert!(stats.flushed_batches >= 1);
    engine.stop().await;
}
