//! Tests for graceful shutdown coordination.

use std::time::Duration;

use cloudctl_core::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};
use cloudctl_core::DeviceError;

#[tokio::test]
async fn test_initial_state_is_running() {
    let coordinator = ShutdownCoordinator::new();
    assert_eq!(coordinator.state(), ShutdownState::Running);
    assert!(coordinator.is_accepting());
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_work() {
    let coordinator = ShutdownCoordinator::new();
    let guard = coordinator.track().unwrap();

    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
    });

    let result = coordinator.initiate(Duration::from_secs(2)).await;
    assert_eq!(result, ShutdownResult::Complete);
    assert_eq!(coordinator.in_flight_count(), 0);
    worker.await.unwrap();
}

#[tokio::test]
async fn test_no_new_work_while_draining() {
    let coordinator = ShutdownCoordinator::new();
    let guard = coordinator.track().unwrap();

    let draining = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.initiate(Duration::from_secs(2)).await })
    };
    while coordinator.state() == ShutdownState::Running {
        tokio::task::yield_now().await;
    }

    assert_eq!(coordinator.state(), ShutdownState::Draining);
    assert!(matches!(coordinator.track(), Err(DeviceError::ShuttingDown)));
    assert_eq!(coordinator.in_flight_count(), 1);

    drop(guard);
    assert_eq!(draining.await.unwrap(), ShutdownResult::Complete);
    assert_eq!(coordinator.state(), ShutdownState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_drain_timeout_reports_remaining() {
    let coordinator = ShutdownCoordinator::new();
    let _a = coordinator.track().unwrap();
    let _b = coordinator.track().unwrap();

    let result = coordinator.initiate(Duration::from_secs(5)).await;
    assert_eq!(result, ShutdownResult::Timeout { remaining: 2 });
    assert_eq!(coordinator.state(), ShutdownState::Stopped);
}
