use std::time::Duration;

use pagecompiler_service::error::Operation;
use pagecompiler_service::{CompilerEvent, ControllerState, LifecycleError};
use pagecompiler_test::{TestDriver, next_event};

use crate::utils::{compile, ready, setup_compiler};

#[tokio::test]
async fn test_dispatch_requires_start() {
    let driver = TestDriver::new();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    assert_eq!(compiler.state(), ControllerState::Inactive);

    assert!(compiler.request(5, true).is_miss());
    assert!(driver.calls().is_empty());

    compiler.start().unwrap();
    assert_eq!(compiler.state(), ControllerState::Active);
    assert!(compiler.request(5, true).is_not_ready());
    assert_eq!(driver.calls(), vec![5]);
    assert_eq!(next_event(&mut events).await, ready(&[5]));
}

#[tokio::test]
async fn test_stop_discards_pending_work() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    driver.release(1);
    compile(&compiler, &mut events, 7).await;

    assert!(compiler.request(1, true).is_not_ready());
    assert!(compiler.request(2, true).is_not_ready());
    assert_eq!(compiler.in_flight(), 2);

    compiler.stop().unwrap();
    assert_eq!(compiler.state(), ControllerState::Inactive);
    assert_eq!(compiler.in_flight(), 0);
    assert_eq!(compiler.cached_pages(), 0);
    assert_eq!(compiler.cache_cost(), 0);
    assert!(compiler.request(7, false).is_miss());
    assert!(compiler.request(1, true).is_miss());

    // the cancelled computations never report back
    driver.release(2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(driver.calls(), vec![7, 1, 2]);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(1, true).is_not_ready());
    compiler.stop().unwrap();
    compiler.start().unwrap();

    // the cancelled computation does not block a new one
    assert!(compiler.request(1, true).is_not_ready());
    assert_eq!(driver.compile_count(1), 2);

    driver.release(1);
    assert_eq!(next_event(&mut events).await, ready(&[1]));
    assert!(compiler.request(1, false).cached().is_some());
}

#[tokio::test]
async fn test_reset() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    driver.release(1);
    compile(&compiler, &mut events, 7).await;
    assert!(compiler.request(1, true).is_not_ready());

    compiler.reset().unwrap();
    assert_eq!(compiler.state(), ControllerState::Active);
    assert_eq!(next_event(&mut events).await, CompilerEvent::all_changed());

    assert_eq!(compiler.in_flight(), 0);
    assert!(compiler.request(7, false).is_miss());

    // still active, so new work is accepted right away
    assert!(compiler.request(7, true).is_not_ready());
    driver.release(1);
    assert_eq!(next_event(&mut events).await, ready(&[7]));
}

#[tokio::test]
async fn test_invalid_lifecycle_calls() {
    let driver = TestDriver::new();
    let (compiler, _events) = setup_compiler(&driver, 1_000);

    assert_eq!(
        compiler.stop(),
        Err(LifecycleError::InvalidState {
            operation: Operation::Stop,
            state: ControllerState::Inactive,
        })
    );
    assert_eq!(
        compiler.reset(),
        Err(LifecycleError::InvalidState {
            operation: Operation::Reset,
            state: ControllerState::Inactive,
        })
    );
    assert_eq!(compiler.state(), ControllerState::Inactive);

    compiler.start().unwrap();
    assert_eq!(
        compiler.start(),
        Err(LifecycleError::InvalidState {
            operation: Operation::Start,
            state: ControllerState::Active,
        })
    );
    assert_eq!(compiler.state(), ControllerState::Active);
}
