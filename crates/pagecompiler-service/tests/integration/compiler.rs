use std::time::Duration;

use pagecompiler_service::{CompileError, CompilerEvent, ControllerState, Lookup};
use pagecompiler_test::{DEFAULT_PAGE_SIZE, TestDriver, UNMEASURABLE_SIZE, next_event};

use crate::utils::{compile, ready, setup_compiler};

#[tokio::test]
async fn test_single_flight() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(1, true).is_not_ready());
    assert!(compiler.request(1, true).is_not_ready());
    assert!(compiler.request(1, false).is_not_ready());

    assert_eq!(driver.calls(), vec![1]);
    assert_eq!(compiler.in_flight(), 1);
    assert!(compiler.is_compiling(&1));

    driver.release(1);
    assert_eq!(next_event(&mut events).await, ready(&[1]));

    let page = compiler.request(1, false).cached().unwrap();
    assert_eq!(page.page, 1);
    assert_eq!(page.content, "page 1");
    assert_eq!(page.size, DEFAULT_PAGE_SIZE);

    assert!(!compiler.is_compiling(&1));
    assert_eq!(compiler.in_flight(), 0);
    assert_eq!(driver.compile_count(1), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    let requests = (0..16).map(|_| {
        let compiler = compiler.clone();
        tokio::spawn(async move { compiler.request(3, true).is_not_ready() })
    });
    for request in futures::future::join_all(requests).await {
        assert!(request.unwrap());
    }
    assert_eq!(driver.calls(), vec![3]);

    driver.release(1);
    assert_eq!(next_event(&mut events).await, ready(&[3]));
    assert!(compiler.request(3, false).cached().is_some());
    assert_eq!(driver.compile_count(3), 1);
}

#[tokio::test]
async fn test_cached_pages_are_shared() {
    let driver = TestDriver::new();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    compile(&compiler, &mut events, 8).await;

    let first = compiler.request(8, true).cached().unwrap();
    let second = compiler.request(8, true).cached().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(driver.compile_count(8), 1);
}

#[tokio::test]
async fn test_miss_without_compile() {
    let driver = TestDriver::new();
    let (compiler, _events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(3, false).is_miss());
    assert!(driver.calls().is_empty());
    assert_eq!(compiler.in_flight(), 0);
}

#[tokio::test]
async fn test_failure_is_reported() {
    let driver = TestDriver::new();
    driver.fail(2, "broken content stream");
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(2, true).is_not_ready());
    assert_eq!(
        next_event(&mut events).await,
        CompilerEvent::Failed {
            key: 2,
            error: CompileError::Failed("broken content stream".into()),
        }
    );

    // nothing is cached, and nothing is retried on its own
    assert!(compiler.request(2, false).is_miss());
    assert_eq!(compiler.cached_pages(), 0);
    assert_eq!(driver.compile_count(2), 1);

    // a new request simply tries again
    driver.heal(2);
    compile(&compiler, &mut events, 2).await;
    assert_eq!(driver.compile_count(2), 2);
}

#[tokio::test]
async fn test_failure_is_local_to_its_page() {
    let driver = TestDriver::gated();
    driver.fail(1, "bad page");
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(1, true).is_not_ready());
    assert!(compiler.request(2, true).is_not_ready());
    driver.release(2);

    let mut received = vec![next_event(&mut events).await, next_event(&mut events).await];
    received.sort_by_key(|event| match event {
        CompilerEvent::Ready { keys, .. } => keys[0],
        CompilerEvent::Failed { key, .. } => *key,
    });
    assert_eq!(
        received,
        vec![
            CompilerEvent::Failed {
                key: 1,
                error: CompileError::Failed("bad page".into()),
            },
            ready(&[2]),
        ]
    );
    assert!(compiler.request(2, false).cached().is_some());
}

#[tokio::test]
async fn test_panic_is_reported() {
    let driver = TestDriver::new();
    driver.panic(4, "unbalanced save/restore");
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(4, true).is_not_ready());
    assert_eq!(
        next_event(&mut events).await,
        CompilerEvent::Failed {
            key: 4,
            error: CompileError::Panicked("unbalanced save/restore".into()),
        }
    );
    assert!(!compiler.is_compiling(&4));

    // the compiler keeps working
    compile(&compiler, &mut events, 5).await;
}

#[tokio::test]
async fn test_eager_panic_is_reported() {
    let driver = TestDriver::new();
    driver.panic_eagerly(13, "content stream missing");
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(13, true).is_not_ready());
    assert_eq!(
        next_event(&mut events).await,
        CompilerEvent::Failed {
            key: 13,
            error: CompileError::Panicked("content stream missing".into()),
        }
    );
    assert!(!compiler.is_compiling(&13));
    assert_eq!(compiler.in_flight(), 0);

    // the compiler is still usable
    assert_eq!(compiler.state(), ControllerState::Active);
    compile(&compiler, &mut events, 1).await;

    driver.heal(13);
    compile(&compiler, &mut events, 13).await;
    compiler.stop().unwrap();
}

#[tokio::test]
async fn test_weight_panic_is_reported() {
    let driver = TestDriver::new();
    driver.size(9, UNMEASURABLE_SIZE);
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(9, true).is_not_ready());
    assert_eq!(
        next_event(&mut events).await,
        CompilerEvent::Failed {
            key: 9,
            error: CompileError::Panicked("page 9 cannot be measured".into()),
        }
    );
    assert_eq!(compiler.cached_pages(), 0);
    assert_eq!(compiler.cache_cost(), 0);

    compile(&compiler, &mut events, 2).await;
    assert_eq!(compiler.cache_cost(), DEFAULT_PAGE_SIZE);
}

#[tokio::test]
async fn test_related_pages() {
    let driver = TestDriver::new();
    driver.related(10, &[11, 12]);
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(10, true).is_not_ready());
    assert_eq!(next_event(&mut events).await, ready(&[10, 11, 12]));

    let related = compiler.request(11, false).cached().unwrap();
    assert_eq!(related.content, "page 11");
    assert!(compiler.request(12, false).cached().is_some());
    assert_eq!(compiler.cached_pages(), 3);
    assert_eq!(compiler.cache_cost(), 3 * DEFAULT_PAGE_SIZE);

    // only one computation ran
    assert_eq!(driver.calls(), vec![10]);
}

#[tokio::test]
async fn test_multiple_subscribers() {
    let driver = TestDriver::new();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    let mut other = compiler.subscribe();
    compiler.start().unwrap();

    assert!(compiler.request(6, true).is_not_ready());
    assert_eq!(next_event(&mut events).await, ready(&[6]));
    assert_eq!(next_event(&mut other).await, ready(&[6]));

    // exactly one event per computation
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());
    assert!(other.try_recv().is_err());
}

#[tokio::test]
async fn test_dropping_compiler_cancels_work() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);
    compiler.start().unwrap();

    assert!(compiler.request(1, true).is_not_ready());
    drop(compiler);

    driver.release(1);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_lookup_outcomes() {
    let driver = TestDriver::gated();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);

    assert!(matches!(compiler.request(1, true), Lookup::Miss));
    compiler.start().unwrap();
    assert!(matches!(compiler.request(1, true), Lookup::NotReady));

    driver.release(1);
    next_event(&mut events).await;
    assert!(matches!(compiler.request(1, false), Lookup::Cached(_)));
}
