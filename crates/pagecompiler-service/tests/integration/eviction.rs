use pagecompiler_test::TestDriver;

use crate::utils::{compile, setup_compiler};

#[tokio::test]
async fn test_least_recently_used_is_evicted() {
    let driver = TestDriver::new();
    for page in [1, 2, 3] {
        driver.size(page, 40);
    }
    let (compiler, mut events) = setup_compiler(&driver, 100);
    compiler.start().unwrap();

    compile(&compiler, &mut events, 1).await;
    compile(&compiler, &mut events, 2).await;
    assert_eq!(compiler.cache_cost(), 80);

    compile(&compiler, &mut events, 3).await;
    assert_eq!(compiler.cached_pages(), 2);
    assert_eq!(compiler.cache_cost(), 80);
    assert!(!compiler.is_cached(&1));
    assert!(compiler.is_cached(&2));

    assert!(compiler.request(1, false).is_miss());
    assert!(compiler.request(2, false).cached().is_some());
    assert!(compiler.request(3, false).cached().is_some());
}

#[tokio::test]
async fn test_requests_refresh_recency() {
    let driver = TestDriver::new();
    for page in [1, 2, 3] {
        driver.size(page, 40);
    }
    let (compiler, mut events) = setup_compiler(&driver, 100);
    compiler.start().unwrap();

    compile(&compiler, &mut events, 1).await;
    compile(&compiler, &mut events, 2).await;
    assert!(compiler.request(1, false).cached().is_some());

    compile(&compiler, &mut events, 3).await;
    assert!(compiler.request(2, false).is_miss());
    assert!(compiler.request(1, false).cached().is_some());
}

#[tokio::test]
async fn test_is_cached_keeps_recency() {
    let driver = TestDriver::new();
    for page in [1, 2, 3] {
        driver.size(page, 40);
    }
    let (compiler, mut events) = setup_compiler(&driver, 100);
    compiler.start().unwrap();

    compile(&compiler, &mut events, 1).await;
    compile(&compiler, &mut events, 2).await;
    assert!(compiler.is_cached(&1));

    compile(&compiler, &mut events, 3).await;
    assert!(!compiler.is_cached(&1));
    assert!(compiler.is_cached(&2));
}

#[tokio::test]
async fn test_oversized_page() {
    let driver = TestDriver::new();
    driver.size(1, 150).size(2, 10);
    let (compiler, mut events) = setup_compiler(&driver, 100);
    compiler.start().unwrap();

    compile(&compiler, &mut events, 1).await;
    assert_eq!(compiler.cached_pages(), 1);
    assert_eq!(compiler.cache_cost(), 150);

    compile(&compiler, &mut events, 2).await;
    assert!(compiler.request(1, false).is_miss());
    assert_eq!(compiler.cache_cost(), 10);
}

#[tokio::test]
async fn test_set_cache_limit() {
    let driver = TestDriver::new();
    let (compiler, mut events) = setup_compiler(&driver, 1_000);

    // the limit can be changed in any state
    compiler.set_cache_limit(500);
    assert_eq!(compiler.cache_limit(), 500);

    compiler.start().unwrap();
    for page in [1, 2, 3] {
        compile(&compiler, &mut events, page).await;
    }
    assert_eq!(compiler.cache_cost(), 30);

    compiler.set_cache_limit(15);
    assert_eq!(compiler.cache_limit(), 15);
    assert_eq!(compiler.cached_pages(), 1);
    assert!(compiler.request(3, false).cached().is_some());

    compiler.set_cache_limit(0);
    assert_eq!(compiler.cached_pages(), 0);
    assert_eq!(compiler.cache_cost(), 0);
}
