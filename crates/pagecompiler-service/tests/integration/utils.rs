use pagecompiler_service::config::CompilerConfig;
use pagecompiler_service::{CompilerEvent, PageCompiler};
use pagecompiler_test::{TestDriver, next_event};
use tokio::sync::mpsc;

pub type Events = mpsc::UnboundedReceiver<CompilerEvent<u32>>;

/// Creates a compiler on the current runtime, along with a subscription to its events.
pub fn setup_compiler(driver: &TestDriver, cache_limit: u64) -> (PageCompiler<TestDriver>, Events) {
    pagecompiler_test::setup();

    let config = CompilerConfig {
        cache_limit,
        ..Default::default()
    };
    let compiler = PageCompiler::new(
        driver.clone(),
        &config,
        tokio::runtime::Handle::current(),
    );
    let events = compiler.subscribe();
    (compiler, events)
}

/// The event reported for a single successfully compiled page.
pub fn ready(keys: &[u32]) -> CompilerEvent<u32> {
    CompilerEvent::Ready {
        keys: keys.to_vec(),
        all: false,
    }
}

/// Requests `page` and waits until it was compiled.
pub async fn compile(compiler: &PageCompiler<TestDriver>, events: &mut Events, page: u32) {
    assert!(compiler.request(page, true).is_not_ready());
    assert_eq!(next_event(events).await, ready(&[page]));
}
