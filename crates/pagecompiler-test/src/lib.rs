//! Helpers for testing the page compiler.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - A [`TestDriver`] is a cheap handle. Keep a clone of it around after moving one into the
//!    compiler, it is used to release gated computations and to inspect which pages were
//!    compiled.
//!
//!  - Use [`next_event`] instead of awaiting the subscription directly, so that a missing
//!    event fails the test instead of hanging it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use pagecompiler_service::{CompileDriver, CompileError, CompileResult, Compiled, CompilerEvent};
use tokio::sync::{Semaphore, mpsc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// The cost of a [`TestPage`] unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u64 = 10;

/// A page size the [`TestDriver`] refuses to weigh, its `weight` panics instead.
pub const UNMEASURABLE_SIZE: u64 = u64::MAX;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `pagecompiler_service` crate
///    and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pagecompiler_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Waits for the next event of a compiler subscription.
///
/// # Panics
///
/// Panics if no event arrives within a few seconds, or if the compiler went away.
pub async fn next_event<K>(events: &mut mpsc::UnboundedReceiver<CompilerEvent<K>>) -> CompilerEvent<K> {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a compiler event")
        .expect("compiler event channel closed")
}

/// A compiled page produced by the [`TestDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPage {
    pub page: u32,
    /// The input the page was compiled from.
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
enum Failure {
    Error(String),
    Panic(String),
    /// Panics in `compile` itself, before a future was handed out.
    EagerPanic(String),
}

#[derive(Debug, Clone, Default)]
struct PageSpec {
    size: Option<u64>,
    failure: Option<Failure>,
    related: Vec<u32>,
}

#[derive(Debug)]
struct DriverState {
    /// Pages in the order their computation was started.
    calls: Mutex<Vec<u32>>,
    pages: Mutex<BTreeMap<u32, PageSpec>>,
    gated: bool,
    gate: Semaphore,
}

/// A compile function for tests.
///
/// Pages compile to a [`TestPage`] whose content is derived from the page number. Individual
/// pages can be configured to fail, panic, use a specific size, or produce related pages.
///
/// A gated driver holds every computation until a permit is handed out via
/// [`release`](Self::release), which allows tests to observe computations in flight.
#[derive(Debug, Clone)]
pub struct TestDriver {
    state: Arc<DriverState>,
}

impl Default for TestDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDriver {
    /// Creates a driver that compiles pages right away.
    pub fn new() -> Self {
        Self::with_gate(false)
    }

    /// Creates a driver whose computations wait for [`release`](Self::release).
    pub fn gated() -> Self {
        Self::with_gate(true)
    }

    fn with_gate(gated: bool) -> Self {
        Self {
            state: Arc::new(DriverState {
                calls: Mutex::default(),
                pages: Mutex::default(),
                gated,
                gate: Semaphore::new(0),
            }),
        }
    }

    fn configure(&self, page: u32, f: impl FnOnce(&mut PageSpec)) -> &Self {
        f(self.state.pages.lock().unwrap().entry(page).or_default());
        self
    }

    /// Makes computations of `page` fail with `message`.
    pub fn fail(&self, page: u32, message: &str) -> &Self {
        let failure = Failure::Error(message.to_owned());
        self.configure(page, |spec| spec.failure = Some(failure))
    }

    /// Makes computations of `page` panic with `message`.
    pub fn panic(&self, page: u32, message: &str) -> &Self {
        let failure = Failure::Panic(message.to_owned());
        self.configure(page, |spec| spec.failure = Some(failure))
    }

    /// Makes `compile` panic with `message` for `page`, instead of returning a future.
    pub fn panic_eagerly(&self, page: u32, message: &str) -> &Self {
        let failure = Failure::EagerPanic(message.to_owned());
        self.configure(page, |spec| spec.failure = Some(failure))
    }

    /// Lets computations of `page` succeed again.
    pub fn heal(&self, page: u32) -> &Self {
        self.configure(page, |spec| spec.failure = None)
    }

    /// Sets the size, and thus the cache cost, of `page`.
    pub fn size(&self, page: u32, size: u64) -> &Self {
        self.configure(page, |spec| spec.size = Some(size))
    }

    /// Makes computations of `page` also produce `related` pages.
    pub fn related(&self, page: u32, related: &[u32]) -> &Self {
        self.configure(page, |spec| spec.related = related.to_vec())
    }

    /// Lets `computations` gated computations proceed.
    pub fn release(&self, computations: usize) {
        self.state.gate.add_permits(computations);
    }

    /// All pages whose computation was started, in order.
    pub fn calls(&self) -> Vec<u32> {
        self.state.calls.lock().unwrap().clone()
    }

    /// How often a computation for `page` was started.
    pub fn compile_count(&self, page: u32) -> usize {
        self.calls().iter().filter(|p| **p == page).count()
    }

    /// The input the owning system supplies for `page`.
    pub fn content(page: u32) -> String {
        format!("page {page}")
    }

    fn spec(&self, page: u32) -> PageSpec {
        self.state
            .pages
            .lock()
            .unwrap()
            .get(&page)
            .cloned()
            .unwrap_or_default()
    }

    fn build(&self, page: u32, content: String) -> TestPage {
        let size = self.spec(page).size.unwrap_or(DEFAULT_PAGE_SIZE);
        TestPage {
            page,
            content,
            size,
        }
    }
}

impl CompileDriver for TestDriver {
    type Key = u32;
    type Input = String;
    type Artifact = TestPage;

    fn input(&self, key: &u32) -> String {
        Self::content(*key)
    }

    fn compile(
        &self,
        key: u32,
        input: String,
    ) -> BoxFuture<'static, CompileResult<Compiled<u32, TestPage>>> {
        self.state.calls.lock().unwrap().push(key);
        if let Some(Failure::EagerPanic(message)) = self.spec(key).failure {
            panic!("{message}");
        }
        let driver = self.clone();

        Box::pin(async move {
            if driver.state.gated {
                driver
                    .state
                    .gate
                    .acquire()
                    .await
                    .expect("gate is never closed")
                    .forget();
            }

            let spec = driver.spec(key);
            match spec.failure {
                Some(Failure::Error(message)) => return Err(CompileError::Failed(message)),
                Some(Failure::Panic(message)) => panic!("{message}"),
                Some(Failure::EagerPanic(_)) | None => {}
            }

            let compiled = spec
                .related
                .iter()
                .fold(Compiled::new(driver.build(key, input)), |compiled, related| {
                    let page = driver.build(*related, Self::content(*related));
                    compiled.with_related(*related, page)
                });
            Ok(compiled)
        })
    }

    fn weight(artifact: &TestPage) -> u64 {
        if artifact.size == UNMEASURABLE_SIZE {
            panic!("page {} cannot be measured", artifact.page);
        }
        artifact.size
    }
}
