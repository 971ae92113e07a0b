//! The asynchronous page compiler.
//!
//! A [`PageCompiler`] hands out compiled pages from a cost-bounded in-memory cache. When a
//! page is missing, it runs exactly one background computation for it, no matter how many
//! times the page is requested while that computation is running. Completion is reported
//! through [`CompilerEvent`]s, the requesting thread never waits for a computation.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::CompilerConfig;
use crate::error::{CompileError, CompileResult, LifecycleError, Operation};
use crate::utils::defer::defer;

pub mod cache;
mod driver;
mod events;
mod lifecycle;
mod registry;

pub use driver::{CompileDriver, Compiled};
pub use events::CompilerEvent;
pub use lifecycle::ControllerState;

use cache::ResultCache;
use events::Subscribers;
use lifecycle::Lifecycle;
use registry::{TaskId, TaskRegistry};

/// The outcome of a [`PageCompiler::request`].
#[derive(Debug)]
pub enum Lookup<A> {
    /// The page was compiled already.
    Cached(Arc<A>),
    /// The page is not cached and no computation was started for it.
    Miss,
    /// The page is being compiled, a [`CompilerEvent`] will report the outcome.
    NotReady,
}

impl<A> Lookup<A> {
    /// Returns the compiled page, if it was cached.
    pub fn cached(self) -> Option<Arc<A>> {
        match self {
            Self::Cached(artifact) => Some(artifact),
            _ => None,
        }
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }

    fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Cached(_) => "hit",
            Self::Miss => "miss",
            Self::NotReady => "pending",
        }
    }
}

/// State that is only ever touched while holding the lock.
struct Shared<D: CompileDriver> {
    lifecycle: Lifecycle,
    cache: ResultCache<D::Key, D::Artifact>,
    tasks: TaskRegistry<D::Key>,
}

struct Inner<D: CompileDriver> {
    driver: D,
    /// Used as the `cache` tag of all metrics.
    name: String,
    runtime: Handle,
    shared: Mutex<Shared<D>>,
    subscribers: Subscribers<D::Key>,
}

/// Compiles pages in the background and keeps the results in a bounded cache.
///
/// The compiler starts out [`Inactive`](ControllerState::Inactive) and only dispatches work
/// after [`start`](Self::start) was called. [`stop`](Self::stop) cancels every running
/// computation and clears the cache, results of cancelled computations are discarded.
///
/// This is a cheap handle, clones refer to the same compiler. Dropping the last handle
/// cancels all outstanding computations.
pub struct PageCompiler<D: CompileDriver> {
    inner: Arc<Inner<D>>,
}

impl<D: CompileDriver> Clone for PageCompiler<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: CompileDriver> fmt::Debug for PageCompiler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PageCompiler");
        debug.field("name", &self.inner.name);
        if let Ok(shared) = self.inner.shared.try_lock() {
            debug
                .field("state", &shared.lifecycle.state())
                .field("cache", &shared.cache)
                .field("tasks", &shared.tasks);
        }
        debug.field("subscribers", &self.inner.subscribers).finish()
    }
}

impl<D: CompileDriver> PageCompiler<D> {
    /// Creates an inactive compiler running its computations on `runtime`.
    pub fn new(driver: D, config: &CompilerConfig, runtime: Handle) -> Self {
        let shared = Shared {
            lifecycle: Lifecycle::default(),
            cache: ResultCache::new(config.cache_limit),
            tasks: TaskRegistry::default(),
        };
        let inner = Inner {
            driver,
            name: config.name.clone(),
            runtime,
            shared: Mutex::new(shared),
            subscribers: Subscribers::default(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Registers a new observer for [`CompilerEvent`]s.
    ///
    /// Every subscriber receives every event emitted after it subscribed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CompilerEvent<D::Key>> {
        self.inner.subscribers.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().lifecycle.state()
    }

    /// Number of pages currently held in the cache.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Summed cost of all cached pages, in bytes.
    pub fn cache_cost(&self) -> u64 {
        self.inner.lock().cache.total_cost()
    }

    pub fn cache_limit(&self) -> u64 {
        self.inner.lock().cache.limit()
    }

    /// Whether `key` is cached, without marking it as recently used.
    pub fn is_cached(&self, key: &D::Key) -> bool {
        self.inner.lock().cache.contains(key)
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether a computation for `key` is currently running.
    pub fn is_compiling(&self, key: &D::Key) -> bool {
        self.inner.lock().tasks.contains(key)
    }

    /// Starts accepting work. Only valid while the compiler is inactive.
    pub fn start(&self) -> Result<(), LifecycleError> {
        self.inner.lock().lifecycle.start()
    }

    /// Cancels all running computations and clears the cache.
    ///
    /// Only valid while the compiler is active. Once this returns, no event will be emitted
    /// for any of the cancelled computations.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        self.stop_locked(&mut self.inner.lock(), Operation::Stop)
    }

    /// Stops and restarts the compiler, dropping all cached and pending work.
    ///
    /// Emits [`CompilerEvent::all_changed`] once the compiler is active again.
    pub fn reset(&self) -> Result<(), LifecycleError> {
        let mut shared = self.inner.lock();
        self.stop_locked(&mut shared, Operation::Reset)?;
        shared.lifecycle.start()?;
        self.inner.subscribers.emit(CompilerEvent::all_changed());
        Ok(())
    }

    /// Changes the cost limit of the cache, evicting pages right away if necessary.
    pub fn set_cache_limit(&self, limit: u64) {
        let name = self.inner.name.as_str();
        let mut shared = self.inner.lock();
        let evicted = shared.cache.set_limit(limit);

        tracing::debug!(limit, evicted = evicted.len(), "changed page cache limit");
        metric!(counter("compiler.evictions") += evicted.len() as i64, "cache" => name);
        metric!(gauge("compiler.cache.cost") = shared.cache.total_cost(), "cache" => name);
    }

    /// Returns the compiled page for `key`, or starts compiling it.
    ///
    /// A cached page is returned right away. Otherwise, if a computation for `key` is already
    /// running, or `compile` is set and the compiler is active, [`Lookup::NotReady`] is
    /// returned and the outcome will be reported through a [`CompilerEvent`]. There is never
    /// more than one computation per key.
    ///
    /// This never waits for a computation to finish.
    pub fn request(&self, key: D::Key, compile: bool) -> Lookup<D::Artifact> {
        let lookup = self.lookup_or_dispatch(key, compile);
        metric!(
            counter("compiler.request") += 1,
            "result" => lookup.metrics_tag(),
            "cache" => self.inner.name.as_str(),
        );
        lookup
    }

    fn lookup_or_dispatch(&self, key: D::Key, compile: bool) -> Lookup<D::Artifact> {
        let id = {
            let mut shared = self.inner.lock();
            if let Some(artifact) = shared.cache.lookup(&key) {
                return Lookup::Cached(artifact);
            }
            if shared.tasks.contains(&key) {
                return Lookup::NotReady;
            }
            if !compile || !shared.lifecycle.accepts_work() {
                return Lookup::Miss;
            }
            shared.tasks.reserve(key.clone())
        };

        self.dispatch(key, id);
        Lookup::NotReady
    }

    /// Starts the computation reserved as `id`.
    ///
    /// Driver code runs without holding the lock, so that a panicking driver can only ever
    /// fail its own page.
    fn dispatch(&self, key: D::Key, id: TaskId) {
        let driver = &self.inner.driver;
        let computation = panic::catch_unwind(AssertUnwindSafe(|| {
            let input = driver.input(&key);
            driver.compile(key.clone(), input)
        }));
        let computation = match computation {
            Ok(computation) => computation,
            Err(payload) => {
                let error = CompileError::from_panic(payload);
                self.inner.complete(key, id, Err(error), Duration::ZERO);
                return;
            }
        };

        let name = self.inner.name.clone();
        let compiler = Arc::downgrade(&self.inner);
        let task = {
            let key = key.clone();
            async move {
                // Aborting the task drops the future while it is still pending.
                let cancelled = defer(move || {
                    metric!(
                        counter("compiler.completed") += 1,
                        "status" => "cancelled",
                        "cache" => name.as_str(),
                    );
                });

                let start = Instant::now();
                let primary = key.clone();
                let weighed = async move {
                    let compiled = computation.await?;
                    Ok::<_, CompileError>(weigh::<D>(primary, compiled))
                };
                let result = AssertUnwindSafe(weighed)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(CompileError::from_panic(payload)));
                cancelled.disarm();

                if let Some(compiler) = Weak::upgrade(&compiler) {
                    compiler.complete(key, id, result, start.elapsed());
                }
            }
        };

        let mut shared = self.inner.lock();
        let handle = self
            .inner
            .runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        // The compiler may have been stopped while the driver was busy.
        if let Err(handle) = shared.tasks.attach(&key, id, handle) {
            tracing::trace!(?key, %id, "page compilation cancelled before it started");
            handle.abort();
            return;
        }
        tracing::trace!(?key, %id, "dispatched page compilation");

        let name = self.inner.name.as_str();
        metric!(counter("compiler.dispatch") += 1, "cache" => name);
        metric!(gauge("compiler.tasks") = shared.tasks.len() as u64, "cache" => name);
    }

    fn stop_locked(
        &self,
        shared: &mut Shared<D>,
        operation: Operation,
    ) -> Result<(), LifecycleError> {
        shared.lifecycle.begin_stop(operation)?;
        shared.cache.clear();

        // Aborting only drops the futures, none of which take the lock.
        let tasks = shared.tasks.drain();
        let cancelled = tasks.len();
        for (key, handle) in tasks {
            tracing::trace!(?key, "cancelling page compilation");
            // reserved computations without a handle are dropped once their driver returns
            if let Some(handle) = handle {
                handle.abort();
            }
        }

        shared.lifecycle.finish_stop();
        tracing::debug!(cancelled, "page compiler stopped");

        let name = self.inner.name.as_str();
        metric!(gauge("compiler.tasks") = 0u64, "cache" => name);
        metric!(gauge("compiler.cache.cost") = 0u64, "cache" => name);
        Ok(())
    }
}

/// Compiled artifacts along with their cost, the requested one first.
type Weighed<D> = Vec<(
    <D as CompileDriver>::Key,
    Arc<<D as CompileDriver>::Artifact>,
    u64,
)>;

/// Determines the cost of every artifact produced by one computation.
fn weigh<D: CompileDriver>(key: D::Key, compiled: Compiled<D::Key, D::Artifact>) -> Weighed<D> {
    let Compiled { artifact, related } = compiled;
    std::iter::once((key, artifact))
        .chain(related)
        .map(|(key, artifact)| {
            let cost = D::weight(&artifact);
            (key, Arc::new(artifact), cost)
        })
        .collect()
}

impl<D: CompileDriver> Inner<D> {
    fn lock(&self) -> MutexGuard<'_, Shared<D>> {
        self.shared.lock().unwrap()
    }

    /// Handles the outcome of the computation `id` for `key`.
    ///
    /// The result is discarded if the computation was cancelled in the meantime. Otherwise
    /// exactly one event is emitted for it.
    fn complete(
        &self,
        key: D::Key,
        id: TaskId,
        result: CompileResult<Weighed<D>>,
        elapsed: Duration,
    ) {
        let name = self.name.as_str();
        let mut shared = self.lock();

        if !shared.tasks.finish(&key, id) {
            tracing::trace!(?key, %id, "discarding result of cancelled page compilation");
            metric!(counter("compiler.completed") += 1, "status" => "discarded", "cache" => name);
            return;
        }
        metric!(gauge("compiler.tasks") = shared.tasks.len() as u64, "cache" => name);
        metric!(timer("compiler.duration") = elapsed, "cache" => name);

        let event = match result {
            Ok(group) => {
                let keys: Vec<_> = group.iter().map(|(key, _, _)| key.clone()).collect();

                let evicted = shared.cache.insert_group(group);
                tracing::trace!(?keys, ?elapsed, "page compilation finished");

                metric!(counter("compiler.completed") += 1, "status" => "ok", "cache" => name);
                metric!(counter("compiler.evictions") += evicted.len() as i64, "cache" => name);
                metric!(gauge("compiler.cache.cost") = shared.cache.total_cost(), "cache" => name);

                CompilerEvent::Ready { keys, all: false }
            }
            Err(error) => {
                tracing::warn!(
                    ?key,
                    error = &error as &dyn std::error::Error,
                    "page compilation failed"
                );
                metric!(
                    counter("compiler.completed") += 1,
                    "status" => "error",
                    "error" => error.metrics_tag(),
                    "cache" => name,
                );

                CompilerEvent::Failed { key, error }
            }
        };

        // Emitting while still holding the lock guarantees that a concurrent `stop` either
        // sees this task as finished, or this event is never sent.
        self.subscribers.emit(event);
    }
}

impl<D: CompileDriver> Drop for Inner<D> {
    fn drop(&mut self) {
        let shared = self
            .shared
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in shared.tasks.drain().into_iter().filter_map(|(_, handle)| handle) {
            handle.abort();
        }
    }
}
