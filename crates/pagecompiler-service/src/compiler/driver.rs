use std::fmt;
use std::hash::Hash;

use futures::future::BoxFuture;

use crate::error::CompileResult;

/// The successful output of one computation.
///
/// Besides the artifact that was requested, a computation may produce artifacts for other
/// keys as a side effect. These are inserted into the cache together with the primary one
/// and reported in the same [`CompilerEvent::Ready`](super::CompilerEvent::Ready).
#[derive(Debug, Clone)]
pub struct Compiled<K, A> {
    /// The artifact for the key that was requested.
    pub artifact: A,
    /// Artifacts for other keys that were produced along the way.
    pub related: Vec<(K, A)>,
}

impl<K, A> Compiled<K, A> {
    pub fn new(artifact: A) -> Self {
        Self {
            artifact,
            related: Vec::new(),
        }
    }

    pub fn with_related(mut self, key: K, artifact: A) -> Self {
        self.related.push((key, artifact));
        self
    }
}

/// The compute function driving a [`PageCompiler`](super::PageCompiler).
///
/// The driver is owned by the system the pages belong to. It provides the input for a page
/// and the (potentially very expensive) computation turning that input into an artifact.
pub trait CompileDriver: Send + Sync + 'static {
    /// Identifies a page.
    type Key: Ord + Hash + Clone + fmt::Debug + Send + Sync + 'static;
    /// The raw description of a page, as supplied by the owning system.
    type Input: Send + 'static;
    /// The compiled page.
    type Artifact: Send + Sync + 'static;

    /// Captures the input for `key`.
    ///
    /// This runs on the thread issuing the request and should only snapshot the data the
    /// computation needs.
    fn input(&self, key: &Self::Key) -> Self::Input;

    /// Compiles a page.
    ///
    /// The returned future runs on the compiler's runtime. Computations that block the
    /// thread for a long time should move their work to `tokio::task::spawn_blocking`.
    fn compile(
        &self,
        key: Self::Key,
        input: Self::Input,
    ) -> BoxFuture<'static, CompileResult<Compiled<Self::Key, Self::Artifact>>>;

    /// The "cost" of keeping this artifact in the cache, in bytes.
    fn weight(artifact: &Self::Artifact) -> u64 {
        std::mem::size_of_val(artifact) as u64
    }
}
