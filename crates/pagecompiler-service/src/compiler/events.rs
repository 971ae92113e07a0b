use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::CompileError;

/// A notification emitted by the [`PageCompiler`](super::PageCompiler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerEvent<K> {
    /// Compiled pages became available.
    ///
    /// `keys` lists the pages produced by one computation, the requested page first. When
    /// `all` is set, every previously obtained page should be considered stale, `keys` is
    /// empty in that case.
    Ready { keys: Vec<K>, all: bool },
    /// Compiling `key` failed. Nothing was cached for it.
    Failed { key: K, error: CompileError },
}

impl<K> CompilerEvent<K> {
    /// Creates the notification that invalidates all cached content.
    pub fn all_changed() -> Self {
        Self::Ready {
            keys: Vec::new(),
            all: true,
        }
    }
}

/// Fans events out to every registered subscriber.
pub(crate) struct Subscribers<K> {
    senders: Mutex<Vec<mpsc::UnboundedSender<CompilerEvent<K>>>>,
}

impl<K> Default for Subscribers<K> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl<K> fmt::Debug for Subscribers<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscribers = self
            .senders
            .try_lock()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("Subscribers")
            .field("subscribers", &subscribers)
            .finish()
    }
}

impl<K: Clone> Subscribers<K> {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CompilerEvent<K>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut senders = self.senders.lock().unwrap();
        // there might not be any event for a long time to prune them otherwise
        senders.retain(|sender| !sender.is_closed());
        senders.push(sender);
        receiver
    }

    /// Delivers `event` to all subscribers, dropping the ones that went away.
    pub fn emit(&self, event: CompilerEvent<K>) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}
