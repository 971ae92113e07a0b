use std::collections::BTreeMap;
use std::fmt;

use tokio::task::JoinHandle;

/// Identifies one dispatched computation.
///
/// Ids are never reused during the lifetime of a compiler, so a completion can always tell
/// whether the registry entry it is about to remove is still its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct InFlightTask {
    id: TaskId,
    /// `None` while the computation is reserved but not spawned yet.
    handle: Option<JoinHandle<()>>,
}

/// The set of computations that are currently running, at most one per key.
pub(crate) struct TaskRegistry<K> {
    tasks: BTreeMap<K, InFlightTask>,
    next_id: u64,
}

impl<K> fmt::Debug for TaskRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("running", &self.tasks.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<K> Default for TaskRegistry<K> {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<K: Ord + fmt::Debug> TaskRegistry<K> {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    /// Claims `key` for a new computation that is about to be spawned.
    ///
    /// From now on the key counts as in flight, so no second computation is dispatched for it.
    pub fn reserve(&mut self, key: K) -> TaskId {
        debug_assert!(
            !self.tasks.contains_key(&key),
            "duplicate computation for {key:?}"
        );
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.insert(key, InFlightTask { id, handle: None });
        id
    }

    /// Attaches the spawned computation to its reservation.
    ///
    /// Returns the handle back if the reservation is gone in the meantime.
    pub fn attach(
        &mut self,
        key: &K,
        id: TaskId,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        match self.tasks.get_mut(key) {
            Some(task) if task.id == id => {
                task.handle = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Removes the entry for `key` if it still belongs to the computation `id`.
    ///
    /// Returns `false` if the computation was cancelled in the meantime, in which case its
    /// result has to be discarded.
    pub fn finish(&mut self, key: &K, id: TaskId) -> bool {
        match self.tasks.get(key) {
            Some(task) if task.id == id => {
                self.tasks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Removes all running computations, handing out the handles of the spawned ones.
    pub fn drain(&mut self) -> Vec<(K, Option<JoinHandle<()>>)> {
        std::mem::take(&mut self.tasks)
            .into_iter()
            .map(|(key, task)| (key, task.handle))
            .collect()
    }
}
