//! Per-thread keyed storage with an atomic slot lifecycle.
//!
//! [`ThreadLocalTable`] is the building block of the thread tracker: one value
//! slot per thread, created by `track`, mutated with linearizable
//! read-modify-write, and observable as a whole through `snapshot`. The table
//! does not discover the current thread itself; callers pass the [`ThreadId`]
//! the profiling host reported, which keeps the table testable without a live
//! runtime attached.

use std::sync::Mutex;

use rustc_hash::FxHashMap;

/// OS-level thread identifier as reported by the profiling host.
pub type ThreadId = u64;

/// A keyed table of per-thread value slots.
///
/// Individual slots are independent; `update` is linearizable on a single slot
/// (no reader ever observes a torn intermediate value), and `snapshot` is a
/// serialization point across all slots taken under one lock.
#[derive(Debug)]
pub struct ThreadLocalTable<V> {
    slots: Mutex<FxHashMap<ThreadId, V>>,
}

impl<V: Clone> ThreadLocalTable<V> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Installs a slot for `thread` holding `value`, replacing any prior slot.
    pub fn track(&self, thread: ThreadId, value: V) {
        lock!(self.slots).insert(thread, value);
    }

    /// Overwrites the slot of `thread`. Installs the slot if absent.
    pub fn store(&self, thread: ThreadId, value: V) {
        lock!(self.slots).insert(thread, value);
    }

    /// Reads the slot of `thread`, if present.
    pub fn load(&self, thread: ThreadId) -> Option<V> {
        lock!(self.slots).get(&thread).cloned()
    }

    /// Atomically replaces the slot value of `thread` with `f(current)`.
    ///
    /// Returns the new value, or `None` when the thread has no slot.
    pub fn update(&self, thread: ThreadId, f: impl FnOnce(V) -> V) -> Option<V> {
        let mut slots = lock!(self.slots);
        let slot = slots.get_mut(&thread)?;
        *slot = f(slot.clone());
        Some(slot.clone())
    }

    /// True if `thread` currently has a slot.
    pub fn exists(&self, thread: ThreadId) -> bool {
        lock!(self.slots).contains_key(&thread)
    }

    /// Removes and returns the slot of `thread`.
    pub fn remove(&self, thread: ThreadId) -> Option<V> {
        lock!(self.slots).remove(&thread)
    }

    /// All `(thread, value)` pairs at a single point in time.
    pub fn snapshot(&self) -> Vec<(ThreadId, V)> {
        lock!(self.slots)
            .iter()
            .map(|(thread, value)| (*thread, value.clone()))
            .collect()
    }

    /// Drops every slot.
    pub fn clear(&self) {
        lock!(self.slots).clear();
    }
}

impl<V: Clone> Default for ThreadLocalTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn track_load_remove() {
        let table = ThreadLocalTable::new();
        assert!(!table.exists(1));
        table.track(1, 0i32);
        assert!(table.exists(1));
        assert_eq!(table.load(1), Some(0));
        assert_eq!(table.remove(1), Some(0));
        assert!(!table.exists(1));
        assert_eq!(table.load(1), None);
    }

    #[test]
    fn update_returns_new_value() {
        let table = ThreadLocalTable::new();
        table.track(7, 10i32);
        assert_eq!(table.update(7, |v| v + 1), Some(11));
        assert_eq!(table.load(7), Some(11));
        assert_eq!(table.update(8, |v| v + 1), None);
    }

    #[test]
    fn snapshot_and_clear() {
        let table = ThreadLocalTable::new();
        table.track(1, 1i32);
        table.track(2, 2i32);
        let mut snapshot = table.snapshot();
        snapshot.sort_unstable();
        assert_eq!(snapshot, vec![(1, 1), (2, 2)]);
        table.clear();
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn updates_from_many_threads_do_not_tear() {
        let table = Arc::new(ThreadLocalTable::new());
        table.track(42, 0i64);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    table.update(42, |v| v + 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.load(42), Some(8000));
    }
}
