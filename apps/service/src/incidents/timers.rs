use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A pending delayed action and the data it fires with
#[derive(Debug)]
pub struct TimerEntry<P> {
    pub id: u64,
    pub deadline: Instant,
    pub payload: P,
    handle: JoinHandle<()>,
}

/// At most one pending timer per key.
///
/// Each armed timer gets a fresh id. A firing task must claim its entry with
/// [`TimerRegistry::claim`] and stop if the id no longer matches, which covers
/// a timer that was cancelled and re-armed while the old task was waiting.
#[derive(Debug)]
pub struct TimerRegistry<K, P> {
    next_id: u64,
    entries: HashMap<K, TimerEntry<P>>,
}

impl<K, P> Default for TimerRegistry<K, P> {
    fn default() -> Self {
        Self { next_id: 1, entries: HashMap::new() }
    }
}

impl<K: Eq + Hash, P> TimerRegistry<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&TimerEntry<P>> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arm a timer for `key` unless one is already pending.
    ///
    /// `spawn` receives the new timer id and must start the task that later
    /// claims it. Returns `false` (and does not call `spawn`) if a timer exists.
    pub fn arm(&mut self, key: K, delay: Duration, payload: P, spawn: impl FnOnce(u64) -> JoinHandle<()>) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;

        let handle = spawn(id);
        self.entries.insert(key, TimerEntry { id, deadline: Instant::now() + delay, payload, handle });
        true
    }

    /// Remove the entry if it is still timer `id`, without aborting its task.
    ///
    /// Called from the timer's own task when it fires.
    pub fn claim(&mut self, key: &K, id: u64) -> Option<P> {
        match self.entries.get(key) {
            Some(entry) if entry.id == id => self.entries.remove(key).map(|entry| entry.payload),
            _ => None,
        }
    }

    /// Remove and abort the pending timer for `key`
    pub fn cancel(&mut self, key: &K) -> Option<P> {
        self.entries.remove(key).map(|entry| {
            entry.handle.abort();
            entry.payload
        })
    }

    /// Abort every pending timer, returning how many there were
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn idle_task() -> JoinHandle<()> {
        tokio::spawn(std::future::pending())
    }

    #[tokio::test]
    async fn test_second_arm_is_noop() {
        let mut timers: TimerRegistry<&str, u32> = TimerRegistry::new();

        assert!(timers.arm("ATM-01", Duration::from_secs(60), 1, |_| idle_task()));
        assert!(!timers.arm("ATM-01", Duration::from_secs(60), 2, |_| panic!("must not spawn")));

        assert_eq!(timers.get(&"ATM-01").map(|e| e.payload), Some(1));
        assert_eq!(timers.len(), 1);
        timers.cancel_all();
    }

    #[tokio::test]
    async fn test_claim_requires_matching_id() {
        let mut timers: TimerRegistry<&str, u32> = TimerRegistry::new();
        timers.arm("BRANCH-1", Duration::from_secs(1), 7, |_| idle_task());
        let id = timers.get(&"BRANCH-1").unwrap().id;

        assert_eq!(timers.claim(&"BRANCH-1", id + 1), None);
        assert_eq!(timers.claim(&"BRANCH-1", id), Some(7));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_task() {
        let mut timers: TimerRegistry<&str, ()> = TimerRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        timers.arm("ATM-02", Duration::from_secs(5), (), move |_| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
            })
        });

        assert!(timers.cancel(&"ATM-02").is_some());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
