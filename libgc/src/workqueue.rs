use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep};

/// Payloads with the same key are the same piece of work.
pub trait QueueKey {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn queue_key(&self) -> Self::Key;
}

#[derive(Clone, Debug)]
pub struct QueueItem<T> {
    /// When the payload first entered the queue. Kept across retries.
    pub enqueued_at: Instant,
    pub payload: T,
}

struct QueueState<T: QueueKey> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<T::Key>,
    /// Payloads waiting to be processed, including ones whose key is being
    /// processed right now and must be handed out again after `done`.
    dirty: HashMap<T::Key, QueueItem<T>>,
    processing: HashSet<T::Key>,
    failures: HashMap<T::Key, u32>,
    shutting_down: bool,
}

/// A deduplicating FIFO work queue.
///
/// A key is never handed to two consumers at once: adding a key that is
/// being processed parks it until the consumer calls `done`.
pub struct WorkQueue<T: QueueKey> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    /// Items scheduled by `add_after` and not yet re-added.
    waiting: AtomicUsize,
    /// Bumped on every change that can flip `is_idle`.
    generation: AtomicU64,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> WorkQueue<T>
where
    T: QueueKey + Send + 'static,
{
    pub fn new(name: &'static str, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashMap::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            waiting: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            base_delay,
            max_delay,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn add(&self, payload: T) {
        self.add_item(QueueItem {
            enqueued_at: Instant::now(),
            payload,
        })
        .await;
    }

    /// Adds an item keeping its enqueue time. A payload whose key is
    /// already waiting is dropped in favour of the waiting one.
    pub async fn add_item(&self, item: QueueItem<T>) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }
        let key = item.payload.queue_key();
        if state.dirty.contains_key(&key) {
            return;
        }
        state.dirty.insert(key.clone(), item);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds the item once `delay` has elapsed. The item counts as pending
    /// from this call on, even with a zero delay.
    pub fn add_after(self: &Arc<Self>, item: QueueItem<T>, delay: Duration) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            queue.add_item(item).await;
            queue.waiting.fetch_sub(1, Ordering::SeqCst);
            queue.generation.fetch_add(1, Ordering::SeqCst);
        });
    }

    /// Re-adds a failed item after a per-key exponential backoff.
    pub async fn add_rate_limited(self: &Arc<Self>, item: QueueItem<T>) {
        let key = item.payload.queue_key();
        let attempts = {
            let mut state = self.state.lock().await;
            let entry = state.failures.entry(key).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempts.saturating_sub(1).min(31)))
            .min(self.max_delay);
        self.add_after(item, delay);
    }

    /// Clears the failure history of a key after it was processed
    /// successfully.
    pub async fn forget(&self, key: &T::Key) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn failures(&self, key: &T::Key) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<QueueItem<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.queue.pop_front() {
                    if let Some(item) = state.dirty.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
            }
            notified.await;
        }
    }

    /// Marks the key as processed; a re-add that came in meanwhile becomes
    /// ready.
    pub async fn done(&self, key: &T::Key) {
        let mut state = self.state.lock().await;
        if state.processing.remove(key) {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if state.dirty.contains_key(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Number of items ready to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Changes whenever an item is added, scheduled or finished. Two equal
    /// readings mean the queue did not change in between.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Nothing queued, nothing in flight and no retry pending.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.dirty.is_empty()
            && state.processing.is_empty()
            && self.waiting.load(Ordering::SeqCst) == 0
    }
}
