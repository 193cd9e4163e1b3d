//! A deduplicating, rate-limited queue of keys
use crate::backoff::{BackoffPolicy, KeyBackoff};
use parking_lot::Mutex;
use std::{
    collections::{hash_map::Entry, HashMap, HashSet, VecDeque},
    fmt::{self, Debug},
    hash::Hash,
    pin::pin,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};

/// Outcome of [`WorkQueue::requeue_with_backoff`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The key will be queued again once the delay has passed
    After(Duration),
    /// The key failed more times than the policy allows and was not queued again
    Exhausted {
        /// Number of retries that were handed out before giving up
        retries: usize,
    },
    /// The queue is shutting down, the key was not queued again
    Discarded,
}

/// A queue of keys to process
///
/// Keys are deduplicated: a key that is already queued is only queued once, and a key
/// that is queued while it is being processed is held back until [`WorkQueue::done`]
/// is called for it, at which point it is queued (once) again. This guarantees that
/// the same key is never handed to two consumers at the same time.
///
/// Cloning produces a new handle to the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    policy: BackoffPolicy,
}

struct State<T> {
    /// Keys ready to be handed out, in order
    queue: VecDeque<T>,
    /// Keys that need processing, whether they sit in `queue` or wait for a consumer to finish
    dirty: HashSet<T>,
    /// Keys currently held by a consumer
    processing: HashSet<T>,
    /// Deadlines of delayed adds. Used to detect duplicate delayed adds.
    waiting: HashMap<T, Instant>,
    /// Consecutive failures per key
    failures: HashMap<T, KeyBackoff>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty queue retrying failed keys according to `policy`
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                policy,
            }),
        }
    }

    /// Queue `key` for processing
    ///
    /// Does nothing if the key is already queued, or if the queue is shutting down.
    pub fn enqueue(&self, key: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // Picked up again by `done`
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Queue `key` once `delay` has passed
    ///
    /// If the key is already waiting then the earlier deadline takes precedence.
    /// Must be called from within a tokio runtime unless `delay` is zero.
    pub fn enqueue_after(&self, key: T, delay: Duration) {
        if delay.is_zero() {
            return self.enqueue(key);
        }
        let mut state = self.shared.state.lock();
        self.schedule(&mut state, key, delay);
    }

    /// Registers a delayed add, unless the queue is shutting down
    fn schedule(&self, state: &mut State<T>, key: T, delay: Duration) {
        if state.shutting_down {
            return;
        }
        let run_at = Instant::now() + delay;
        match state.waiting.entry(key.clone()) {
            Entry::Occupied(entry) if *entry.get() <= run_at => return,
            Entry::Occupied(mut entry) => {
                entry.insert(run_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(run_at);
            }
        }
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            time::sleep_until(run_at).await;
            fire(&shared, key, run_at);
        });
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue has been shut down and every queued key has been handed out.
    /// Every key returned must be passed to [`WorkQueue::done`] once processing finishes.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            // Register before inspecting the state so a `shutdown` in between is not missed
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed
    ///
    /// If the key was queued again while it was being processed it becomes available again.
    pub fn done(&self, key: &T) {
        let mut state = self.shared.state.lock();
        if !state.processing.remove(key) {
            return;
        }
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Queue `key` again after the next backoff delay for it
    ///
    /// Every call counts as one more consecutive failure of `key`, until [`WorkQueue::forget`]
    /// resets it. Once the queue is shutting down nothing is requeued or counted.
    pub fn requeue_with_backoff(&self, key: T) -> Requeue {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Requeue::Discarded;
        }
        let policy = self.shared.policy;
        let backoff = state
            .failures
            .entry(key.clone())
            .or_insert_with(|| KeyBackoff::new(policy));
        let Some(delay) = backoff.next() else {
            return Requeue::Exhausted {
                retries: backoff.retries(),
            };
        };
        self.schedule(&mut state, key, delay);
        Requeue::After(delay)
    }

    /// Stop tracking failures of `key`
    pub fn forget(&self, key: &T) {
        self.shared.state.lock().failures.remove(key);
    }

    /// Number of times `key` has been requeued since it was last forgotten
    #[must_use]
    pub fn num_requeues(&self, key: &T) -> usize {
        self.shared
            .state
            .lock()
            .failures
            .get(key)
            .map_or(0, KeyBackoff::retries)
    }

    /// Number of keys ready to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether no key is ready to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys
    ///
    /// Keys that are already queued are still handed out, delayed keys are discarded.
    /// Once the queue is drained every [`WorkQueue::dequeue`] returns `None`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }
}

fn fire<T>(shared: &Weak<Shared<T>>, key: T, run_at: Instant)
where
    T: Eq + Hash + Clone + Send + 'static,
{
    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut state = shared.state.lock();
        match state.waiting.get(&key) {
            // Superseded by an earlier deadline, or discarded by a shutdown
            Some(deadline) if *deadline == run_at => {
                state.waiting.remove(&key);
            }
            _ => return,
        }
    }
    WorkQueue { shared }.enqueue(key);
}
