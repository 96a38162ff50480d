//! Debounced cache invalidation.
//!
//! Change events frequently hit the same logical query several times in
//! quick succession (a task update also touches its project and hierarchy
//! keys). The debouncer coalesces those into one invalidation per key per
//! window: every schedule for a pending key cancels and replaces its timer,
//! so the sink fires once, one window after the *last* trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(1000);

/// Ordered list of strings identifying one logical cached query, e.g.
/// `["project", "42"]`. Order is part of identity: `["a","b"]` and
/// `["b","a"]` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationKey(Vec<String>);

impl InvalidationKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for InvalidationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// The cache-invalidation sink injected by the binding layer.
pub trait QueryCache: Send + Sync {
    fn invalidate(&self, key: &InvalidationKey);
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct DebouncerInner {
    timers: Mutex<HashMap<InvalidationKey, PendingTimer>>,
    sink: RwLock<Option<Arc<dyn QueryCache>>>,
    generation: AtomicU64,
}

pub struct InvalidationDebouncer {
    inner: Arc<DebouncerInner>,
    window: Duration,
}

impl InvalidationDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                timers: Mutex::new(HashMap::new()),
                sink: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
            window,
        }
    }

    /// Inject the invalidation sink. Until this is called, expired timers
    /// are a silent no-op.
    pub fn set_query_cache(&self, cache: Arc<dyn QueryCache>) {
        *self.inner.sink.write().expect("debouncer sink lock poisoned") = Some(cache);
    }

    pub fn schedule(&self, key: InvalidationKey) {
        self.schedule_after(key, self.window);
    }

    /// Schedule `key` for invalidation after `delay`, cancelling and
    /// replacing any pending timer for the same key.
    pub fn schedule_after(&self, key: InvalidationKey, delay: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let task_key = key.clone();

        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("debouncer timer map poisoned");
        if let Some(previous) = timers.remove(&key) {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // A reschedule may have replaced this timer between the sleep
            // elapsing and the lock being acquired; the generation decides
            // which timer owns the entry.
            {
                let mut timers = inner.timers.lock().expect("debouncer timer map poisoned");
                match timers.get(&task_key) {
                    Some(pending) if pending.generation == generation => {
                        timers.remove(&task_key);
                    }
                    _ => return,
                }
            }

            let sink = inner
                .sink
                .read()
                .expect("debouncer sink lock poisoned")
                .clone();
            match sink {
                Some(cache) => cache.invalidate(&task_key),
                None => tracing::debug!("no query cache injected, dropping invalidation of {task_key}"),
            }
        });

        timers.insert(key, PendingTimer { generation, handle });
    }

    /// Number of keys with a pending timer.
    pub fn pending(&self) -> usize {
        self.inner
            .timers
            .lock()
            .expect("debouncer timer map poisoned")
            .len()
    }

    /// Cancel every pending timer without firing the sink.
    pub fn clear(&self) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .expect("debouncer timer map poisoned");
        for (_, pending) in timers.drain() {
            pending.handle.abort();
        }
    }
}

impl Drop for InvalidationDebouncer {
    fn drop(&mut self) {
        self.clear();
    }
}
