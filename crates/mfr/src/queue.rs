use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default retention of completed items, so that status polls shortly after
/// completion still observe `Done` rather than `None`.
const DONE_RETENTION: Duration = Duration::from_secs(600);

/// Status of a keyed item within a [`Queue`].
///
/// Transitions form the DAG `None -> Queued -> Active -> {Done, Queued}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The key is not tracked by this queue.
    None,
    /// Admitted and awaiting dispatch.
    Queued,
    /// Handed to a worker.
    Active,
    /// Finished (successfully or not). Retained for a while, then evicted.
    Done,
}

/// An item popped from a [`Queue`], transitioned to `Active`.
#[derive(Debug, Clone)]
pub struct Popped<V> {
    pub key: String,
    pub value: V,
    pub hits: u64,
}

struct Item<V> {
    value: V,
    hits: u64,
    status: Status,
    last_hit: Instant,
    done_at: Option<Instant>,
    seq: u64,
}

struct Inner<V> {
    items: HashMap<String, Item<V>>,
    next_seq: u64,
}

/// A named, hit-counted admission queue.
///
/// All operations take the queue's internal lock, so concurrent `hit` and
/// `get` callers interleave safely with the scheduler's `pop`.
pub struct Queue<V> {
    name: String,
    min_hits: AtomicU64,
    max_size: Option<usize>,
    done_retention: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> Queue<V> {
    pub fn new(name: impl Into<String>, min_hits: u64) -> Self {
        Self {
            name: name.into(),
            min_hits: AtomicU64::new(min_hits),
            max_size: None,
            done_retention: DONE_RETENTION,
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Bound the backlog of pending items. Once reached, hits against
    /// unknown keys are rejected until items complete and are evicted.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    #[cfg(test)]
    fn with_done_retention(mut self, retention: Duration) -> Self {
        self.done_retention = retention;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_hits(&self) -> u64 {
        self.min_hits.load(Ordering::Relaxed)
    }

    /// Reconfigure the threshold at which items become dequeueable.
    pub fn set_min_hits(&self, min_hits: u64) {
        self.min_hits.store(min_hits, Ordering::Relaxed);
    }

    /// Record a hit for `key`. Unknown keys are inserted as `Queued` with one
    /// hit; `Queued` keys have their hit count bumped; `Active` and `Done`
    /// keys are left untouched. Returns false only when the key is unknown
    /// and the queue's backlog bound is reached.
    pub fn hit(&self, key: &str, value: V) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.evict_expired(&mut inner);

        if let Some(item) = inner.items.get_mut(key) {
            if item.status == Status::Queued {
                item.hits += 1;
                item.last_hit = Instant::now();
            }
            return true;
        }

        if let Some(max) = self.max_size {
            let backlog = inner
                .items
                .values()
                .filter(|i| i.status != Status::Done)
                .count();
            if backlog >= max {
                tracing::warn!(queue = %self.name, key, backlog, "queue backlog is full, rejecting");
                return false;
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.insert(
            key.to_string(),
            Item {
                value,
                hits: 1,
                status: Status::Queued,
                last_hit: Instant::now(),
                done_at: None,
                seq,
            },
        );
        true
    }

    /// Look up `key`, returning its value and status.
    pub fn get(&self, key: &str) -> (Option<V>, Status) {
        let inner = self.inner.lock().unwrap();
        match inner.items.get(key) {
            Some(item) => (Some(item.value.clone()), item.status),
            None => (None, Status::None),
        }
    }

    /// Pop the hottest dequeueable item, transitioning it to `Active`.
    ///
    /// Eligible items are `Queued` with at least `min_hits` hits. Among them
    /// the highest hit count wins; ties go to the longest-unhit item, then to
    /// insertion order.
    pub fn pop(&self) -> Option<Popped<V>> {
        let mut inner = self.inner.lock().unwrap();
        self.evict_expired(&mut inner);

        let min_hits = self.min_hits();
        let key = inner
            .items
            .iter()
            .filter(|(_, i)| i.status == Status::Queued && i.hits >= min_hits)
            .max_by(|(_, a), (_, b)| {
                a.hits
                    .cmp(&b.hits)
                    .then(b.last_hit.cmp(&a.last_hit))
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(k, _)| k.clone())?;

        let item = inner.items.get_mut(&key).unwrap();
        item.status = Status::Active;
        Some(Popped {
            key,
            value: item.value.clone(),
            hits: item.hits,
        })
    }

    /// Return an `Active` item to `Queued` without resetting its counters.
    /// Used when a worker declines the item without finishing it.
    pub fn release(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(key) {
            if item.status == Status::Active {
                item.status = Status::Queued;
            }
        }
    }

    /// Transition `key` to `Done` from any state. The item lingers for the
    /// retention window so that status polls see `Done`, then is evicted.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(key) {
            item.status = Status::Done;
            item.done_at = Some(Instant::now());
        }
    }

    /// Number of items not yet `Done`.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .items
            .values()
            .filter(|i| i.status != Status::Done)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, inner: &mut Inner<V>) {
        let retention = self.done_retention;
        inner
            .items
            .retain(|_, i| i.done_at.map_or(true, |at| at.elapsed() < retention));
    }
}
