use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::{Popped, Queue, Status};

/// How long the scheduler sleeps when a full round over all queues yields
/// nothing.
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of [`Pool::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accepted by a queue; the key was not previously tracked.
    Queued,
    /// The key is already queued or active somewhere in the pool.
    Underway,
    /// No queue accepted the key.
    Forbidden,
}

/// Admission predicate for one pool level. An accepting predicate is
/// responsible for calling `queue.hit(key, value)` itself (attaching any
/// lifecycle back-reference to the value first), and its return value
/// reflects whether the hit landed.
pub type Predicate<V> = Box<dyn Fn(&str, &V, &Arc<Queue<V>>) -> bool + Send + Sync>;

struct Level<V> {
    queue: Arc<Queue<V>>,
    predicate: Predicate<V>,
}

/// An ordered set of named queues. Queue order defines admission priority;
/// dispatch drains all queues evenly, one pop per queue per round.
pub struct Pool<V> {
    levels: Vec<Arc<Level<V>>>,
    token: CancellationToken,
}

impl<V: Clone + Send + Sync + 'static> Pool<V> {
    pub fn new() -> Self {
        Self {
            levels: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    /// Append a queue. Queues added earlier see admissions first.
    pub fn add_queue(&mut self, queue: Queue<V>, predicate: Predicate<V>) {
        self.levels.push(Arc::new(Level {
            queue: Arc::new(queue),
            predicate,
        }));
    }

    /// Admit `key` into the first queue whose predicate accepts it.
    ///
    /// A key that any queue already tracks is hit again in place (bumping
    /// its count) and reported as `Underway`.
    pub fn admit(&self, key: &str, value: &V) -> Admission {
        for level in &self.levels {
            let (_, status) = level.queue.get(key);
            if status != Status::None {
                level.queue.hit(key, value.clone());
                return Admission::Underway;
            }
        }
        for level in &self.levels {
            if (level.predicate)(key, value, &level.queue) {
                return Admission::Queued;
            }
        }
        Admission::Forbidden
    }

    /// First non-`None` status for `key`, scanning queues in priority order.
    pub fn status(&self, key: &str) -> Status {
        for level in &self.levels {
            let (_, status) = level.queue.get(key);
            if status != Status::None {
                return status;
            }
        }
        Status::None
    }

    /// Current backlog of each queue, in priority order.
    pub fn queue_sizes(&self) -> Vec<(String, usize)> {
        self.levels
            .iter()
            .map(|l| (l.queue.name().to_string(), l.queue.len()))
            .collect()
    }

    /// Spawn the scheduler task and return its output.
    ///
    /// Each round attempts one pop from every queue in order, so no queue
    /// can starve another once items are admitted. The channel holds a
    /// single item: the scheduler blocks until a consumer is ready, which is
    /// what produces backpressure from slow workers.
    pub fn start(&self) -> mpsc::Receiver<Popped<V>> {
        let (tx, rx) = mpsc::channel(1);
        let levels = self.levels.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            loop {
                let mut popped_any = false;
                for level in &levels {
                    if token.is_cancelled() {
                        return;
                    }
                    let Some(item) = level.queue.pop() else {
                        continue;
                    };
                    popped_any = true;
                    tracing::debug!(
                        queue = level.queue.name(),
                        key = %item.key,
                        hits = item.hits,
                        "popped item for dispatch"
                    );
                    tokio::select! {
                        res = tx.send(item.clone()) => {
                            if res.is_err() {
                                // Consumer went away; put the item back.
                                level.queue.release(&item.key);
                                return;
                            }
                        }
                        () = token.cancelled() => {
                            level.queue.release(&item.key);
                            return;
                        }
                    }
                }
                if !popped_any {
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_INTERVAL) => {}
                        () = token.cancelled() => return,
                    }
                }
            }
        });

        rx
    }

    /// Stop the scheduler. Consumers of [`Pool::start`] observe
    /// end-of-stream.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl<V: Clone + Send + Sync + 'static> Default for Pool<V> {
    fn default() -> Self {
        Self::new()
    }
}
