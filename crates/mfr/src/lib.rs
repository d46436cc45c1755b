//! Most-frequently-requested admission queues.
//!
//! A [`Queue`] counts hits against keyed items and only lets an item be
//! popped once it has accumulated a configured minimum number of hits.
//! A [`Pool`] stacks queues in priority order: the first queue whose
//! admission predicate accepts a key takes it, and a single scheduler task
//! then drains all queues at an equal per-round rate.

mod pool;
mod queue;

pub use pool::{Admission, Pool, Predicate};
pub use queue::{Popped, Queue, Status};
