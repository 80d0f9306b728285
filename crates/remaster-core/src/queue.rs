use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Thread-safe bounded FIFO with blocking push/pop and a one-shot close.
///
/// Once closed, `push` hands the item back and `pop` drains what is left
/// before reporting end of stream. Any number of producers and consumers may
/// share one queue.
pub struct WorkQueue<T> {
    name: &'static str,
    capacity: usize,
    grace: Duration,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    high_water: usize,
}

impl<T> WorkQueue<T> {
    /// `grace` is how long a push may block before a backpressure warning is logged.
    ///
    /// A zero capacity is treated as 1.
    pub fn new(name: &'static str, capacity: usize, grace: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            grace,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                high_water: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Returns the item back if the queue is (or becomes) closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        let started = Instant::now();
        let mut warned = false;

        while !state.closed && state.items.len() >= self.capacity {
            let result = self.not_full.wait_for(&mut state, self.grace);
            if result.timed_out() && !warned {
                warn!(
                    queue = self.name,
                    capacity = self.capacity,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "producer blocked on full queue"
                );
                warned = true;
            }
        }

        if state.closed {
            return Err(item);
        }

        state.items.push_back(item);
        state.high_water = state.high_water.max(state.items.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Signal that no more items will be pushed. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(queue = self.name, remaining = state.items.len(), "queue closed");
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close the queue and discard everything still queued.
    ///
    /// Returns how many items were dropped.
    pub fn abort(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let discarded = state.items.len();
        state.items.clear();
        drop(state);
        if discarded > 0 {
            warn!(queue = self.name, discarded, "queue aborted with pending items");
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        discarded
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Largest number of items held at once since creation.
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }
}
