use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::video::frame::Sequenced;

/// Reorder buffer restoring sequence-number order for out-of-order completions.
///
/// Held items live in an arena of `capacity` slots indexed by `seq % capacity`.
/// Only sequence numbers inside the window `[next, next + capacity)` are
/// accepted; submitters beyond it block until the window advances. The next
/// expected number is always inside the window, so submission can never
/// deadlock on the item that would unblock everyone else.
pub struct Sequencer<T> {
    capacity: usize,
    grace: Duration,
    state: Mutex<SequencerState<T>>,
    ready: Condvar,
    space: Condvar,
}

struct SequencerState<T> {
    slots: Vec<Option<T>>,
    next: u64,
    held: usize,
    high_water: usize,
    skipped: Vec<u64>,
    closed: bool,
    aborted: bool,
}

impl<T> SequencerState<T> {
    fn slot(&self, seq: u64, capacity: usize) -> usize {
        (seq % capacity as u64) as usize
    }
}

impl<T> Sequencer<T> {
    /// A zero capacity is treated as 1.
    pub fn new(capacity: usize, grace: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            grace,
            state: Mutex::new(SequencerState {
                slots: (0..capacity).map(|_| None).collect(),
                next: 0,
                held: 0,
                high_water: 0,
                skipped: Vec::new(),
                closed: false,
                aborted: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
        }
    }

    /// Hand over the completion for `seq`, blocking while it is ahead of the window.
    ///
    /// Returns the item back if the sequencer was aborted, `seq` was already
    /// passed, or `seq` is already held.
    pub fn submit(&self, seq: u64, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        let started = Instant::now();
        let mut warned = false;

        while !state.aborted && seq >= state.next + self.capacity as u64 {
            let result = self.space.wait_for(&mut state, self.grace);
            if result.timed_out() && !warned {
                warn!(
                    seq,
                    next = state.next,
                    capacity = self.capacity,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "completion blocked on full reorder window"
                );
                warned = true;
            }
        }

        if state.aborted {
            return Err(item);
        }
        if seq < state.next {
            warn!(seq, next = state.next, "late completion for passed sequence number");
            return Err(item);
        }

        let slot = state.slot(seq, self.capacity);
        if state.slots[slot].is_some() {
            warn!(seq, "duplicate completion for sequence number");
            return Err(item);
        }
        state.slots[slot] = Some(item);
        state.held += 1;
        state.high_water = state.high_water.max(state.held);

        let is_next = seq == state.next;
        drop(state);
        if is_next {
            self.ready.notify_all();
        }
        Ok(())
    }

    /// Take the next item in sequence order, blocking until it arrives.
    ///
    /// After `close`, holes left by completions that never arrived are skipped.
    /// Returns `None` once closed and drained, or immediately after `abort`.
    pub fn next(&self) -> Option<Sequenced<T>> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return None;
            }

            let seq = state.next;
            let slot = state.slot(seq, self.capacity);
            if let Some(item) = state.slots[slot].take() {
                state.next += 1;
                state.held -= 1;
                drop(state);
                self.space.notify_all();
                return Some(Sequenced { seq, item });
            }

            if state.closed {
                if state.held == 0 {
                    return None;
                }
                warn!(seq, "sequence number never completed, skipping");
                state.skipped.push(seq);
                state.next += 1;
                continue;
            }

            self.ready.wait(&mut state);
        }
    }

    /// Signal that no further completions will be submitted. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(next = state.next, held = state.held, "sequencer closed");
        }
        drop(state);
        self.ready.notify_all();
        self.space.notify_all();
    }

    /// Discard everything held and wake all waiters.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.closed = true;
        let discarded = state.held;
        state.slots.iter_mut().for_each(|s| *s = None);
        state.held = 0;
        drop(state);
        if discarded > 0 {
            warn!(discarded, "sequencer aborted with held completions");
        }
        self.ready.notify_all();
        self.space.notify_all();
    }

    /// Next sequence number to be emitted.
    pub fn next_expected(&self) -> u64 {
        self.state.lock().next
    }

    /// Completions currently held out of order.
    pub fn held(&self) -> usize {
        self.state.lock().held
    }

    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }

    /// Sequence numbers skipped because they never completed.
    pub fn skipped(&self) -> Vec<u64> {
        self.state.lock().skipped.clone()
    }
}
