use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, Scope, ScopedJoinHandle};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::ops::{OperatorPolicy, WorkerOperator};
use crate::queue::WorkQueue;
use crate::sequencer::Sequencer;
use crate::video::frame::SequencedFrame;

/// A frame the operator could not process. The pipeline skips it.
#[derive(Debug)]
pub struct FrameFailure {
    pub seq: u64,
    pub frame_number: u64,
    pub error: anyhow::Error,
}

/// What a worker hands to the sequencer for one sequence number.
pub type Completion<O> = std::result::Result<O, FrameFailure>;

/// Per-worker counters, returned when the worker exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
}

/// N symmetric workers between the input queue and the sequencer.
pub struct WorkerPool<O> {
    operators: Vec<WorkerOperator<O>>,
}

impl<O: Send> WorkerPool<O> {
    /// Build one operator handle per worker.
    ///
    /// Factory failures surface here, before any thread is started.
    pub fn new(policy: &OperatorPolicy<O>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker pool size must be >= 1".to_string(),
            ));
        }
        let operators = (0..size)
            .map(|_| policy.instantiate())
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::OperatorInit)?;

        info!(
            workers = size,
            policy = policy.describe(),
            operator = %operators[0].name(),
            "worker pool ready"
        );
        Ok(Self { operators })
    }

    pub fn size(&self) -> usize {
        self.operators.len()
    }

    /// Spawn the workers inside `scope`.
    ///
    /// On a spawn failure the workers already started keep running; the caller
    /// must close or abort `input` so they can exit.
    pub fn spawn<'scope, 'env>(
        self,
        scope: &'scope Scope<'scope, 'env>,
        input: &'scope WorkQueue<SequencedFrame>,
        output: &'scope Sequencer<Completion<O>>,
    ) -> Result<Vec<ScopedJoinHandle<'scope, WorkerStats>>>
    where
        O: 'scope,
    {
        self.operators
            .into_iter()
            .enumerate()
            .map(|(id, op)| {
                thread::Builder::new()
                    .name(format!("remaster-worker-{id}"))
                    .spawn_scoped(scope, move || run_worker(id, &op, input, output))
                    .map_err(PipelineError::ThreadSpawn)
            })
            .collect()
    }
}

/// Pull frames until the input queue ends, submitting each result in turn.
fn run_worker<O: Send>(
    id: usize,
    op: &WorkerOperator<O>,
    input: &WorkQueue<SequencedFrame>,
    output: &Sequencer<Completion<O>>,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    debug!(worker = id, "worker started");

    while let Some(sequenced) = input.pop() {
        let seq = sequenced.seq;
        let frame_number = sequenced.item.frame_number;

        let completion = match panic::catch_unwind(AssertUnwindSafe(|| op.apply(sequenced.item))) {
            Ok(Ok(out)) => {
                stats.processed += 1;
                Ok(out)
            }
            Ok(Err(error)) => {
                stats.failed += 1;
                warn!(worker = id, seq, frame_number, error = %error, "operator failed on frame");
                Err(FrameFailure { seq, frame_number, error })
            }
            Err(payload) => {
                stats.failed += 1;
                let message = panic_message(payload.as_ref());
                warn!(worker = id, seq, frame_number, %message, "operator panicked on frame");
                Err(FrameFailure {
                    seq,
                    frame_number,
                    error: anyhow!("operator panicked: {message}"),
                })
            }
        };

        if output.submit(seq, completion).is_err() {
            debug!(worker = id, seq, "sequencer aborted, worker exiting");
            break;
        }
    }

    debug!(worker = id, processed = stats.processed, failed = stats.failed, "worker finished");
    stats
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::RgbImage;
    use tracing_test::traced_test;

    use super::*;
    use crate::ops::FrameOperator;
    use crate::video::frame::{Frame, Sequenced};

    const GRACE: Duration = Duration::from_millis(50);

    struct FrameNumber;

    impl FrameOperator for FrameNumber {
        type Output = u64;

        fn name(&self) -> &str {
            "frame-number"
        }

        fn apply(&self, frame: Frame) -> anyhow::Result<u64> {
            match frame.frame_number {
                3 => anyhow::bail!("bad frame"),
                4 => panic!("operator exploded"),
                n => Ok(n),
            }
        }
    }

    fn feed(queue: &WorkQueue<SequencedFrame>, count: u64) {
        for n in 0..count {
            let frame = Frame::new(RgbImage::new(1, 1), n, 0.0);
            queue.push(Sequenced { seq: n, item: frame }).unwrap();
        }
        queue.close();
    }

    #[test]
    #[traced_test]
    fn failures_and_panics_become_per_frame_completions() {
        let input = WorkQueue::new("input", 16, GRACE);
        let output = Sequencer::new(16, GRACE);
        feed(&input, 6);

        let pool = WorkerPool::new(&OperatorPolicy::shared(FrameNumber), 3).unwrap();
        let stats: Vec<WorkerStats> = thread::scope(|s| {
            pool.spawn(s, &input, &output)
                .unwrap()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        output.close();

        assert_eq!(stats.iter().map(|s| s.processed).sum::<u64>(), 4);
        assert_eq!(stats.iter().map(|s| s.failed).sum::<u64>(), 2);

        let results: Vec<_> = std::iter::from_fn(|| output.next())
            .map(|c| (c.seq, c.item.map_err(|f| f.frame_number)))
            .collect();
        assert_eq!(
            results,
            vec![(0, Ok(0)), (1, Ok(1)), (2, Ok(2)), (3, Err(3)), (4, Err(4)), (5, Ok(5))]
        );
    }

    #[test]
    fn per_worker_policy_builds_one_instance_each() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let policy = OperatorPolicy::per_worker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FrameNumber) as Box<dyn FrameOperator<Output = u64>>)
        });

        let pool = WorkerPool::new(&policy, 4).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(built.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn factory_failure_is_a_setup_error() {
        let policy: OperatorPolicy<u64> =
            OperatorPolicy::per_worker(|| Err(anyhow!("model file missing")));
        let err = WorkerPool::new(&policy, 2).err().unwrap();
        assert!(matches!(err, PipelineError::OperatorInit(_)));
        assert!(err.is_setup_error());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = WorkerPool::new(&OperatorPolicy::shared(FrameNumber), 0).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn serialized_policy_processes_everything() {
        let input = WorkQueue::new("input", 4, GRACE);
        let output = Sequencer::new(4, GRACE);
        let pool = WorkerPool::new(&OperatorPolicy::serialized(FrameNumber), 2).unwrap();

        thread::scope(|s| {
            let handles = pool.spawn(s, &input, &output).unwrap();
            for (seq, n) in [0u64, 1, 2, 5].into_iter().enumerate() {
                let frame = Frame::new(RgbImage::new(1, 1), n, 0.0);
                input.push(Sequenced { seq: seq as u64, item: frame }).unwrap();
            }
            input.close();
            for h in handles {
                h.join().unwrap();
            }
        });
        output.close();

        let values: Vec<u64> = std::iter::from_fn(|| output.next())
            .filter_map(|c| c.item.ok())
            .collect();
        assert_eq!(values, vec![0, 1, 2, 5]);
    }

    /// Fails the frame if another call is running at the same time.
    struct Exclusive {
        inside: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl FrameOperator for Exclusive {
        type Output = u64;

        fn name(&self) -> &str {
            "exclusive"
        }

        fn apply(&self, frame: Frame) -> anyhow::Result<u64> {
            use std::sync::atomic::Ordering;

            let concurrent = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(Duration::from_millis(5));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            if concurrent != 1 {
                anyhow::bail!("{concurrent} calls in flight");
            }
            Ok(frame.frame_number)
        }
    }

    #[test]
    fn serialized_policy_never_overlaps_calls() {
        let inside = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let policy = OperatorPolicy::serialized(Exclusive {
            inside: std::sync::Arc::clone(&inside),
        });
        let input = WorkQueue::new("input", 32, GRACE);
        let output = Sequencer::new(32, GRACE);
        feed(&input, 24);

        let pool = WorkerPool::new(&policy, 4).unwrap();
        let stats: Vec<WorkerStats> = thread::scope(|s| {
            pool.spawn(s, &input, &output)
                .unwrap()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        output.close();

        assert_eq!(stats.iter().map(|s| s.failed).sum::<u64>(), 0);
        assert_eq!(stats.iter().map(|s| s.processed).sum::<u64>(), 24);
        let values: Vec<u64> = std::iter::from_fn(|| output.next())
            .map(|c| c.item.unwrap())
            .collect();
        assert_eq!(values, (0..24).collect::<Vec<u64>>());
    }
}
