//! Pipeline orchestration.
//!
//! One producer thread reads the source and tags frames with sequence numbers,
//! a worker pool applies the operator, and one consumer thread drains the
//! sequencer in order. Enhancement runs feed the consumer into the frame-rate
//! adapter and the sink; describe runs hand summaries to a callback.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread::{self, ScopedJoinHandle};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapter::{FrameRateAdapter, RateConversionPlan};
use crate::config::PipelineConfig;
use crate::debug::DebugRenderer;
use crate::error::{PipelineError, Result};
use crate::ops::describe::{Describe, FrameSummary};
use crate::ops::enhance::{Chain, Denoise, Identity, Reframe, Upscale};
use crate::ops::{FrameOperator, OperatorPolicy};
use crate::queue::WorkQueue;
use crate::sequencer::Sequencer;
use crate::video::decoder::VideoDecoder;
use crate::video::encoder::VideoEncoder;
use crate::video::frame::{Frame, Sequenced, SequencedFrame};
use crate::video::{FrameSink, FrameSource, StreamInfo};
use crate::workers::{panic_message, Completion, WorkerPool, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Stopped,
    Aborted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    /// Frames pulled from the source.
    pub frames_read: u64,
    /// Frames the operator completed successfully.
    pub processed: u64,
    /// Sequence numbers that never reached the consumer, ascending.
    pub skipped: Vec<u64>,
    /// Frames handed to the sink (or summaries to the callback).
    pub frames_written: u64,
    pub synthetic: u64,
    pub repeats: u64,
    pub queue_high_water: usize,
    pub reorder_high_water: usize,
    pub state: PipelineState,
}

/// Tracks the run state. `Aborted` is terminal.
struct Lifecycle {
    run: &'static str,
    state: Mutex<PipelineState>,
}

impl Lifecycle {
    fn new(run: &'static str) -> Self {
        Self {
            run,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn advance(&self, to: PipelineState) {
        let mut state = self.state.lock();
        if *state == PipelineState::Aborted || *state == to {
            return;
        }
        let from = *state;
        info!(run = self.run, %from, %to, "pipeline state changed");
        *state = to;
    }
}

/// State shared by every thread of one run.
struct RunContext<'l, O> {
    lifecycle: &'l Lifecycle,
    input: WorkQueue<SequencedFrame>,
    sequencer: Sequencer<Completion<O>>,
    first_error: Mutex<Option<PipelineError>>,
}

impl<O> RunContext<'_, O> {
    /// Record a fatal error and tear the pipeline down. The first error wins.
    fn fail(&self, err: PipelineError) {
        {
            let mut first = self.first_error.lock();
            if first.is_some() {
                debug!(error = %err, "already aborting, dropping later error");
                return;
            }
            error!(error = %err, "fatal pipeline error, aborting");
            *first = Some(err);
        }
        self.lifecycle.advance(PipelineState::Aborted);
        let discarded = self.input.abort();
        self.sequencer.abort();
        debug!(discarded, "input queue and sequencer aborted");
    }

    fn take_error(&self) -> Option<PipelineError> {
        self.first_error.lock().take()
    }

    /// Run a thread body, turning a panic into a fatal error.
    fn guarded<T: Default>(&self, stage: &str, body: impl FnOnce() -> T) -> T {
        panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            self.fail(PipelineError::ThreadPanic(format!("{stage}: {message}")));
            T::default()
        })
    }

    fn join<T: Default>(&self, stage: &str, handle: ScopedJoinHandle<'_, T>) -> T {
        handle.join().unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            self.fail(PipelineError::ThreadPanic(format!("{stage}: {message}")));
            T::default()
        })
    }
}

#[derive(Debug, Default)]
struct ConsumerTally {
    delivered: u64,
    failed: Vec<u64>,
}

/// What the generic stages report back to the run that drove them.
struct StageReport {
    frames_read: u64,
    processed: u64,
    skipped: Vec<u64>,
    queue_high_water: usize,
    reorder_high_water: usize,
}

/// Drive source → pool → sequencer → `consume`, in sequence order.
///
/// Returns once every thread has been joined. On a fatal error the lifecycle
/// is left `Aborted` and the first error is returned.
fn run_stages<O, C>(
    source: &mut dyn FrameSource,
    policy: &OperatorPolicy<O>,
    config: &PipelineConfig,
    lifecycle: &Lifecycle,
    consume: C,
) -> Result<StageReport>
where
    O: Send,
    C: FnMut(u64, O) -> anyhow::Result<()> + Send,
{
    let pool = WorkerPool::new(policy, config.workers)?;
    let ctx = RunContext {
        lifecycle,
        input: WorkQueue::new("input", config.queue_capacity, config.backpressure_grace()),
        sequencer: Sequencer::new(config.reorder_capacity, config.backpressure_grace()),
        first_error: Mutex::new(None),
    };

    lifecycle.advance(PipelineState::Running);
    let ctx = &ctx;
    let joined = thread::scope(|s| {
        let producer = thread::Builder::new()
            .name("remaster-producer".to_string())
            .spawn_scoped(s, move || ctx.guarded("producer", || produce(source, ctx)));
        let producer = match producer {
            Ok(handle) => handle,
            Err(e) => {
                ctx.fail(PipelineError::ThreadSpawn(e));
                return None;
            }
        };

        let workers = match pool.spawn(s, &ctx.input, &ctx.sequencer) {
            Ok(handles) => handles,
            Err(e) => {
                ctx.fail(e);
                return None;
            }
        };

        let consumer = thread::Builder::new()
            .name("remaster-consumer".to_string())
            .spawn_scoped(s, move || {
                let mut consume = consume;
                ctx.guarded("consumer", || drain(ctx, &mut consume))
            });
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                ctx.fail(PipelineError::ThreadSpawn(e));
                return None;
            }
        };

        let frames_read = ctx.join("producer", producer);
        lifecycle.advance(PipelineState::Draining);

        let worker_stats: Vec<WorkerStats> = workers
            .into_iter()
            .map(|h| ctx.join("worker", h))
            .collect();
        ctx.sequencer.close();
        debug!("workers joined, sequencer closed");

        let tally = ctx.join("consumer", consumer);
        Some((frames_read, worker_stats, tally))
    });

    if let Some(err) = ctx.take_error() {
        return Err(err);
    }
    let Some((frames_read, worker_stats, tally)) = joined else {
        return Err(PipelineError::ThreadPanic("pipeline stopped without an error".to_string()));
    };

    let mut skipped = tally.failed;
    skipped.extend(ctx.sequencer.skipped());
    skipped.sort_unstable();

    Ok(StageReport {
        frames_read,
        processed: worker_stats.iter().map(|s| s.processed).sum(),
        skipped,
        queue_high_water: ctx.input.high_water(),
        reorder_high_water: ctx.sequencer.high_water(),
    })
}

/// Read the source to exhaustion, assigning gap-free sequence numbers.
fn produce<O>(source: &mut dyn FrameSource, ctx: &RunContext<'_, O>) -> u64 {
    let mut seq = 0u64;
    loop {
        match source.next_frame() {
            Ok(Some(frame)) => {
                if ctx.input.push(Sequenced { seq, item: frame }).is_err() {
                    debug!(seq, "input queue closed, producer stopping");
                    break;
                }
                seq += 1;
            }
            Ok(None) => {
                info!(frames = seq, "source exhausted");
                break;
            }
            Err(e) => {
                ctx.fail(PipelineError::SourceRead(e));
                break;
            }
        }
    }
    ctx.input.close();
    seq
}

fn drain<O, C>(ctx: &RunContext<'_, O>, consume: &mut C) -> ConsumerTally
where
    C: FnMut(u64, O) -> anyhow::Result<()>,
{
    let mut tally = ConsumerTally::default();
    while let Some(Sequenced { seq, item }) = ctx.sequencer.next() {
        match item {
            Ok(output) => {
                if let Err(source) = consume(seq, output) {
                    ctx.fail(PipelineError::Consumer { seq, source });
                    break;
                }
                tally.delivered += 1;
            }
            Err(failure) => {
                warn!(
                    seq,
                    frame_number = failure.frame_number,
                    error = %failure.error,
                    "skipping frame"
                );
                tally.failed.push(seq);
            }
        }
    }
    debug!(delivered = tally.delivered, failed = tally.failed.len(), "consumer finished");
    tally
}

fn check_stream(info: &StreamInfo) -> Result<()> {
    if info.width == 0 || info.height == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "source has invalid dimensions {}x{}",
            info.width, info.height
        )));
    }
    Ok(())
}

/// The target rate defaults to the source rate.
pub fn plan_for(info: &StreamInfo, config: &PipelineConfig) -> Result<RateConversionPlan> {
    RateConversionPlan::new(info.fps, config.target_fps.unwrap_or(info.fps))
}

/// Output frame dimensions for a source under `config`: reframed, then scaled.
pub fn output_dimensions(info: &StreamInfo, config: &PipelineConfig) -> Result<(u32, u32)> {
    let (width, height) = match config.aspect {
        Some(aspect) => Reframe::new(aspect, config.side_fill)
            .output_size(info.width, info.height)
            .map_err(|e| PipelineError::InvalidConfig(format!("{e:#}")))?,
        None => (info.width, info.height),
    };
    match (width.checked_mul(config.scale), height.checked_mul(config.scale)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(PipelineError::InvalidConfig(format!(
            "scale {} overflows {}x{}",
            config.scale, width, height
        ))),
    }
}

/// Denoise, reframe, then upscale, as configured. One shared instance serves every worker.
pub fn enhancement_policy(config: &PipelineConfig) -> Result<OperatorPolicy<Frame>> {
    let mut stages: Vec<Box<dyn FrameOperator<Output = Frame> + Sync>> = Vec::new();
    if config.denoise_radius > 0 {
        stages.push(Box::new(Denoise::new(config.denoise_radius)));
    }
    if let Some(aspect) = config.aspect {
        stages.push(Box::new(Reframe::new(aspect, config.side_fill)));
    }
    if config.scale > 1 {
        let upscale = Upscale::new(config.scale, config.filter).map_err(PipelineError::OperatorInit)?;
        stages.push(Box::new(upscale));
    }

    if stages.is_empty() {
        Ok(OperatorPolicy::shared(Identity))
    } else {
        Ok(OperatorPolicy::shared(Chain::new(stages)))
    }
}

/// Run the enhancement pipeline from `source` to `sink`.
///
/// The sink is closed on success, and best-effort after a fatal error.
pub fn run_pipeline(
    source: &mut dyn FrameSource,
    sink: &mut dyn FrameSink,
    policy: &OperatorPolicy<Frame>,
    config: &PipelineConfig,
) -> Result<PipelineReport> {
    let lifecycle = Lifecycle::new("enhance");
    let info = source.info();

    let setup = config
        .validate()
        .and_then(|()| check_stream(&info))
        .and_then(|()| plan_for(&info, config));
    let plan = match setup {
        Ok(plan) => plan,
        Err(e) => {
            close_after_abort(sink);
            return Err(e);
        }
    };

    info!(
        width = info.width,
        height = info.height,
        source_fps = info.fps,
        target_fps = plan.target_fps,
        frame_count = ?info.frame_count,
        workers = config.workers,
        queue_capacity = config.queue_capacity,
        reorder_capacity = config.reorder_capacity,
        "pipeline starting"
    );

    let renderer = match &config.debug_frames_dir {
        Some(dir) => match DebugRenderer::new(dir, config.debug_every, config.debug_font.as_deref()) {
            Ok(renderer) => Some(renderer),
            Err(e) => {
                close_after_abort(sink);
                return Err(PipelineError::InvalidConfig(format!("{e:#}")));
            }
        },
        None => None,
    };

    let mut adapter = FrameRateAdapter::new(plan, config.mode);
    let stages = run_stages(source, policy, config, &lifecycle, |seq, frame: Frame| {
        adapter.push(seq, frame, |out| {
            if let Some(renderer) = &renderer {
                renderer.observe(&out).context("failed to save debug frame")?;
            }
            sink.write(out.frame)
                .with_context(|| format!("failed to write output frame {}", out.index))
        })
    });

    let stages = match stages {
        Ok(stages) => stages,
        Err(e) => {
            close_after_abort(sink);
            return Err(e);
        }
    };

    if let Err(e) = sink.close() {
        lifecycle.advance(PipelineState::Aborted);
        error!(error = %e, "failed to close sink");
        return Err(PipelineError::SinkClose(e));
    }
    lifecycle.advance(PipelineState::Stopped);

    let stats = adapter.stats();
    let report = PipelineReport {
        frames_read: stages.frames_read,
        processed: stages.processed,
        skipped: stages.skipped,
        frames_written: stats.emitted(),
        synthetic: stats.synthetic,
        repeats: stats.repeats,
        queue_high_water: stages.queue_high_water,
        reorder_high_water: stages.reorder_high_water,
        state: lifecycle.state(),
    };
    log_report("enhance", &report);
    Ok(report)
}

fn close_after_abort(sink: &mut dyn FrameSink) {
    if let Err(e) = sink.close() {
        warn!(error = %e, "failed to close sink after abort");
    }
}

/// Run the content-description pipeline, handing summaries to `emit` in order.
pub fn run_describe<E>(
    source: &mut dyn FrameSource,
    config: &PipelineConfig,
    mut emit: E,
) -> Result<PipelineReport>
where
    E: FnMut(&FrameSummary) -> anyhow::Result<()> + Send,
{
    let lifecycle = Lifecycle::new("describe");
    config.validate()?;
    check_stream(&source.info())?;

    let policy = OperatorPolicy::shared(Describe);
    let mut emitted = 0u64;
    let stages = run_stages(source, &policy, config, &lifecycle, |_, summary: FrameSummary| {
        emit(&summary)?;
        emitted += 1;
        Ok(())
    })?;
    lifecycle.advance(PipelineState::Stopped);

    let report = PipelineReport {
        frames_read: stages.frames_read,
        processed: stages.processed,
        skipped: stages.skipped,
        frames_written: emitted,
        synthetic: 0,
        repeats: 0,
        queue_high_water: stages.queue_high_water,
        reorder_high_water: stages.reorder_high_water,
        state: lifecycle.state(),
    };
    log_report("describe", &report);
    Ok(report)
}

fn log_report(run: &str, report: &PipelineReport) {
    info!(
        run,
        frames_read = report.frames_read,
        processed = report.processed,
        skipped = report.skipped.len(),
        frames_written = report.frames_written,
        synthetic = report.synthetic,
        repeats = report.repeats,
        queue_high_water = report.queue_high_water,
        reorder_high_water = report.reorder_high_water,
        state = %report.state,
        "pipeline complete"
    );
}

/// Enhance the video at `input` and encode the result to `output`.
pub fn remaster(input: &Path, output: &Path, config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;
    info!(?input, ?output, "opening remaster run");

    let mut decoder = VideoDecoder::open(input).map_err(|source| PipelineError::SourceOpen {
        path: input.to_path_buf(),
        source,
    })?;
    let info = decoder.info();
    check_stream(&info)?;
    let plan = plan_for(&info, config)?;
    let (width, height) = output_dimensions(&info, config)?;
    let policy = enhancement_policy(config)?;

    let mut encoder = VideoEncoder::open(output, plan.target_fps, width, height, &config.encoder)
        .map_err(|source| PipelineError::SinkOpen {
            path: output.to_path_buf(),
            source,
        })?;

    let report = run_pipeline(&mut decoder, &mut encoder, &policy, config)?;
    info!(
        ?output,
        width,
        height,
        encoded = encoder.frames_written(),
        "output encoded"
    );
    Ok(report)
}

/// Describe every frame of the video at `input`.
pub fn describe<E>(input: &Path, config: &PipelineConfig, emit: E) -> Result<PipelineReport>
where
    E: FnMut(&FrameSummary) -> anyhow::Result<()> + Send,
{
    config.validate()?;
    let mut decoder = VideoDecoder::open(input).map_err(|source| PipelineError::SourceOpen {
        path: input.to_path_buf(),
        source,
    })?;
    run_describe(&mut decoder, config, emit)
}
