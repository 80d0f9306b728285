//! Frame operators: the per-frame transforms the worker pool runs.

pub mod describe;
pub mod enhance;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::video::frame::Frame;

/// A per-frame transform, `Frame -> Output`, with unspecified cost.
///
/// Implementations must be `Send`; whether they may be called concurrently is
/// declared by the [`OperatorPolicy`] they are handed to the pool with.
pub trait FrameOperator: Send {
    type Output: Send;

    fn name(&self) -> &str;

    fn apply(&self, frame: Frame) -> Result<Self::Output>;
}

type Factory<O> = dyn Fn() -> Result<Box<dyn FrameOperator<Output = O>>> + Send + Sync;

/// How an operator is shared between pool workers.
pub enum OperatorPolicy<O> {
    /// One thread-safe instance, invoked concurrently by every worker.
    Shared(Arc<dyn FrameOperator<Output = O> + Sync>),
    /// A fresh instance per worker, built by the factory before workers start.
    PerWorker(Arc<Factory<O>>),
    /// One instance whose calls are serialized behind a mutex.
    Serialized(Arc<Mutex<Box<dyn FrameOperator<Output = O>>>>),
}

impl<O: Send> OperatorPolicy<O> {
    pub fn shared(op: impl FrameOperator<Output = O> + Sync + 'static) -> Self {
        Self::Shared(Arc::new(op))
    }

    pub fn per_worker<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn FrameOperator<Output = O>>> + Send + Sync + 'static,
    {
        Self::PerWorker(Arc::new(factory))
    }

    pub fn serialized(op: impl FrameOperator<Output = O> + 'static) -> Self {
        Self::Serialized(Arc::new(Mutex::new(Box::new(op))))
    }

    /// Produce the handle a single worker will use.
    pub(crate) fn instantiate(&self) -> Result<WorkerOperator<O>> {
        Ok(match self {
            Self::Shared(op) => WorkerOperator::Shared(Arc::clone(op)),
            Self::PerWorker(factory) => WorkerOperator::Owned(factory()?),
            Self::Serialized(op) => WorkerOperator::Serialized(Arc::clone(op)),
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Shared(_) => "shared",
            Self::PerWorker(_) => "per-worker",
            Self::Serialized(_) => "serialized",
        }
    }
}

/// The operator handle owned by one worker thread.
pub(crate) enum WorkerOperator<O> {
    Shared(Arc<dyn FrameOperator<Output = O> + Sync>),
    Owned(Box<dyn FrameOperator<Output = O>>),
    Serialized(Arc<Mutex<Box<dyn FrameOperator<Output = O>>>>),
}

impl<O: Send> WorkerOperator<O> {
    pub(crate) fn apply(&self, frame: Frame) -> Result<O> {
        match self {
            Self::Shared(op) => op.apply(frame),
            Self::Owned(op) => op.apply(frame),
            Self::Serialized(op) => op.lock().apply(frame),
        }
    }

    pub(crate) fn name(&self) -> String {
        match self {
            Self::Shared(op) => op.name().to_string(),
            Self::Owned(op) => op.name().to_string(),
            Self::Serialized(op) => op.lock().name().to_string(),
        }
    }
}
