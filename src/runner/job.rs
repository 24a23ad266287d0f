//! Jobs and the lazy source that hands them out to slots.

use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};

/// A zero-argument unit of asynchronous work.
///
/// `run` is invoked once per attempt, so a job that is retried runs more
/// than once. Any `FnMut() -> impl Future<Output = anyhow::Result<()>>`
/// closure is a job.
#[async_trait]
pub trait Job: Send {
    /// Execute one attempt.
    async fn run(&mut self) -> anyhow::Result<()>;

    /// Name used in events and failure reports.
    fn label(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&mut self) -> anyhow::Result<()> {
        (self)().await
    }
}

/// A job boxed for the source.
pub type BoxedJob = Box<dyn Job>;

/// A job with a fixed label.
pub struct Labeled<J> {
    label: String,
    job: J,
}

#[async_trait]
impl<J: Job> Job for Labeled<J> {
    async fn run(&mut self) -> anyhow::Result<()> {
        self.job.run().await
    }

    fn label(&self) -> Option<String> {
        Some(self.label.clone())
    }
}

/// Attach a label to a job.
pub fn labeled<J: Job>(label: impl Into<String>, job: J) -> Labeled<J> {
    Labeled {
        label: label.into(),
        job,
    }
}

/// A lazy, finite, pull-based sequence of jobs.
///
/// Each item is either the next job or a source failure. The end of the
/// stream means the source is exhausted. Nothing is produced until a slot
/// asks for it.
pub struct JobSource {
    inner: BoxStream<'static, anyhow::Result<BoxedJob>>,
}

impl JobSource {
    /// Source over any iterator of jobs. The iterator is advanced lazily.
    pub fn from_jobs<I, J>(jobs: I) -> Self
    where
        I: IntoIterator<Item = J>,
        I::IntoIter: Send + 'static,
        J: Job + 'static,
    {
        Self::from_stream(stream::iter(jobs))
    }

    /// Source over a stream of jobs.
    pub fn from_stream<S, J>(jobs: S) -> Self
    where
        S: Stream<Item = J> + Send + 'static,
        J: Job + 'static,
    {
        Self::from_fallible(jobs.map(Ok::<J, anyhow::Error>))
    }

    /// Source over a stream that may fail to produce its next job.
    pub fn from_fallible<S, J>(jobs: S) -> Self
    where
        S: Stream<Item = anyhow::Result<J>> + Send + 'static,
        J: Job + 'static,
    {
        Self::from_boxed(jobs.map(|item| item.map(|job| Box::new(job) as BoxedJob)))
    }

    /// Source over already boxed jobs, for mixing job types in one run.
    ///
    /// The stream is fused: once it ends, later pulls see `None` without
    /// polling it again.
    pub fn from_boxed<S>(jobs: S) -> Self
    where
        S: Stream<Item = anyhow::Result<BoxedJob>> + Send + 'static,
    {
        Self {
            inner: jobs.fuse().boxed(),
        }
    }

    /// A source that is exhausted from the start.
    pub fn empty() -> Self {
        Self::from_boxed(stream::empty())
    }

    /// Pull the next item. `None` means exhausted.
    pub(crate) async fn next_job(&mut self) -> Option<anyhow::Result<BoxedJob>> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSource").finish_non_exhaustive()
    }
}
