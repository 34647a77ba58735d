//! Launch strategies for batches.
//!
//! A batch does not care how its jobs get onto a thread. It hands each job to
//! a [`Launch`] implementation, which either gives the job a dedicated thread
//! ([`ThreadPerJob`]) or submits it to some [`Executor`] ([`Pooled`]).

use std::thread;

use tracing::error;

use crate::job::{ThreadJob, Work};

// -----------------------------------------------------------------------------
// Executors

/// A pooled executor: something that accepts units of work and runs each one
/// on some worker thread at some future time.
///
/// Executors make no ordering guarantee between submissions. Each unit of work
/// receives a reference to an executor-defined context (for the built-in
/// [`ThreadPool`](crate::pool::ThreadPool), the worker it runs on).
///
/// An executor that discards a task without running it must drop it. Dropping
/// a job that has not run still notifies its completion handler, so a batch
/// waiting on that job is released.
pub trait Executor {
    /// The context passed to every unit of work.
    type Context: ?Sized;

    /// Submits a unit of work for execution.
    fn submit<F>(&self, task: F)
    where
        F: FnOnce(&Self::Context) + Send + 'static;
}

/// An executor which runs every task immediately on the submitting thread.
///
/// Batches launched through this executor finish every job during dispatch,
/// which makes it handy for deterministic tests of the pooled code path.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    type Context = ();

    fn submit<F>(&self, task: F)
    where
        F: FnOnce(&()) + Send + 'static,
    {
        task(&())
    }
}

// -----------------------------------------------------------------------------
// Launch strategies

/// A way of starting jobs. Launching must not block on the job itself: it
/// returns once the job has been handed off, and the job then races freely.
pub trait Launch<W>
where
    W: Work,
{
    /// Starts `job`, the `index`th job of its batch.
    fn launch(&self, index: usize, job: ThreadJob<W>);

    /// A short name for the strategy, used in log output.
    fn name(&self) -> &'static str;
}

/// Runs every job on its own, newly spawned thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadPerJob {
    /// When set, job threads are named `{prefix}-{index}`.
    name_prefix: Option<String>,
    /// When set, job threads are spawned with this stack size in bytes.
    stack_size: Option<usize>,
}

impl ThreadPerJob {
    /// Creates a strategy that spawns unnamed threads with the platform's
    /// default stack size.
    pub fn new() -> ThreadPerJob {
        ThreadPerJob::default()
    }

    /// Names each job thread `{prefix}-{index}`.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> ThreadPerJob {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Sets the stack size, in bytes, of each job thread.
    pub fn with_stack_size(mut self, stack_size: usize) -> ThreadPerJob {
        self.stack_size = Some(stack_size);
        self
    }

    fn builder(&self, index: usize) -> thread::Builder {
        let mut builder = thread::Builder::new();
        if let Some(prefix) = &self.name_prefix {
            builder = builder.name(format!("{prefix}-{index}"));
        }
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        builder
    }
}

impl<W> Launch<W> for ThreadPerJob
where
    W: Work,
{
    fn launch(&self, index: usize, job: ThreadJob<W>) {
        // On failure the job has already been dropped, which reported it to
        // its handler as not executed.
        if let Err(error) = job.run_as_thread_with(self.builder(index)) {
            error!(job = index, %error, "failed to spawn job thread");
        }
    }

    fn name(&self) -> &'static str {
        "thread-per-job"
    }
}

/// Submits every job to an executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pooled<E>(pub E);

impl<E, W> Launch<W> for Pooled<E>
where
    E: Executor,
    W: Work,
{
    fn launch(&self, _index: usize, job: ThreadJob<W>) {
        self.0.submit(move |context| job.run_as_pooled_task(context));
    }

    fn name(&self) -> &'static str {
        "pooled"
    }
}
