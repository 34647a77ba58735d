//! This module defines an executable unit of work called a `ThreadJob`. A
//! thread job wraps some user-defined [`Work`] and a single completion
//! handler. It can be run in one of two ways:
//!
//! + On a dedicated thread, via [`ThreadJob::run_as_thread`].
//! + As a task on some pooled executor, via [`ThreadJob::run_as_pooled_task`].
//!
//! Both entry points consume the job and converge on the same sequence: run the
//! computation on the current thread, build the result args, then invoke the
//! completion handler on that same thread.
//!
//! The following hold for every job, whichever way it runs:
//! (a) The computation is executed at most once.
//! (b) The completion handler is invoked exactly once, and never before the
//!     computation has finished.
//! (c) A job that is dropped without running still invokes its handler, with
//!     [`JobError::NotExecuted`], so nothing waiting on it can hang.

use std::{
    fmt,
    io,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
};

use crate::{
    error::{AlreadySubscribed, JobError, Outcome},
    util::panic_message,
};

// -----------------------------------------------------------------------------
// Work

/// The computation carried by a job.
///
/// Execution is split in two steps. `execute` performs the computation and
/// stores whatever it produces inside `self`. `result_args` then packages that
/// state into the value handed to the completion handler.
pub trait Work: Send + 'static {
    /// The value delivered to the completion handler on success.
    type Args: Send + 'static;

    /// The error the computation may return.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Performs the computation.
    fn execute(&mut self) -> Result<(), Self::Error>;

    /// Builds the result args from a completed computation. Only called after
    /// `execute` returned `Ok`.
    fn result_args(&self) -> Self::Args;
}

// -----------------------------------------------------------------------------
// Job state

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed but not yet started.
    Created,
    /// The computation is running.
    Executing,
    /// The computation has finished, successfully or not.
    Completed,
}

// -----------------------------------------------------------------------------
// Thread job

/// A completion handler. It receives the finished job and its outcome.
pub type Handler<W> = Box<dyn FnOnce(&ThreadJob<W>, Outcome<<W as Work>::Args>) + Send>;

/// A unit of work with a single completion handler.
pub struct ThreadJob<W>
where
    W: Work,
{
    /// The computation, including its input and (once executed) its result.
    work: W,
    /// Lifecycle state. Only ever observed by the thread that owns the job.
    state: JobState,
    /// The completion handler slot. It holds at most one handler, and the
    /// handler is taken out of the slot before it is invoked.
    on_finished: Option<Handler<W>>,
}

impl<W> ThreadJob<W>
where
    W: Work,
{
    /// Creates a new job owning `work`. This does not start execution.
    pub fn new(work: W) -> ThreadJob<W> {
        ThreadJob {
            work,
            state: JobState::Created,
            on_finished: None,
        }
    }

    /// Registers the completion handler. A job has at most one handler;
    /// registering a second one fails and leaves the first in place.
    pub fn on_finished<F>(&mut self, handler: F) -> Result<(), AlreadySubscribed>
    where
        F: FnOnce(&ThreadJob<W>, Outcome<W::Args>) + Send + 'static,
    {
        if self.on_finished.is_some() {
            return Err(AlreadySubscribed);
        }
        self.on_finished = Some(Box::new(handler));
        Ok(())
    }

    /// Returns `true` if a completion handler is registered.
    pub fn has_handler(&self) -> bool {
        self.on_finished.is_some()
    }

    /// Returns the job's lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Returns the job's work. The result stored in it is only meaningful once
    /// the job is `Completed`, i.e. from inside the completion handler.
    pub fn work(&self) -> &W {
        &self.work
    }

    /// Starts a new dedicated thread which executes the job and then invokes
    /// its completion handler. Returns immediately.
    ///
    /// If the thread cannot be spawned the job is dropped, so its handler
    /// fires with [`JobError::NotExecuted`] before this returns the error.
    pub fn run_as_thread(self) -> io::Result<JoinHandle<()>> {
        self.run_as_thread_with(thread::Builder::new())
    }

    /// Like [`ThreadJob::run_as_thread`], but spawns the thread from the
    /// provided builder, allowing the thread name and stack size to be set.
    pub fn run_as_thread_with(self, builder: thread::Builder) -> io::Result<JoinHandle<()>> {
        builder.spawn(move || self.execute())
    }

    /// Executes the job on the current thread. The signature matches the work
    /// items accepted by pooled executors: the executor-provided context is
    /// ignored.
    pub fn run_as_pooled_task<C>(self, _context: &C)
    where
        C: ?Sized,
    {
        self.execute()
    }

    /// Runs the computation, then notifies the handler. Panics inside the
    /// computation are caught here and reported through the handler, so the
    /// handler fires even when the work does not complete normally.
    fn execute(mut self) {
        self.state = JobState::Executing;

        let work = &mut self.work;
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || -> Result<W::Args, W::Error> {
            work.execute()?;
            Ok(work.result_args())
        }));

        let outcome = match outcome {
            Ok(Ok(args)) => Ok(args),
            Ok(Err(error)) => Err(JobError::failed(error)),
            Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
        };

        self.state = JobState::Completed;
        self.notify(outcome);
    }

    /// Takes the handler out of its slot and invokes it. Taking the handler
    /// guarantees it can never run twice.
    fn notify(&mut self, outcome: Outcome<W::Args>) {
        if let Some(handler) = self.on_finished.take() {
            handler(&*self, outcome);
        }
    }
}

impl<W> Drop for ThreadJob<W>
where
    W: Work,
{
    fn drop(&mut self) {
        // A handler is still present only if the job never ran.
        self.notify(Err(JobError::NotExecuted));
    }
}

impl<W> fmt::Debug for ThreadJob<W>
where
    W: Work + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadJob")
            .field("work", &self.work)
            .field("state", &self.state)
            .field("has_handler", &self.has_handler())
            .finish()
    }
}
