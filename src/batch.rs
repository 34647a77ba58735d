//! Fan-out/join over a batch of jobs.
//!
//! A [`Batch`] launches every job it holds, merges each job's outcome into a
//! shared accumulator as the jobs complete, and blocks the caller until all of
//! them have reported back.
//!
//! Completion is tracked with a [`CountLatch`] started at `jobs + 1`. Each job's
//! completion handler releases one permit. The remaining permit belongs to the
//! dispatching thread and is released only after the last job has been
//! launched. Without it, a batch whose early jobs finish before the later ones
//! are even launched could see the count reach zero and open the gate early.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    error::{BatchError, JobError, Outcome},
    job::{ThreadJob, Work},
    latch::{CountLatch, Latch},
    launch::Launch,
    util::CallOnDrop,
};

// -----------------------------------------------------------------------------
// Batch

/// A set of jobs to be launched together and joined.
///
/// Batches block the calling thread until every job has completed. Running a
/// pooled batch from inside one of the pool's own workers can therefore
/// deadlock a pool that has no other free worker.
pub struct Batch<W>
where
    W: Work,
{
    jobs: Vec<ThreadJob<W>>,
    deadline: Option<Duration>,
}

/// State shared between the dispatching thread and every completion handler of
/// one batch.
struct JoinState<A> {
    /// The accumulator. Taken out by the dispatcher once the gate opens.
    accumulator: Mutex<Option<A>>,
    /// The countdown barrier, holding one permit per job plus one for the
    /// dispatcher.
    remaining: CountLatch,
    /// Set for each job once its completion handler has merged its outcome
    /// (or given up trying).
    finished: Box<[AtomicBool]>,
    /// How many times a release opened the gate.
    #[cfg(test)]
    openings: std::sync::atomic::AtomicUsize,
}

impl<A> JoinState<A>
where
    A: Send + 'static,
{
    fn new(job_count: usize, init: A) -> JoinState<A> {
        JoinState {
            accumulator: Mutex::new(Some(init)),
            remaining: CountLatch::with_count(job_count + 1),
            finished: (0..job_count).map(|_| AtomicBool::new(false)).collect(),
            #[cfg(test)]
            openings: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Releases one permit, logging when that opens the gate.
    fn release(&self) {
        if self.remaining.set() {
            #[cfg(test)]
            self.openings.fetch_add(1, Ordering::SeqCst);
            trace!("batch gate opened");
        }
    }

    /// Marks job `index` as finished and releases its permit.
    fn finish(&self, index: usize) {
        let already_finished = self.finished[index].swap(true, Ordering::AcqRel);
        debug_assert!(!already_finished, "job {index} completed twice");
        self.release();
    }

    /// Returns the indices of the jobs whose handlers have not finished.
    fn outstanding(&self) -> Vec<usize> {
        self.finished
            .iter()
            .enumerate()
            .filter(|(_, finished)| !finished.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .collect()
    }

    /// Registers a merging completion handler on every job, launches them all,
    /// then releases the dispatcher's permit.
    fn launch<W, L, M>(
        self: &Arc<Self>,
        mut jobs: Vec<ThreadJob<W>>,
        launcher: &L,
        merge: M,
    ) -> Result<(), BatchError>
    where
        W: Work,
        L: Launch<W> + ?Sized,
        M: Fn(usize, &mut A, Outcome<W::Args>) + Send + Sync + 'static,
    {
        // Refuse the batch before any handler is registered, so no caller
        // code runs for a batch that never starts.
        if let Some(index) = jobs.iter().position(ThreadJob::has_handler) {
            return Err(BatchError::AlreadySubscribed { index });
        }

        let merge = Arc::new(merge);
        for (index, job) in jobs.iter_mut().enumerate() {
            let state = Arc::clone(self);
            let merge = Arc::clone(&merge);
            job.on_finished(move |_, outcome| {
                // Runs last, and runs even if `merge` panics.
                let _permit = CallOnDrop(|| state.finish(index));

                match &outcome {
                    Ok(_) => trace!(job = index, "job finished"),
                    Err(error) => warn!(job = index, %error, "job failed"),
                }

                if let Some(accumulator) = state.accumulator.lock().as_mut() {
                    (*merge)(index, accumulator, outcome);
                }
            })
            .map_err(|_| BatchError::AlreadySubscribed { index })?;
        }

        debug!(jobs = jobs.len(), strategy = launcher.name(), "launching batch");
        for (index, job) in jobs.into_iter().enumerate() {
            launcher.launch(index, job);
        }

        // Every job has been launched, so the dispatcher's permit can go.
        self.release();
        Ok(())
    }

    /// Blocks until every job has finished, or until `deadline` elapses, and
    /// takes the accumulator.
    fn join(&self, deadline: Option<Duration>) -> Result<A, BatchError> {
        match deadline {
            None => self.remaining.wait(),
            Some(deadline) => {
                if !self.remaining.wait_for(deadline) {
                    let outstanding = self.outstanding();
                    warn!(
                        ?deadline,
                        outstanding = outstanding.len(),
                        "batch deadline elapsed"
                    );
                    return Err(BatchError::DeadlineExceeded {
                        deadline,
                        outstanding,
                    });
                }
            }
        }

        debug!(jobs = self.finished.len(), "batch complete");

        // Every handler merged before releasing its permit, and the gate only
        // opens once all permits are released, so the accumulator is still in
        // place and no handler will touch it again.
        let accumulator = self.accumulator.lock().take();
        Ok(accumulator.expect("batch accumulator is taken exactly once"))
    }
}

impl<W> Batch<W>
where
    W: Work,
{
    /// Creates a batch from jobs. The jobs must not have completion handlers
    /// of their own; the batch registers its own when it runs.
    pub fn new(jobs: impl IntoIterator<Item = ThreadJob<W>>) -> Batch<W> {
        Batch {
            jobs: jobs.into_iter().collect(),
            deadline: None,
        }
    }

    /// Creates a batch with one job per unit of work.
    pub fn from_work(work: impl IntoIterator<Item = W>) -> Batch<W> {
        Batch::new(work.into_iter().map(ThreadJob::new))
    }

    /// Limits how long [`Batch::run`] waits for the jobs. When the deadline
    /// elapses the run fails with [`BatchError::DeadlineExceeded`]; jobs that
    /// are still running are not stopped.
    pub fn with_deadline(mut self, deadline: Duration) -> Batch<W> {
        self.deadline = Some(deadline);
        self
    }

    /// Returns the number of jobs in the batch.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns `true` if the batch holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Launches every job with `launcher`, merges each outcome into an
    /// accumulator starting at `init`, and returns the accumulator once every
    /// job has completed.
    ///
    /// `merge` runs on whichever thread completed the job, one call at a time.
    /// Jobs complete in no particular order, so `merge` should not depend on
    /// the order of its calls; use [`Batch::collect`] when job order matters.
    /// Failed jobs are merged too, and `merge` decides what they mean for the
    /// batch.
    ///
    /// An empty batch returns `init` without blocking.
    pub fn run<L, A, M>(self, launcher: &L, init: A, merge: M) -> Result<A, BatchError>
    where
        L: Launch<W> + ?Sized,
        A: Send + 'static,
        M: Fn(&mut A, Outcome<W::Args>) + Send + Sync + 'static,
    {
        self.dispatch(launcher, init, move |_, accumulator, outcome| {
            merge(accumulator, outcome)
        })
    }

    /// Runs the batch and returns every job's outcome in job order.
    pub fn collect<L>(self, launcher: &L) -> Result<Vec<Outcome<W::Args>>, BatchError>
    where
        L: Launch<W> + ?Sized,
    {
        let slots: Vec<Option<Outcome<W::Args>>> = (0..self.len()).map(|_| None).collect();
        let slots = self.dispatch(launcher, slots, |index, slots, outcome| {
            slots[index] = Some(outcome);
        })?;
        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(JobError::NotExecuted)))
            .collect())
    }

    /// The fan-out/join itself. `merge` additionally receives the index of the
    /// job being merged.
    fn dispatch<L, A, M>(self, launcher: &L, init: A, merge: M) -> Result<A, BatchError>
    where
        L: Launch<W> + ?Sized,
        A: Send + 'static,
        M: Fn(usize, &mut A, Outcome<W::Args>) + Send + Sync + 'static,
    {
        let Batch { jobs, deadline } = self;
        let state = Arc::new(JoinState::new(jobs.len(), init));
        state.launch(jobs, launcher, merge)?;
        state.join(deadline)
    }
}

/// Runs `jobs` as a single batch. See [`Batch::run`].
pub fn run_batch<W, L, A, M>(
    jobs: impl IntoIterator<Item = ThreadJob<W>>,
    launcher: &L,
    init: A,
    merge: M,
) -> Result<A, BatchError>
where
    W: Work,
    L: Launch<W> + ?Sized,
    A: Send + 'static,
    M: Fn(&mut A, Outcome<W::Args>) + Send + Sync + 'static,
{
    Batch::new(jobs).run(launcher, init, merge)
}
