//! Typed jobs with a fan-out/join driver.
//!
//! A [`ThreadJob`](job::ThreadJob) wraps a piece of [`Work`](job::Work) and a
//! single completion handler. The same job can run on a dedicated thread or as
//! a task on a pooled executor; either way it computes, builds its result args,
//! and notifies its handler exactly once, on the thread that did the work.
//!
//! A [`Batch`](batch::Batch) fans a set of jobs out under one launch strategy
//! and joins them: every outcome is merged into an accumulator, and the caller
//! is released once the last job has reported back, whatever order they
//! finish in.
//!
//! ```
//! use threadjobs::prelude::*;
//!
//! let chunks: Vec<Vec<i64>> = vec![vec![1, 2, 3], vec![4, 5], vec![6]];
//! let total = Batch::from_work(chunks.into_iter().map(ArraySum::new))
//!     .run(&ThreadPerJob::new(), 0_i64, |total, outcome| {
//!         if let Ok(args) = outcome {
//!             *total += args.sum;
//!         }
//!     })
//!     .unwrap();
//! assert_eq!(total, 21);
//! ```
//!
//! Failures never stall a batch. A computation that returns an error or panics
//! still notifies its handler, with a [`JobError`](error::JobError), and so does
//! a job that is dropped before it ever runs. What a failure means for the
//! batch is up to the merge function.
//!
//! Logging goes through `tracing`; the crate installs no subscriber.

pub mod array_sum;
pub mod batch;
pub mod error;
pub mod job;
pub mod latch;
pub mod launch;
pub mod pool;

mod util;

pub mod prelude {
    pub use crate::{
        array_sum::{ArraySum, ArraySumArgs},
        batch::{run_batch, Batch},
        error::{BatchError, JobError, Outcome},
        job::{JobState, ThreadJob, Work},
        launch::{Executor, InlineExecutor, Launch, Pooled, ThreadPerJob},
        pool::{ThreadPool, WorkerThread},
    };
}
