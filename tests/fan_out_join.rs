use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use threadjobs::prelude::*;

static POOL: ThreadPool = ThreadPool::new();

fn pooled() -> Pooled<&'static ThreadPool> {
    POOL.start(4);
    Pooled(&POOL)
}

fn add_sum(total: &mut i64, outcome: Outcome<ArraySumArgs>) {
    *total += outcome.expect("job failed").sum;
}

fn random_values(rng: &mut fastrand::Rng, len: usize) -> Vec<i64> {
    (0..len).map(|_| rng.i64(0..100)).collect()
}

/// Splits `values` into `parts` disjoint chunks of random (possibly zero)
/// length that together cover every value.
fn partition(rng: &mut fastrand::Rng, values: &[i64], parts: usize) -> Vec<Vec<i64>> {
    if parts == 0 {
        return Vec::new();
    }
    let mut cuts: Vec<usize> = (0..parts - 1).map(|_| rng.usize(0..=values.len())).collect();
    cuts.sort_unstable();
    cuts.push(values.len());

    let mut start = 0;
    cuts.into_iter()
        .map(|end| {
            let chunk = values[start..end].to_vec();
            start = end;
            chunk
        })
        .collect()
}

fn run_sum<L: Launch<ArraySum>>(chunks: Vec<Vec<i64>>, launcher: &L) -> i64 {
    Batch::from_work(chunks.into_iter().map(ArraySum::new))
        .run(launcher, 0, add_sum)
        .unwrap()
}

#[test]
fn example_chunks_sum_to_21_under_both_strategies() {
    let chunks = || vec![vec![1, 2, 3], vec![4, 5], vec![6]];

    assert_eq!(run_sum(chunks(), &ThreadPerJob::new()), 21);
    assert_eq!(run_sum(chunks(), &pooled()), 21);

    let sums: Vec<i64> = Batch::from_work(chunks().into_iter().map(ArraySum::new))
        .collect(&pooled())
        .unwrap()
        .into_iter()
        .map(|outcome| outcome.unwrap().sum)
        .collect();
    assert_eq!(sums, vec![6, 9, 6]);
}

#[test]
fn partitioned_sums_match_sequential_sum() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let values = random_values(&mut rng, 5_000);
    let expected: i64 = values.iter().sum();

    for parts in [0, 1, 2, 7, 64, 257] {
        let chunks = partition(&mut rng, &values, parts);
        assert_eq!(chunks.len(), parts);

        let total = if parts == 0 { 0 } else { expected };
        assert_eq!(run_sum(chunks.clone(), &ThreadPerJob::new()), total, "{parts} parts");
        assert_eq!(run_sum(chunks, &pooled()), total, "{parts} parts, pooled");
    }
}

#[test]
fn zero_jobs_return_the_initial_accumulator() {
    let none = || Batch::<ArraySum>::new(Vec::new());
    assert_eq!(none().run(&ThreadPerJob::new(), 99, add_sum), Ok(99));
    assert_eq!(none().run(&pooled(), 99, add_sum), Ok(99));
    assert_eq!(none().with_deadline(Duration::ZERO).run(&pooled(), 5, add_sum), Ok(5));
    assert!(run_batch(Vec::<ThreadJob<ArraySum>>::new(), &ThreadPerJob::new(), (), |_, _| {})
        .is_ok());
}

/// Work that reports its own index, so handlers can be counted per job.
struct Indexed(usize);

impl Work for Indexed {
    type Args = usize;
    type Error = Infallible;

    fn execute(&mut self) -> Result<(), Infallible> {
        // Spread completions out a little so they interleave.
        if self.0 % 7 == 0 {
            thread::yield_now();
        }
        Ok(())
    }

    fn result_args(&self) -> usize {
        self.0
    }
}

fn assert_each_handler_fires_once<L: Launch<Indexed>>(launcher: &L) {
    const JOBS: usize = 200;

    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..JOBS).map(|_| AtomicUsize::new(0)).collect());
    let seen = Arc::clone(&counters);
    let merged = Batch::from_work((0..JOBS).map(Indexed))
        .run(launcher, 0_usize, move |merged, outcome| {
            seen[outcome.unwrap()].fetch_add(1, Ordering::SeqCst);
            *merged += 1;
        })
        .unwrap();

    assert_eq!(merged, JOBS);
    for (index, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(Ordering::SeqCst), 1, "job {index}");
    }
}

#[test]
fn each_handler_fires_exactly_once_per_thread_job() {
    assert_each_handler_fires_once(&ThreadPerJob::new());
}

#[test]
fn each_handler_fires_exactly_once_per_pooled_job() {
    assert_each_handler_fires_once(&pooled());
}

#[test]
fn join_waits_for_slow_handlers() {
    const JOBS: usize = 16;

    // Merges run concurrently with the caller; the slow ones must still be
    // done by the time `run` returns.
    let finished = Arc::new(AtomicUsize::new(0));
    let in_merge = Arc::clone(&finished);
    let total = Batch::from_work((0..JOBS).map(Indexed))
        .run(&ThreadPerJob::new(), 0_usize, move |total, outcome| {
            let index = outcome.unwrap();
            if index % 4 == 0 {
                thread::sleep(Duration::from_millis(20));
            }
            *total += index;
            in_merge.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), JOBS);
    assert_eq!(total, (0..JOBS).sum::<usize>());
}

#[test]
fn repeated_thread_per_job_runs_never_lose_updates() {
    const JOBS: usize = 1_000;
    const VALUES: usize = 1_000;
    const RUNS: usize = 100;

    let mut rng = fastrand::Rng::with_seed(1_000);
    let chunks: Vec<Vec<i64>> = (0..JOBS).map(|_| random_values(&mut rng, VALUES)).collect();
    let expected: i64 = chunks.iter().flatten().sum();

    for run in 0..RUNS {
        let total = run_sum(chunks.clone(), &ThreadPerJob::new());
        assert_eq!(total, expected, "run {run}");
    }
}

/// Work that panics instead of computing.
struct Exploding;

impl Work for Exploding {
    type Args = ArraySumArgs;
    type Error = Infallible;

    fn execute(&mut self) -> Result<(), Infallible> {
        panic!("injected failure");
    }

    fn result_args(&self) -> ArraySumArgs {
        unreachable!("a panicking job has no result args")
    }
}

/// Either kind of job, so one batch can mix them.
enum Mixed {
    Sum(ArraySum),
    Explode(Exploding),
}

#[derive(Debug, thiserror::Error)]
enum MixedError {
    #[error(transparent)]
    Sum(#[from] threadjobs::array_sum::SumOverflow),
}

impl Work for Mixed {
    type Args = ArraySumArgs;
    type Error = MixedError;

    fn execute(&mut self) -> Result<(), MixedError> {
        match self {
            Mixed::Sum(work) => Ok(work.execute()?),
            Mixed::Explode(work) => match work.execute() {
                Ok(()) => Ok(()),
                Err(never) => match never {},
            },
        }
    }

    fn result_args(&self) -> ArraySumArgs {
        match self {
            Mixed::Sum(work) => work.result_args(),
            Mixed::Explode(work) => work.result_args(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Report {
    sum: i64,
    failures: Vec<String>,
}

fn assert_failures_are_reported<L: Launch<Mixed>>(launcher: &L) {
    let work = vec![
        Mixed::Sum(ArraySum::new([1, 2, 3])),
        Mixed::Sum(ArraySum::new([i64::MAX, 1])),
        Mixed::Explode(Exploding),
        Mixed::Sum(ArraySum::new([4])),
    ];

    let mut report = Batch::from_work(work)
        .with_deadline(Duration::from_secs(30))
        .run(launcher, Report::default(), |report, outcome| match outcome {
            Ok(args) => report.sum += args.sum,
            Err(error) => report.failures.push(error.to_string()),
        })
        .unwrap();
    report.failures.sort();

    assert_eq!(
        report,
        Report {
            sum: 10,
            failures: vec![
                "job computation failed: sum overflowed at value 1 of 2".to_owned(),
                "job panicked: injected failure".to_owned(),
            ],
        }
    );
}

#[test]
fn failures_are_merged_on_dedicated_threads() {
    assert_failures_are_reported(&ThreadPerJob::new());
}

#[test]
fn failures_are_merged_on_the_pool() {
    assert_failures_are_reported(&pooled());
}

#[test]
fn failures_are_merged_inline() {
    assert_failures_are_reported(&Pooled(InlineExecutor));
}
