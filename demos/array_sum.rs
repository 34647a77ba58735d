//! Sums a set of random integer arrays three ways (on the main thread, with a
//! thread per array, and on the worker pool) and reports each result with
//! the time it took.
//!
//! ```text
//! cargo run --example array_sum -- [count] [size] [low] [high]
//! ```

use std::time::Instant;

use anyhow::{ensure, Result};
use clap::Parser;
use tracing::{info, Level};

use threadjobs::prelude::*;

static COMPUTE: ThreadPool = ThreadPool::new();

#[derive(Parser)]
#[command(name = "array_sum")]
#[command(about = "Sum random integer arrays on the main thread, per-array threads and a pool")]
struct Settings {
    /// Number of arrays to generate
    #[arg(default_value_t = 1000)]
    count: usize,

    /// Number of values in each array
    #[arg(default_value_t = 1000)]
    size: usize,

    /// Smallest value to generate (inclusive)
    #[arg(default_value_t = 0, allow_negative_numbers = true)]
    low: i64,

    /// Largest value to generate (exclusive)
    #[arg(default_value_t = 100, allow_negative_numbers = true)]
    high: i64,
}

impl Settings {
    /// Checks that the value range is not empty.
    fn validated(self) -> Result<Settings> {
        ensure!(
            self.low < self.high,
            "empty value range [{}, {})",
            self.low,
            self.high
        );
        Ok(self)
    }
}

fn generate(settings: &Settings) -> Vec<Vec<i64>> {
    let mut rng = fastrand::Rng::new();
    (0..settings.count)
        .map(|_| {
            (0..settings.size)
                .map(|_| rng.i64(settings.low..settings.high))
                .collect()
        })
        .collect()
}

/// Sums the arrays with one job each, skipping (and counting) failed jobs.
fn sum_batch<L: Launch<ArraySum>>(arrays: &[Vec<i64>], launcher: &L) -> Result<(i64, usize)> {
    let (sum, failures) = Batch::from_work(arrays.iter().cloned().map(ArraySum::new)).run(
        launcher,
        (0, 0),
        |(sum, failures), outcome| match outcome {
            Ok(args) => *sum += args.sum,
            Err(_) => *failures += 1,
        },
    )?;
    Ok((sum, failures))
}

fn report(via: &str, sum: i64, failures: usize, started: Instant) {
    let elapsed = started.elapsed();
    if failures == 0 {
        println!("Result: {sum} (via {via}).\nTime taken: {elapsed:?}");
    } else {
        println!("Result: {sum} (via {via}, {failures} job(s) failed).\nTime taken: {elapsed:?}");
    }
}

fn main() -> Result<()> {
    let settings = Settings::parse().validated()?;

    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let workers = COMPUTE.start_available();
    info!(
        count = settings.count,
        size = settings.size,
        low = settings.low,
        high = settings.high,
        workers,
        "running example"
    );

    let arrays = generate(&settings);

    let started = Instant::now();
    let sum = arrays.iter().flatten().sum();
    report("main thread", sum, 0, started);

    let started = Instant::now();
    let (sum, failures) = sum_batch(&arrays, &ThreadPerJob::new().with_name_prefix("array-sum"))?;
    report("a thread per array", sum, failures, started);

    let started = Instant::now();
    let (sum, failures) = sum_batch(&arrays, &Pooled(&COMPUTE))?;
    report("the worker pool", sum, failures, started);

    COMPUTE.shutdown();
    Ok(())
}
