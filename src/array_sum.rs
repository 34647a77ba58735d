//! A job that sums an array of integers.

use thiserror::Error;

use crate::job::Work;

/// Sums its own slice of integers. The sum is checked, so an input whose total
/// does not fit in an `i64` fails instead of wrapping.
#[derive(Debug, Clone)]
pub struct ArraySum {
    values: Vec<i64>,
    sum: i64,
}

/// The result args of an [`ArraySum`] job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArraySumArgs {
    pub sum: i64,
}

/// Returned when the running total leaves the range of `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sum overflowed at value {index} of {len}")]
pub struct SumOverflow {
    pub index: usize,
    pub len: usize,
}

impl ArraySum {
    pub fn new(values: impl Into<Vec<i64>>) -> ArraySum {
        ArraySum {
            values: values.into(),
            sum: 0,
        }
    }

    /// The values this job sums.
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// The computed sum. Zero until the job has executed.
    pub fn sum(&self) -> i64 {
        self.sum
    }
}

impl Work for ArraySum {
    type Args = ArraySumArgs;
    type Error = SumOverflow;

    fn execute(&mut self) -> Result<(), SumOverflow> {
        let len = self.values.len();
        self.sum = 0;
        for (index, value) in self.values.iter().enumerate() {
            self.sum = self
                .sum
                .checked_add(*value)
                .ok_or(SumOverflow { index, len })?;
        }
        Ok(())
    }

    fn result_args(&self) -> ArraySumArgs {
        ArraySumArgs { sum: self.sum }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_values() {
        let mut work = ArraySum::new([1, 2, 3, -4]);
        assert_eq!(work.sum(), 0);
        work.execute().unwrap();
        assert_eq!(work.sum(), 2);
        assert_eq!(work.result_args(), ArraySumArgs { sum: 2 });
    }

    #[test]
    fn empty_input_sums_to_zero() {
        let mut work = ArraySum::new(Vec::new());
        work.execute().unwrap();
        assert_eq!(work.result_args().sum, 0);
    }

    #[test]
    fn overflow_is_reported_with_position() {
        let mut work = ArraySum::new([1, i64::MAX, 5]);
        let error = work.execute().unwrap_err();
        assert_eq!(error, SumOverflow { index: 1, len: 3 });
        assert_eq!(error.to_string(), "sum overflowed at value 1 of 3");
    }
}
