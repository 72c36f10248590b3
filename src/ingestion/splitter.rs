//! Day splitting: partition the row stream into contiguous day buckets by position.

use serde::{Deserialize, Serialize};

use crate::error::{PreprocessError, PreprocessResult};

/// Fixed per-day row capacities of the input stream.
///
/// Once built, a split is never changed; every later stage consumes exactly this partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySplit {
    capacities: Vec<usize>,
}

impl DaySplit {
    /// Split `total` rows into `days` buckets of `total / days` rows, giving one extra row to each
    /// of the first `total % days` buckets.
    pub fn even(total: usize, days: usize) -> PreprocessResult<Self> {
        if days == 0 {
            return Err(PreprocessError::invalid_config("days must be > 0"));
        }
        let base = total / days;
        let remainder = total % days;
        let capacities = (0..days)
            .map(|day| if day < remainder { base + 1 } else { base })
            .collect();
        Ok(Self { capacities })
    }

    /// Use explicit capacities (one input file per day).
    pub fn from_capacities(capacities: Vec<usize>) -> Self {
        Self { capacities }
    }

    pub fn days(&self) -> usize {
        self.capacities.len()
    }

    pub fn capacities(&self) -> &[usize] {
        &self.capacities
    }

    pub fn capacity(&self, day: usize) -> usize {
        self.capacities[day]
    }

    /// Total number of rows across all days.
    pub fn total(&self) -> usize {
        self.capacities.iter().sum()
    }

    /// Global index of the first row of each day, plus the total as a final entry.
    pub fn boundaries(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.capacities.len() + 1);
        let mut acc = 0usize;
        out.push(acc);
        for &c in &self.capacities {
            acc += c;
            out.push(acc);
        }
        out
    }

    /// The day that global row `row` belongs to, or `None` past the end of the stream.
    pub fn day_of(&self, row: usize) -> Option<usize> {
        let mut end = 0usize;
        for (day, &c) in self.capacities.iter().enumerate() {
            end += c;
            if row < end {
                return Some(day);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::DaySplit;

    #[test]
    fn ten_rows_over_two_days() {
        let split = DaySplit::even(10, 2).unwrap();
        assert_eq!(split.capacities(), &[5, 5]);
    }

    #[test]
    fn remainder_goes_to_first_days() {
        let split = DaySplit::even(11, 4).unwrap();
        assert_eq!(split.capacities(), &[3, 3, 3, 2]);
        assert_eq!(split.total(), 11);
        assert_eq!(split.boundaries(), vec![0, 3, 6, 9, 11]);
    }

    #[test]
    fn capacities_always_sum_to_total() {
        for total in 0..60 {
            for days in 1..13 {
                let split = DaySplit::even(total, days).unwrap();
                assert_eq!(split.days(), days);
                assert_eq!(split.total(), total);
                let max = split.capacities().iter().max().copied().unwrap_or(0);
                let min = split.capacities().iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn day_of_walks_positions() {
        let split = DaySplit::even(7, 3).unwrap();
        let days: Vec<_> = (0..8).map(|r| split.day_of(r)).collect();
        assert_eq!(
            days,
            vec![Some(0), Some(0), Some(0), Some(1), Some(1), Some(2), Some(2), None]
        );
    }

    #[test]
    fn more_days_than_rows_leaves_empty_days() {
        let split = DaySplit::even(2, 4).unwrap();
        assert_eq!(split.capacities(), &[1, 1, 0, 0]);
        assert_eq!(split.day_of(1), Some(1));
    }

    #[test]
    fn zero_days_is_rejected() {
        assert!(DaySplit::even(10, 0).is_err());
    }
}
