//! Partitioning a batch of task instances across compute environments.
//!
//! A [`LoadBalancer`] assigns every environment one contiguous, half-open
//! range of instance indices. The ranges of one `divide` call follow the
//! environment order, never overlap and together cover `[0, N)` exactly.
//! Ranges may be empty.

pub mod policies;

pub use policies::{
    EvenDistribution, PreferCpu, PreferGpu, PreferSpecificEnvironment, Proportional,
};

use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::Range;

/// Half-open range `[start, end)` of task-instance indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkBatch {
    /// First instance.
    pub start: usize,
    /// One past the last instance.
    pub end: usize,
}

impl WorkBatch {
    /// The batch `[start, end)`.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of instances, 0 when `end <= start`.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the batch holds no instances.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The batch as a `Range`.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for WorkBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Policy deciding how many instances each environment runs.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// One batch per environment, in environment order.
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize)
        -> Vec<WorkBatch>;
}

/// Split `[0, n)` into consecutive batches sized proportionally to `weights`.
///
/// Largest-remainder rounding: every batch gets the floor of its exact share,
/// and the leftover instances go one each to the largest fractional parts,
/// earlier positions first on ties. Non-finite and negative weights count as
/// zero. When no weight is positive the split is even.
pub fn split_by_weights(weights: &[f64], n: usize) -> Vec<WorkBatch> {
    if weights.is_empty() {
        return Vec::new();
    }

    let clean: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();
    let total: f64 = clean.iter().sum();
    if total <= 0.0 {
        return split_by_weights(&vec![1.0; weights.len()], n);
    }

    let exact: Vec<f64> = clean.iter().map(|w| w / total * n as f64).collect();
    let mut counts: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();

    let assigned: usize = counts.iter().sum();
    let mut leftover = n.saturating_sub(assigned);
    if leftover > 0 {
        let mut order: Vec<usize> = (0..counts.len()).filter(|&i| clean[i] > 0.0).collect();
        // Stable sort keeps the earlier index first among equal remainders.
        order.sort_by(|&a, &b| {
            let ra = exact[a] - exact[a].floor();
            let rb = exact[b] - exact[b].floor();
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });
        for &i in order.iter().cycle() {
            if leftover == 0 {
                break;
            }
            counts[i] += 1;
            leftover -= 1;
        }
    }

    let mut start = 0;
    counts
        .into_iter()
        .map(|count| {
            let batch = WorkBatch::new(start, start + count);
            start += count;
            batch
        })
        .collect()
}

/// Check a balancer's output against the partition invariants.
pub fn validate_division(
    batches: &[WorkBatch],
    nmr_environments: usize,
    nmr_instances: usize,
) -> Result<()> {
    if batches.len() != nmr_environments {
        return Err(Error::partition(format!(
            "expected {} batches, got {}",
            nmr_environments,
            batches.len()
        )));
    }
    if batches.is_empty() {
        if nmr_instances > 0 {
            return Err(Error::partition(format!(
                "{} instances but no environments",
                nmr_instances
            )));
        }
        return Ok(());
    }

    let mut expected_start = 0;
    for (index, batch) in batches.iter().enumerate() {
        if batch.start != expected_start {
            return Err(Error::partition(format!(
                "batch {} {} does not start at {}",
                index, batch, expected_start
            )));
        }
        if batch.end < batch.start {
            return Err(Error::partition(format!("batch {} {} is inverted", index, batch)));
        }
        expected_start = batch.end;
    }
    if expected_start != nmr_instances {
        return Err(Error::partition(format!(
            "batches cover [0, {}) instead of [0, {})",
            expected_start, nmr_instances
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(batches: &[WorkBatch]) -> Vec<usize> {
        batches.iter().map(WorkBatch::len).collect()
    }

    #[test]
    fn test_split_even() {
        assert_eq!(lens(&split_by_weights(&[1.0, 1.0, 1.0], 10)), vec![4, 3, 3]);
        assert_eq!(lens(&split_by_weights(&[1.0, 1.0], 0)), vec![0, 0]);
    }

    #[test]
    fn test_split_largest_remainder() {
        // Exact shares 1.5 / 3.0 / 0.5: the first has the largest remainder
        // alongside the last, and wins the tie by position.
        assert_eq!(lens(&split_by_weights(&[3.0, 6.0, 1.0], 5)), vec![2, 3, 0]);
        assert_eq!(lens(&split_by_weights(&[0.0, 2.0, 0.0], 7)), vec![0, 7, 0]);
    }

    #[test]
    fn test_split_degenerate_weights() {
        assert_eq!(lens(&split_by_weights(&[0.0, -1.0], 3)), vec![2, 1]);
        assert_eq!(lens(&split_by_weights(&[f64::NAN, 1.0], 3)), vec![0, 3]);
        assert!(split_by_weights(&[], 3).is_empty());
    }

    #[test]
    fn test_batches_are_contiguous() {
        let batches = split_by_weights(&[2.0, 1.0, 1.0], 9);
        assert_eq!(batches[0], WorkBatch::new(0, 5));
        assert_eq!(batches[1].start, batches[0].end);
        assert_eq!(batches[2].end, 9);
    }

    #[test]
    fn test_validate_division() {
        let good = [WorkBatch::new(0, 3), WorkBatch::new(3, 3), WorkBatch::new(3, 5)];
        assert!(validate_division(&good, 3, 5).is_ok());

        let gap = [WorkBatch::new(0, 2), WorkBatch::new(3, 5)];
        assert!(matches!(
            validate_division(&gap, 2, 5),
            Err(Error::InvalidPartition(_))
        ));

        let short = [WorkBatch::new(0, 4)];
        assert!(validate_division(&short, 1, 5).is_err());
        assert!(validate_division(&short, 2, 4).is_err());
        assert!(validate_division(&[], 0, 0).is_ok());
        assert!(validate_division(&[], 0, 1).is_err());
    }
}
