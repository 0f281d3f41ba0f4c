//! Load-balancing policies.

use super::{split_by_weights, LoadBalancer, WorkBatch};
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use tracing::warn;

/// Same share for every environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenDistribution;

impl LoadBalancer for EvenDistribution {
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize) -> Vec<WorkBatch> {
        split_by_weights(&vec![1.0; environments.len()], nmr_instances)
    }
}

/// Split evenly over a subset of environments. Everyone participates when
/// the subset is empty.
fn split_over<F>(
    environments: &[ComputeEnvironment],
    nmr_instances: usize,
    pick: F,
) -> Vec<WorkBatch>
where
    F: Fn(&ComputeEnvironment) -> bool,
{
    let mut weights: Vec<f64> = environments
        .iter()
        .map(|env| if pick(env) { 1.0 } else { 0.0 })
        .collect();
    if weights.iter().all(|w| *w == 0.0) {
        weights.iter_mut().for_each(|w| *w = 1.0);
    }
    split_by_weights(&weights, nmr_instances)
}

/// All work to the GPUs, evenly. Falls back to every environment when no
/// GPU is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferGpu;

impl LoadBalancer for PreferGpu {
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize) -> Vec<WorkBatch> {
        split_over(environments, nmr_instances, ComputeEnvironment::is_gpu)
    }
}

/// All work to the CPUs, evenly. Falls back to every environment when no
/// CPU is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferCpu;

impl LoadBalancer for PreferCpu {
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize) -> Vec<WorkBatch> {
        split_over(environments, nmr_instances, ComputeEnvironment::is_cpu)
    }
}

/// All work to the environment at `index`.
///
/// An index past the end of the pool degrades to an even split.
#[derive(Debug, Clone, Copy)]
pub struct PreferSpecificEnvironment(pub usize);

impl LoadBalancer for PreferSpecificEnvironment {
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize) -> Vec<WorkBatch> {
        let target = self.0;
        if target >= environments.len() {
            warn!(
                index = target,
                environments = environments.len(),
                "preferred environment out of range, distributing evenly"
            );
            return EvenDistribution.divide(environments, nmr_instances);
        }
        let weights: Vec<f64> = (0..environments.len())
            .map(|i| if i == target { 1.0 } else { 0.0 })
            .collect();
        split_by_weights(&weights, nmr_instances)
    }
}

/// Fixed relative weights, one per environment in pool order.
///
/// Environments without a weight get nothing; surplus weights are ignored.
#[derive(Debug, Clone)]
pub struct Proportional {
    weights: Vec<f64>,
}

impl Proportional {
    /// Rejects negative, non-finite and all-zero weights.
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::config("weights must be finite and non-negative"));
        }
        if !weights.iter().any(|w| *w > 0.0) {
            return Err(Error::config("at least one weight must be positive"));
        }
        Ok(Self { weights })
    }

    /// Weights as given.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl LoadBalancer for Proportional {
    fn divide(&self, environments: &[ComputeEnvironment], nmr_instances: usize) -> Vec<WorkBatch> {
        if self.weights.len() != environments.len() {
            warn!(
                weights = self.weights.len(),
                environments = environments.len(),
                "weight count does not match environment count"
            );
        }
        let weights: Vec<f64> = (0..environments.len())
            .map(|i| self.weights.get(i).copied().unwrap_or(0.0))
            .collect();
        split_by_weights(&weights, nmr_instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Driver;
    use crate::environment::MemoryPolicy;
    use crate::host::{HostDeviceConfig, HostDriver, HostPlatformConfig};

    /// Pool of CPU, GPU, CPU, GPU.
    fn pool() -> Vec<ComputeEnvironment> {
        let driver = HostDriver::new(vec![HostPlatformConfig::new("p")
            .with_device(HostDeviceConfig::cpu("c0"))
            .with_device(HostDeviceConfig::gpu("g0"))
            .with_device(HostDeviceConfig::cpu("c1"))
            .with_device(HostDeviceConfig::gpu("g1"))]);
        let platform = driver.platforms().unwrap().remove(0);
        platform
            .devices()
            .into_iter()
            .map(|d| {
                ComputeEnvironment::new(platform.clone(), d, Vec::new(), MemoryPolicy::default())
                    .unwrap()
            })
            .collect()
    }

    fn lens(batches: Vec<WorkBatch>) -> Vec<usize> {
        batches.iter().map(WorkBatch::len).collect()
    }

    #[test]
    fn test_even() {
        assert_eq!(lens(EvenDistribution.divide(&pool(), 10)), vec![3, 3, 2, 2]);
    }

    #[test]
    fn test_prefer_classes() {
        let envs = pool();
        assert_eq!(lens(PreferGpu.divide(&envs, 5)), vec![0, 3, 0, 2]);
        assert_eq!(lens(PreferCpu.divide(&envs, 4)), vec![2, 0, 2, 0]);

        let gpus_only: Vec<_> = envs.iter().filter(|e| e.is_gpu()).cloned().collect();
        assert_eq!(lens(PreferCpu.divide(&gpus_only, 4)), vec![2, 2]);
    }

    #[test]
    fn test_prefer_specific() {
        let envs = pool();
        assert_eq!(
            PreferSpecificEnvironment(2).divide(&envs, 7),
            vec![
                WorkBatch::new(0, 0),
                WorkBatch::new(0, 0),
                WorkBatch::new(0, 7),
                WorkBatch::new(7, 7),
            ]
        );
        assert_eq!(lens(PreferSpecificEnvironment(9).divide(&envs, 4)), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_proportional() {
        assert!(Proportional::new(vec![0.0, 0.0]).is_err());
        assert!(Proportional::new(vec![1.0, f64::INFINITY]).is_err());

        let policy = Proportional::new(vec![3.0, 1.0]).unwrap();
        assert_eq!(lens(policy.divide(&pool(), 8)), vec![6, 2, 0, 0]);
    }

    #[test]
    fn test_empty_pool() {
        assert!(EvenDistribution.divide(&[], 5).is_empty());
        assert!(PreferGpu.divide(&[], 5).is_empty());
    }
}
