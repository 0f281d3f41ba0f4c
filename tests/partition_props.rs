//! Property tests for the partition invariants of every shipped balancer.

use hetbatch::device::Driver;
use hetbatch::host::{HostDeviceConfig, HostDriver, HostPlatformConfig};
use hetbatch::scheduler::{split_by_weights, validate_division};
use hetbatch::{ComputeEnvironment, LoadBalancer, MemoryPolicy, WorkBatch};
use hetbatch::scheduler::{
    EvenDistribution, PreferCpu, PreferGpu, PreferSpecificEnvironment, Proportional,
};
use proptest::prelude::*;

/// A pool with one device per flag, GPU when the flag is set.
fn pool(gpus: &[bool]) -> Vec<ComputeEnvironment> {
    let platform = gpus
        .iter()
        .enumerate()
        .fold(HostPlatformConfig::new("props"), |platform, (i, &gpu)| {
            let name = format!("dev{}", i);
            platform.with_device(if gpu {
                HostDeviceConfig::gpu(name)
            } else {
                HostDeviceConfig::cpu(name)
            })
        });
    let driver = HostDriver::new(vec![platform]);
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

fn check(balancer: &dyn LoadBalancer, envs: &[ComputeEnvironment], n: usize) -> Vec<WorkBatch> {
    let batches = balancer.divide(envs, n);
    validate_division(&batches, envs.len(), n).unwrap();
    batches
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every policy yields ordered, contiguous batches covering [0, n).
    #[test]
    fn policies_partition_exactly(
        gpus in prop::collection::vec(any::<bool>(), 1..6),
        n in 0usize..5_000,
        index in 0usize..8,
    ) {
        let envs = pool(&gpus);
        check(&EvenDistribution, &envs, n);
        check(&PreferGpu, &envs, n);
        check(&PreferCpu, &envs, n);
        check(&PreferSpecificEnvironment(index), &envs, n);
    }

    /// Weighted splits stay within one instance of the exact share.
    #[test]
    fn proportional_tracks_weights(
        weights in prop::collection::vec(0.0f64..100.0, 1..6),
        n in 0usize..5_000,
    ) {
        prop_assume!(weights.iter().any(|w| *w > 0.0));
        let total: f64 = weights.iter().sum();
        let envs = pool(&vec![false; weights.len()]);

        let policy = Proportional::new(weights.clone()).unwrap();
        let batches = check(&policy, &envs, n);
        for (batch, weight) in batches.iter().zip(&weights) {
            let exact = weight / total * n as f64;
            prop_assert!((batch.len() as f64 - exact).abs() < 1.0 + 1e-9);
        }
    }

    /// Class preferences send nothing to the other class when it is avoidable.
    #[test]
    fn prefer_gpu_idles_cpus(
        gpus in prop::collection::vec(any::<bool>(), 1..6),
        n in 1usize..1_000,
    ) {
        prop_assume!(gpus.iter().any(|g| *g));
        let envs = pool(&gpus);
        let batches = check(&PreferGpu, &envs, n);
        for (env, batch) in envs.iter().zip(&batches) {
            if env.is_cpu() {
                prop_assert!(batch.is_empty());
            }
        }
    }

    #[test]
    fn split_is_deterministic(
        weights in prop::collection::vec(0.0f64..10.0, 0..8),
        n in 0usize..10_000,
    ) {
        prop_assert_eq!(split_by_weights(&weights, n), split_by_weights(&weights, n));
    }
}
