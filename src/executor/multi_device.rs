//! Launches spread over every environment of a pool.

use super::{BatchProcessor, EventMap, KernelMap, LaunchOptions, Processor};
use crate::argument::KernelArguments;
use crate::device::Event;
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use crate::scheduler::{validate_division, LoadBalancer, WorkBatch};
use crate::telemetry::{LaunchMetrics, LaunchSnapshot};
use std::sync::Arc;
use tracing::debug;

/// Spreads `nmr_instances` task instances over a pool of environments.
pub struct MultiDeviceProcessor {
    processors: Vec<BatchProcessor>,
    division: Vec<(ComputeEnvironment, WorkBatch)>,
    metrics: Arc<LaunchMetrics>,
}

impl MultiDeviceProcessor {
    /// Divide `nmr_instances` over `environments` and prepare one batch processor
    /// per non-empty batch.
    ///
    /// Fails when an environment has no kernel, the division is invalid or the
    /// workgroup size cannot be resolved.
    pub fn new(
        kernels: &KernelMap,
        arguments: Arc<KernelArguments>,
        environments: &[ComputeEnvironment],
        balancer: &dyn LoadBalancer,
        nmr_instances: usize,
        options: LaunchOptions,
    ) -> Result<Self> {
        if options.local_size == Some(0) {
            return Err(Error::config("local size must be positive"));
        }

        let batches = balancer.divide(environments, nmr_instances);
        validate_division(&batches, environments.len(), nmr_instances)?;

        let metrics = Arc::new(LaunchMetrics::new());
        let mut processors = Vec::new();
        let mut division = Vec::with_capacity(batches.len());

        for (env, batch) in environments.iter().zip(batches) {
            division.push((env.clone(), batch));
            if batch.is_empty() {
                metrics.record_skipped_batch();
                continue;
            }

            let kernel = kernels
                .get(env)
                .ok_or_else(|| Error::MissingKernel(env.to_string()))?;
            let workgroup_size = match options.local_size {
                Some(size) => size,
                None if options.use_local_reduction => {
                    kernel.preferred_work_group_size_multiple(env.device().as_ref())?
                }
                None => 1,
            };

            debug!(environment = %env, %batch, workgroup_size, "batch assigned");
            processors.push(BatchProcessor::with_metrics(
                env.clone(),
                Arc::clone(kernel),
                Arc::clone(&arguments),
                batch,
                workgroup_size,
                Arc::clone(&metrics),
            )?);
        }

        Ok(Self {
            processors,
            division,
            metrics,
        })
    }

    /// Batch per environment as returned by the balancer, empty ones included.
    pub fn division(&self) -> &[(ComputeEnvironment, WorkBatch)] {
        &self.division
    }

    /// The batch processors that will launch, one per non-empty batch.
    pub fn processors(&self) -> &[BatchProcessor] {
        &self.processors
    }

    /// Launch counters of this processor.
    pub fn metrics(&self) -> LaunchSnapshot {
        self.metrics.snapshot()
    }
}

impl Processor for MultiDeviceProcessor {
    fn process(&self, is_blocking: bool, wait_for: Option<&EventMap>) -> Result<EventMap> {
        let mut events = EventMap::with_capacity(self.processors.len());
        for processor in &self.processors {
            events.extend(processor.process(false, wait_for)?);
            processor.flush()?;
        }

        if is_blocking {
            let pending: Vec<Event> = events.values().cloned().collect();
            Event::wait_all(&pending)?;
        }
        Ok(events)
    }

    fn flush(&self) -> Result<()> {
        self.processors.iter().try_for_each(|p| p.flush())
    }

    fn finish(&self) -> Result<()> {
        // Every queue is drained even when an earlier one reports a failure.
        let mut first_err = None;
        for processor in &self.processors {
            if let Err(e) = processor.finish() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MultiDeviceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDeviceProcessor")
            .field("processors", &self.processors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{InputBuffer, OutputBuffer};
    use crate::device::{Driver, Kernel};
    use crate::dtype::{DType, HostArray};
    use crate::environment::MemoryPolicy;
    use crate::host::{HostDeviceConfig, HostDriver, HostKernel, HostPlatformConfig};
    use crate::scheduler::{EvenDistribution, PreferSpecificEnvironment};

    fn pool() -> Vec<ComputeEnvironment> {
        let driver = HostDriver::new(vec![HostPlatformConfig::new("p")
            .with_device(HostDeviceConfig::gpu("g"))
            .with_device(HostDeviceConfig::cpu("c"))]);
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

    fn square() -> Arc<dyn Kernel> {
        Arc::new(
            HostKernel::new("square", |group| {
                let i = group.group_id();
                let x: f64 = group.load_one(0, i)?;
                group.store_one(1, i, x * x)
            })
            .with_preferred_multiple(32),
        )
    }

    fn kernels(envs: &[ComputeEnvironment]) -> KernelMap {
        let kernel = square();
        envs.iter().map(|e| (e.clone(), Arc::clone(&kernel))).collect()
    }

    fn arguments(n: usize) -> Arc<KernelArguments> {
        let input: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Arc::new(
            KernelArguments::new()
                .with("x", InputBuffer::new(HostArray::from_slice(&input)))
                .unwrap()
                .with("y", OutputBuffer::new(DType::F64, vec![n]))
                .unwrap(),
        )
    }

    #[test]
    fn test_runs_across_pool() {
        let envs = pool();
        let args = arguments(7);
        let processor = MultiDeviceProcessor::new(
            &kernels(&envs),
            Arc::clone(&args),
            &envs,
            &EvenDistribution,
            7,
            LaunchOptions::default(),
        )
        .unwrap();

        let events = processor.process(false, None).unwrap();
        assert_eq!(events.len(), 2);
        processor.finish().unwrap();

        let y = args.data("y").unwrap().to_vec::<f64>().unwrap();
        assert_eq!(y, vec![0.0, 1.0, 4.0, 9.0, 16.0, 25.0, 36.0]);
        #[cfg(feature = "telemetry")]
        assert_eq!(processor.metrics().launches, 2);
    }

    #[test]
    fn test_workgroup_selection() {
        let envs = pool();
        let kernels = kernels(&envs);

        let plain = MultiDeviceProcessor::new(
            &kernels,
            arguments(4),
            &envs,
            &EvenDistribution,
            4,
            LaunchOptions::default(),
        )
        .unwrap();
        assert!(plain.processors().iter().all(|p| p.local_size() == 1));

        let reducing = MultiDeviceProcessor::new(
            &kernels,
            arguments(4),
            &envs,
            &EvenDistribution,
            4,
            LaunchOptions::with_local_reduction(),
        )
        .unwrap();
        assert!(reducing.processors().iter().all(|p| p.local_size() == 32));

        let explicit = MultiDeviceProcessor::new(
            &kernels,
            arguments(4),
            &envs,
            &EvenDistribution,
            4,
            LaunchOptions {
                use_local_reduction: true,
                local_size: Some(8),
            },
        )
        .unwrap();
        assert!(explicit.processors().iter().all(|p| p.local_size() == 8));
    }

    #[test]
    fn test_empty_batches_skipped() {
        let envs = pool();
        let processor = MultiDeviceProcessor::new(
            &kernels(&envs),
            arguments(3),
            &envs,
            &PreferSpecificEnvironment(1),
            3,
            LaunchOptions::default(),
        )
        .unwrap();

        assert_eq!(processor.division().len(), 2);
        assert_eq!(processor.processors().len(), 1);
        let events = processor.process(true, None).unwrap();
        assert!(events.contains_key(&envs[1]));
        assert!(!events.contains_key(&envs[0]));
    }

    #[test]
    fn test_missing_kernel_and_zero_local_size() {
        let envs = pool();
        let mut partial = kernels(&envs);
        partial.remove(&envs[1]);

        let err = MultiDeviceProcessor::new(
            &partial,
            arguments(2),
            &envs,
            &EvenDistribution,
            2,
            LaunchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingKernel(_)));

        // The environment without a kernel gets no work, so it is not needed.
        assert!(MultiDeviceProcessor::new(
            &partial,
            arguments(2),
            &envs,
            &PreferSpecificEnvironment(0),
            2,
            LaunchOptions::default(),
        )
        .is_ok());

        let err = MultiDeviceProcessor::new(
            &kernels(&envs),
            arguments(2),
            &envs,
            &EvenDistribution,
            2,
            LaunchOptions::with_local_size(0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[derive(Debug)]
    struct Overlapping;

    impl LoadBalancer for Overlapping {
        fn divide(&self, environments: &[ComputeEnvironment], n: usize) -> Vec<WorkBatch> {
            environments.iter().map(|_| WorkBatch::new(0, n)).collect()
        }
    }

    #[test]
    fn test_non_conforming_balancer_rejected() {
        let envs = pool();
        let err = MultiDeviceProcessor::new(
            &kernels(&envs),
            arguments(4),
            &envs,
            &Overlapping,
            4,
            LaunchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPartition(_)));
    }
}
