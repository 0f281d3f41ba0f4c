//! Single-environment launches.

use super::{wait_list, EventMap, Processor};
use crate::argument::KernelArguments;
use crate::device::{CommandQueue, Event, Kernel, NdRange};
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use crate::scheduler::WorkBatch;
use crate::telemetry::LaunchMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Runs one kernel over one batch on one environment.
///
/// Every instance gets one workgroup, so the launch covers
/// `batch.len() * workgroup_size` work items.
pub struct BatchProcessor {
    environment: ComputeEnvironment,
    kernel: Arc<dyn Kernel>,
    arguments: Arc<KernelArguments>,
    batch: WorkBatch,
    workgroup_size: usize,
    queue: Arc<dyn CommandQueue>,
    metrics: Arc<LaunchMetrics>,
}

impl BatchProcessor {
    /// A processor for `batch` with `workgroup_size` lanes per instance.
    ///
    /// Fails when the workgroup size is 0 or the arguments do not match the
    /// scalar signature the kernel declares.
    pub fn new(
        environment: ComputeEnvironment,
        kernel: Arc<dyn Kernel>,
        arguments: Arc<KernelArguments>,
        batch: WorkBatch,
        workgroup_size: usize,
    ) -> Result<Self> {
        Self::with_metrics(
            environment,
            kernel,
            arguments,
            batch,
            workgroup_size,
            Arc::new(LaunchMetrics::new()),
        )
    }

    pub(crate) fn with_metrics(
        environment: ComputeEnvironment,
        kernel: Arc<dyn Kernel>,
        arguments: Arc<KernelArguments>,
        batch: WorkBatch,
        workgroup_size: usize,
        metrics: Arc<LaunchMetrics>,
    ) -> Result<Self> {
        if workgroup_size == 0 {
            return Err(Error::config("workgroup size must be positive"));
        }
        if let Some(declared) = kernel.scalar_arg_dtypes() {
            let bound = arguments.scalar_arg_dtypes();
            if declared != bound.as_slice() {
                return Err(Error::argument(format!(
                    "kernel '{}' declares scalar dtypes {:?}, arguments bind {:?}",
                    kernel.name(),
                    declared,
                    bound
                )));
            }
        }
        let queue = environment.queue()?;

        Ok(Self {
            environment,
            kernel,
            arguments,
            batch,
            workgroup_size,
            queue,
            metrics,
        })
    }

    /// Environment the batch runs on.
    pub fn environment(&self) -> &ComputeEnvironment {
        &self.environment
    }

    /// Instances this processor launches.
    pub fn batch(&self) -> WorkBatch {
        self.batch
    }

    /// Work items of the launch.
    pub fn global_size(&self) -> usize {
        self.batch.len() * self.workgroup_size
    }

    /// Work items per workgroup.
    pub fn local_size(&self) -> usize {
        self.workgroup_size
    }

    /// Launch counters, shared with the owning multi-device processor.
    pub fn metrics(&self) -> &Arc<LaunchMetrics> {
        &self.metrics
    }

    fn launch(&self, external: &[Event]) -> Result<Event> {
        let started = Instant::now();

        let mut inputs = Vec::with_capacity(self.arguments.len());
        let mut wait_for: Vec<Event> = Vec::new();
        for (_, argument) in self.arguments.iter() {
            let materialized =
                argument.materialize(&self.environment, self.workgroup_size, self.batch, external)?;
            inputs.push(materialized.input);
            wait_for.extend(materialized.ready);
        }
        wait_for.extend(external.iter().cloned());

        let range = NdRange::new(self.global_size(), self.workgroup_size)
            .with_offset(self.batch.start * self.workgroup_size);
        let event = self
            .queue
            .enqueue_kernel(&self.kernel, inputs, range, &wait_for)?;

        debug!(
            environment = %self.environment,
            kernel = self.kernel.name(),
            batch = %self.batch,
            global = range.global,
            local = range.local,
            "kernel launched"
        );
        self.metrics.record_launch(self.batch.len(), started.elapsed());
        Ok(event)
    }
}

impl Processor for BatchProcessor {
    fn process(&self, is_blocking: bool, wait_for: Option<&EventMap>) -> Result<EventMap> {
        let event = self.launch(&wait_list(wait_for)).inspect_err(|_| {
            self.metrics.record_launch_failure();
        })?;

        if is_blocking {
            event.wait()?;
        }

        let mut events = EventMap::with_capacity(1);
        events.insert(self.environment.clone(), event);
        Ok(events)
    }

    fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish()
    }
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("environment", &self.environment)
            .field("kernel", &self.kernel.name())
            .field("batch", &self.batch)
            .field("workgroup_size", &self.workgroup_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{InputBuffer, OutputBuffer};
    use crate::device::{Driver, EventStatus};
    use crate::dtype::{DType, HostArray, ScalarValue};
    use crate::environment::MemoryPolicy;
    use crate::host::{HostDeviceConfig, HostDriver, HostKernel, HostPlatformConfig};

    fn env() -> ComputeEnvironment {
        let driver = HostDriver::new(vec![
            HostPlatformConfig::new("p").with_device(HostDeviceConfig::gpu("g"))
        ]);
        let platform = driver.platforms().unwrap().remove(0);
        let device = platform.devices().remove(0);
        ComputeEnvironment::new(platform, device, Vec::new(), MemoryPolicy::default()).unwrap()
    }

    /// out[i] = in[i] * 2 for every instance of the batch.
    fn doubler() -> Arc<dyn Kernel> {
        Arc::new(HostKernel::new("double", |group| {
            let i = group.group_id();
            let value: f64 = group.load_one(0, i)?;
            group.store_one(1, i, value * 2.0)
        }))
    }

    fn arguments(input: &[f64]) -> Arc<KernelArguments> {
        let args = KernelArguments::new()
            .with("in", InputBuffer::new(HostArray::from_slice(input)))
            .unwrap()
            .with("out", OutputBuffer::new(DType::F64, vec![input.len()]))
            .unwrap();
        Arc::new(args)
    }

    #[test]
    fn test_geometry() {
        let processor =
            BatchProcessor::new(env(), doubler(), arguments(&[0.0; 10]), WorkBatch::new(2, 7), 4)
                .unwrap();
        assert_eq!(processor.global_size(), 20);
        assert_eq!(processor.local_size(), 4);
    }

    #[test]
    fn test_zero_workgroup_rejected() {
        let err = BatchProcessor::new(env(), doubler(), arguments(&[1.0]), WorkBatch::new(0, 1), 0)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_blocking_process_completes() {
        let env = env();
        let args = arguments(&[1.0, 2.0, 3.0]);
        let processor =
            BatchProcessor::new(env.clone(), doubler(), Arc::clone(&args), WorkBatch::new(1, 3), 1)
                .unwrap();

        let events = processor.process(true, None).unwrap();
        assert_eq!(events[&env].status(), EventStatus::Complete);
        processor.finish().unwrap();

        let out = args.data("out").unwrap().to_vec::<f64>().unwrap();
        assert_eq!(out, vec![0.0, 4.0, 6.0]);
    }

    #[test]
    fn test_declared_signature_is_checked_not_overwritten() {
        let kernel: Arc<dyn Kernel> = Arc::new(
            HostKernel::new("scaled", |_| Ok(()))
                .with_scalar_arg_dtypes(vec![None, Some(DType::F64)]),
        );
        let matching = Arc::new(
            KernelArguments::new()
                .with("out", OutputBuffer::new(DType::F64, vec![1]))
                .unwrap()
                .with("scale", ScalarValue::from(2.0f64))
                .unwrap(),
        );
        let mismatching = Arc::new(
            KernelArguments::new()
                .with("out", OutputBuffer::new(DType::F64, vec![1]))
                .unwrap()
                .with("scale", ScalarValue::from(2u32))
                .unwrap(),
        );

        let good = BatchProcessor::new(
            env(),
            Arc::clone(&kernel),
            matching,
            WorkBatch::new(0, 1),
            1,
        )
        .unwrap();
        let err = BatchProcessor::new(
            env(),
            Arc::clone(&kernel),
            mismatching,
            WorkBatch::new(0, 1),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // The rejected processor left the shared kernel as it was.
        assert_eq!(kernel.scalar_arg_dtypes(), Some(&[None, Some(DType::F64)][..]));
        good.process(true, None).unwrap();
    }

    #[test]
    fn test_waits_for_external_events() {
        let env = env();
        let processor =
            BatchProcessor::new(env.clone(), doubler(), arguments(&[1.0]), WorkBatch::new(0, 1), 1)
                .unwrap();

        let gate = crate::device::Event::new("gate");
        gate.set_status(EventStatus::Submitted);
        let mut external = EventMap::new();
        external.insert(env.clone(), gate.clone());

        let events = processor.process(false, Some(&external)).unwrap();
        processor.flush().unwrap();
        assert!(!events[&env].wait_timeout(std::time::Duration::from_millis(20)).unwrap());

        gate.set_status(EventStatus::Complete);
        events[&env].wait().unwrap();
    }
}
