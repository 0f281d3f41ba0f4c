//! The runtime value tying a driver, its discovered environments and a
//! load balancer together.

use crate::argument::KernelArguments;
use crate::config::RuntimeConfig;
use crate::device::{Driver, Kernel};
use crate::discovery::Discovery;
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use crate::executor::{KernelMap, MultiDeviceProcessor, Processor};
use crate::scheduler::LoadBalancer;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A discovered device pool plus the policy that shares work across it.
pub struct Runtime {
    environments: Vec<ComputeEnvironment>,
    balancer: Arc<dyn LoadBalancer>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Validate `config` and discover environments on `driver`.
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let environments = Discovery::new(driver.as_ref()).discover(&config.discovery_options())?;
        info!(
            driver = driver.name(),
            environments = environments.len(),
            "runtime ready"
        );
        Self::with_environments(environments, config)
    }

    /// Use an already discovered pool.
    pub fn with_environments(
        environments: Vec<ComputeEnvironment>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        config.validate()?;
        if environments.is_empty() {
            return Err(Error::no_suitable_device("runtime needs at least one environment"));
        }
        let balancer = config.balancer.build()?;
        Ok(Self {
            environments,
            balancer,
            config,
        })
    }

    /// Replace the configured balancer with a custom policy.
    pub fn with_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    /// Environments in discovery order.
    pub fn environments(&self) -> &[ComputeEnvironment] {
        &self.environments
    }

    /// Balancer used by [`Runtime::processor`].
    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Configuration the runtime was built from.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build one kernel per environment with `compile`.
    pub fn compile_kernels<F>(&self, mut compile: F) -> Result<KernelMap>
    where
        F: FnMut(&ComputeEnvironment) -> Result<Arc<dyn Kernel>>,
    {
        self.environments
            .iter()
            .map(|env| Ok((env.clone(), compile(env)?)))
            .collect()
    }

    /// Multi-device processor over every environment with the runtime's
    /// balancer and launch options.
    pub fn processor(
        &self,
        kernels: &KernelMap,
        arguments: Arc<KernelArguments>,
        nmr_instances: usize,
    ) -> Result<MultiDeviceProcessor> {
        MultiDeviceProcessor::new(
            kernels,
            arguments,
            &self.environments,
            self.balancer.as_ref(),
            nmr_instances,
            self.config.launch,
        )
    }

    /// Launch `nmr_instances` instances and wait for all of them.
    pub fn run(
        &self,
        kernels: &KernelMap,
        arguments: Arc<KernelArguments>,
        nmr_instances: usize,
    ) -> Result<MultiDeviceProcessor> {
        let processor = self.processor(kernels, arguments, nmr_instances)?;
        processor.process(false, None)?;
        processor.finish()?;
        Ok(processor)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("environments", &self.environments)
            .field("balancer", &self.balancer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerPolicy;
    use crate::device::DeviceSelector;
    use crate::host::{HostDeviceConfig, HostDriver, HostKernel, HostPlatformConfig};

    fn driver() -> Arc<dyn Driver> {
        Arc::new(HostDriver::new(vec![HostPlatformConfig::new("p")
            .with_device(HostDeviceConfig::cpu("c"))
            .with_device(HostDeviceConfig::gpu("g"))]))
    }

    #[test]
    fn test_runtime_discovers_pool() {
        let runtime = Runtime::new(driver(), RuntimeConfig::build_default()).unwrap();
        assert_eq!(runtime.environments().len(), 2);

        let cpu_only = RuntimeConfig::builder()
            .selector(DeviceSelector::Cpu)
            .build()
            .unwrap();
        let runtime = Runtime::new(driver(), cpu_only).unwrap();
        assert!(runtime.environments()[0].is_cpu());
    }

    #[test]
    fn test_compile_kernels_per_environment() {
        let runtime = Runtime::new(driver(), RuntimeConfig::build_default()).unwrap();
        let kernels = runtime
            .compile_kernels(|env| {
                let kernel: Arc<dyn Kernel> =
                    Arc::new(HostKernel::new(format!("k-{}", env.info().name), |_| Ok(())));
                Ok(kernel)
            })
            .unwrap();
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[&runtime.environments()[1]].name(), "k-g");
    }

    #[test]
    fn test_with_environments_rejects_empty_pool() {
        let err = Runtime::with_environments(Vec::new(), RuntimeConfig::build_default())
            .unwrap_err();
        assert!(err.is_discovery_failure());
    }

    #[test]
    fn test_invalid_balancer_config() {
        let mut config = RuntimeConfig::build_default();
        config.balancer = BalancerPolicy::Proportional(vec![f64::NAN]);
        assert!(matches!(
            Runtime::new(driver(), config),
            Err(Error::Config(_))
        ));
    }
}
