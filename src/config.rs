//! Runtime configuration: device selection, memory policy, balancer and
//! launch options, built and validated up front.

use crate::device::{DeviceSelector, PlatformId};
use crate::discovery::{DiscoveryMode, DiscoveryOptions};
use crate::environment::MemoryPolicy;
use crate::error::{Error, Result};
use crate::executor::LaunchOptions;
use crate::scheduler::{
    EvenDistribution, LoadBalancer, PreferCpu, PreferGpu, PreferSpecificEnvironment, Proportional,
};
use std::sync::Arc;

/// Which shipped load balancer a runtime uses.
#[derive(Debug, Clone, PartialEq)]
pub enum BalancerPolicy {
    /// Same-size batches on every environment.
    Even,
    /// Everything on GPUs, spread over every environment when there are none.
    PreferGpu,
    /// Everything on CPUs, spread over every environment when there are none.
    PreferCpu,
    /// Everything on the environment at this index.
    PreferSpecific(usize),
    /// Batches sized by per-environment weights.
    Proportional(Vec<f64>),
}

impl BalancerPolicy {
    /// Instantiate the balancer. Fails on invalid proportional weights.
    pub fn build(&self) -> Result<Arc<dyn LoadBalancer>> {
        Ok(match self {
            BalancerPolicy::Even => Arc::new(EvenDistribution),
            BalancerPolicy::PreferGpu => Arc::new(PreferGpu),
            BalancerPolicy::PreferCpu => Arc::new(PreferCpu),
            BalancerPolicy::PreferSpecific(index) => Arc::new(PreferSpecificEnvironment(*index)),
            BalancerPolicy::Proportional(weights) => Arc::new(Proportional::new(weights.clone())?),
        })
    }
}

/// Everything a [`crate::Runtime`] needs to discover devices and launch work.
///
/// There is no process-wide configuration; build one and pass it along.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Device classes to discover.
    pub selector: DeviceSelector,
    /// Restrict discovery to one platform.
    pub platform: Option<PlatformId>,
    /// One device or all matching devices.
    pub discovery_mode: DiscoveryMode,
    /// Skip devices without double precision support.
    pub require_double_precision: bool,
    /// Use any device when none matches `selector`.
    pub fallback_to_any: bool,
    /// Flags handed to every kernel build.
    pub compile_flags: Vec<String>,
    /// Copy or alias host memory.
    pub memory_policy: MemoryPolicy,
    /// How batches are divided over environments.
    pub balancer: BalancerPolicy,
    /// Workgroup sizing for launches.
    pub launch: LaunchOptions,
}

impl RuntimeConfig {
    /// All devices on all platforms, double precision required, work sent to
    /// GPUs when there are any.
    pub fn build_default() -> Self {
        Self {
            selector: DeviceSelector::All,
            platform: None,
            discovery_mode: DiscoveryMode::All,
            require_double_precision: true,
            fallback_to_any: false,
            compile_flags: Vec::new(),
            memory_policy: MemoryPolicy::ByDeviceClass,
            balancer: BalancerPolicy::PreferGpu,
            launch: LaunchOptions::default(),
        }
    }

    /// Start a [`ConfigBuilder`] from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reject configurations no runtime could use.
    pub fn validate(&self) -> Result<()> {
        if self.launch.local_size == Some(0) {
            return Err(Error::config("local_size must be > 0"));
        }

        if let BalancerPolicy::Proportional(weights) = &self.balancer {
            if weights.is_empty() {
                return Err(Error::config("proportional balancer needs weights"));
            }
            Proportional::new(weights.clone())?;
        }

        if self.compile_flags.iter().any(|f| f.trim().is_empty()) {
            return Err(Error::config("compile flags must not be blank"));
        }

        Ok(())
    }

    /// The discovery half of the configuration.
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            selector: self.selector,
            platform: self.platform,
            require_double_precision: self.require_double_precision,
            fallback_to_any: self.fallback_to_any,
            mode: self.discovery_mode,
            compile_flags: self.compile_flags.clone(),
            memory_policy: self.memory_policy,
        }
    }
}

/// Builder for [`RuntimeConfig`], validated on [`ConfigBuilder::build`].
#[derive(Debug)]
pub struct ConfigBuilder {
    config: RuntimeConfig,
}

impl ConfigBuilder {
    /// Builder seeded with [`RuntimeConfig::build_default`].
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::build_default(),
        }
    }

    /// Device classes to discover.
    pub fn selector(mut self, selector: DeviceSelector) -> Self {
        self.config.selector = selector;
        self
    }

    /// Restrict discovery to one platform.
    pub fn platform(mut self, platform: PlatformId) -> Self {
        self.config.platform = Some(platform);
        self
    }

    /// One device or all matching devices.
    pub fn discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.config.discovery_mode = mode;
        self
    }

    /// Skip devices without double precision support.
    pub fn require_double_precision(mut self, required: bool) -> Self {
        self.config.require_double_precision = required;
        self
    }

    /// Use any device when none matches the selector.
    pub fn fallback_to_any(mut self, fallback: bool) -> Self {
        self.config.fallback_to_any = fallback;
        self
    }

    /// Append one kernel compile flag.
    pub fn compile_flag<S: Into<String>>(mut self, flag: S) -> Self {
        self.config.compile_flags.push(flag.into());
        self
    }

    /// Copy or alias host memory.
    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.config.memory_policy = policy;
        self
    }

    /// How batches are divided over environments.
    pub fn balancer(mut self, policy: BalancerPolicy) -> Self {
        self.config.balancer = policy;
        self
    }

    /// Size workgroups from each kernel's preferred multiple.
    pub fn use_local_reduction(mut self, enable: bool) -> Self {
        self.config.launch.use_local_reduction = enable;
        self
    }

    /// Fixed workgroup size for every launch.
    pub fn local_size(mut self, size: usize) -> Self {
        self.config.launch.local_size = Some(size);
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
