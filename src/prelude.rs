//! Common imports: `use hetbatch::prelude::*;`.

pub use crate::argument::{
    InputBuffer, KernelArgument, KernelArguments, LocalMemory, OutputBuffer,
};
pub use crate::config::{BalancerPolicy, ConfigBuilder, RuntimeConfig};
pub use crate::device::{DeviceSelector, Driver, Event, Kernel};
pub use crate::dtype::{DType, HostArray, ScalarValue};
pub use crate::environment::{ComputeEnvironment, MemoryPolicy};
pub use crate::error::{Error, Result};
pub use crate::executor::{LaunchOptions, MultiDeviceProcessor, Processor};
pub use crate::host::{HostDeviceConfig, HostDriver, HostKernel, HostPlatformConfig, WorkGroup};
pub use crate::runtime::Runtime;
pub use crate::scheduler::{
    EvenDistribution, LoadBalancer, PreferCpu, PreferGpu, PreferSpecificEnvironment, Proportional,
};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{LaunchMetrics, LaunchSnapshot};
