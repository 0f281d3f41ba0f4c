//! The host driver: devices emulated on the calling machine.
//!
//! Every device runs its commands on host threads, but keeps the class and
//! capabilities it was configured with, so GPU and CPU code paths (copy vs
//! host-pointer buffers, double-precision filtering, workgroup limits) can be
//! exercised without vendor hardware.

pub mod kernel;
pub mod memory;
pub mod panic;
pub mod queue;

pub use kernel::{HostKernel, KernelFn, WorkGroup};
pub use memory::HostBuffer;
pub use queue::HostQueue;

use crate::device::{
    CommandQueue, Context, Device, DeviceBuffer, DeviceClass, DeviceId, DeviceInfo, Driver,
    HostRegion, MemFlags, Platform, PlatformId,
};
use crate::error::{Error, Result};
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Description of one emulated device.
#[derive(Debug, Clone)]
pub struct HostDeviceConfig {
    info: DeviceInfo,
    context_failure: Option<String>,
}

impl HostDeviceConfig {
    fn with_class(name: impl Into<String>, class: DeviceClass) -> Self {
        let (compute_units, max_work_group_size) = match class {
            DeviceClass::Cpu => (num_cpus::get(), 8192),
            DeviceClass::Gpu => (16, 1024),
            DeviceClass::Other => (1, 256),
        };
        Self {
            info: DeviceInfo {
                name: name.into(),
                vendor: "hetbatch".into(),
                class,
                supports_double: true,
                compute_units,
                max_work_group_size,
                global_mem_bytes: 1 << 30,
                driver_version: env!("CARGO_PKG_VERSION").into(),
            },
            context_failure: None,
        }
    }

    /// A CPU-class device with one compute unit per host core.
    pub fn cpu(name: impl Into<String>) -> Self {
        Self::with_class(name, DeviceClass::Cpu)
    }

    /// A GPU-class device.
    pub fn gpu(name: impl Into<String>) -> Self {
        Self::with_class(name, DeviceClass::Gpu)
    }

    /// An accelerator-class device.
    pub fn other(name: impl Into<String>) -> Self {
        Self::with_class(name, DeviceClass::Other)
    }

    /// Toggle double-precision support.
    pub fn double_precision(mut self, supported: bool) -> Self {
        self.info.supports_double = supported;
        self
    }

    /// Override the reported compute units.
    pub fn compute_units(mut self, units: usize) -> Self {
        self.info.compute_units = units;
        self
    }

    /// Cap the workgroup size, at least 1.
    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.info.max_work_group_size = size.max(1);
        self
    }

    /// Override the reported vendor.
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.info.vendor = vendor.into();
        self
    }

    /// Make context creation on this device fail with `reason`.
    pub fn fail_context(mut self, reason: impl Into<String>) -> Self {
        self.context_failure = Some(reason.into());
        self
    }
}

/// Description of one emulated platform.
#[derive(Debug, Clone)]
pub struct HostPlatformConfig {
    name: String,
    vendor: String,
    devices: Vec<HostDeviceConfig>,
}

impl HostPlatformConfig {
    /// An empty platform called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: "hetbatch".into(),
            devices: Vec::new(),
        }
    }

    /// Override the reported vendor.
    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    /// Append a device.
    pub fn with_device(mut self, device: HostDeviceConfig) -> Self {
        self.devices.push(device);
        self
    }
}

/// Driver over configured host platforms.
#[derive(Debug)]
pub struct HostDriver {
    platforms: Vec<Arc<HostPlatform>>,
}

impl HostDriver {
    /// Platforms and devices get ids from their position in the lists.
    pub fn new(platforms: Vec<HostPlatformConfig>) -> Self {
        let platforms = platforms
            .into_iter()
            .enumerate()
            .map(|(p, config)| {
                let id = PlatformId(p as u32);
                let devices = config
                    .devices
                    .into_iter()
                    .enumerate()
                    .map(|(d, device)| {
                        Arc::new(HostDevice {
                            id: DeviceId(d as u32),
                            info: device.info,
                            context_failure: device.context_failure,
                        })
                    })
                    .collect();
                Arc::new(HostPlatform {
                    id,
                    name: config.name,
                    vendor: config.vendor,
                    devices,
                })
            })
            .collect();
        Self { platforms }
    }

    /// A single platform with one CPU device sized to this machine.
    pub fn detect() -> Self {
        let cpu = HostDeviceConfig::cpu("host-cpu").compute_units(num_cpus::get());
        Self::new(vec![HostPlatformConfig::new("Host").with_device(cpu)])
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<Arc<dyn Platform>>> {
        Ok(self
            .platforms
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn Platform>)
            .collect())
    }
}

/// A configured host platform.
#[derive(Debug)]
pub struct HostPlatform {
    id: PlatformId,
    name: String,
    vendor: String,
    devices: Vec<Arc<HostDevice>>,
}

impl Platform for HostPlatform {
    fn id(&self) -> PlatformId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn vendor(&self) -> &str {
        &self.vendor
    }

    fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn Device>)
            .collect()
    }
}

/// An emulated device.
#[derive(Debug)]
pub struct HostDevice {
    id: DeviceId,
    info: DeviceInfo,
    context_failure: Option<String>,
}

impl Device for HostDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_context(&self, compile_flags: &[String]) -> Result<Arc<dyn Context>> {
        if let Some(reason) = &self.context_failure {
            return Err(Error::DeviceConstruction {
                device: self.info.name.clone(),
                reason: reason.clone(),
            });
        }
        debug!(device = %self.info.name, flags = ?compile_flags, "host context created");
        Ok(Arc::new(HostContext {
            device_id: self.id,
            info: self.info.clone(),
        }))
    }
}

/// Context of an emulated device. Every queue gets its own worker thread.
#[derive(Debug)]
pub struct HostContext {
    device_id: DeviceId,
    info: DeviceInfo,
}

impl Context for HostContext {
    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>> {
        let queue = HostQueue::spawn(self.device_id, self.info.clone())?;
        Ok(queue)
    }

    fn create_buffer(
        &self,
        flags: MemFlags,
        len: usize,
        host: Option<HostRegion>,
    ) -> Result<DeviceBuffer> {
        Ok(Arc::new(HostBuffer::allocate(flags, len, host)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
