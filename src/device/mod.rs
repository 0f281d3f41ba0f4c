//! Device identities, capabilities and the driver seam.
//!
//! A driver exposes platforms, a platform exposes devices, and a device can
//! build a context that hands out command queues and buffers. The engine only
//! talks to these traits, so drivers are interchangeable.

pub mod driver;
pub mod event;

pub use driver::{
    BufferHandle, CommandQueue, Context, Device, DeviceBuffer, Driver, HostPtrMode, HostRegion,
    Kernel, LaunchInput, MemAccess, MemFlags, NdRange, Platform,
};
pub use event::{Event, EventStatus, NativeEvent};

use crate::error::Error;
use std::fmt;
use std::str::FromStr;

/// Identifier of a platform within its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformId(pub u32);

/// Identifier of a device within its platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "platform:{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

/// Broad hardware class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Host processors.
    Cpu,
    /// Discrete or integrated graphics processors.
    Gpu,
    /// Accelerators and anything else.
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Cpu => "CPU",
            DeviceClass::Gpu => "GPU",
            DeviceClass::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// Which devices a discovery call is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceSelector {
    /// GPU-class devices only.
    Gpu,
    /// CPU-class devices only.
    Cpu,
    /// Every device.
    #[default]
    All,
}

impl DeviceSelector {
    /// Whether a device of `class` is selected.
    pub fn matches(self, class: DeviceClass) -> bool {
        match self {
            DeviceSelector::Gpu => class == DeviceClass::Gpu,
            DeviceSelector::Cpu => class == DeviceClass::Cpu,
            DeviceSelector::All => true,
        }
    }

    /// Whether this selector names a specific class.
    pub fn is_specific(self) -> bool {
        !matches!(self, DeviceSelector::All)
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceSelector::Gpu => "GPU",
            DeviceSelector::Cpu => "CPU",
            DeviceSelector::All => "ALL",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GPU" => Ok(DeviceSelector::Gpu),
            "CPU" => Ok(DeviceSelector::Cpu),
            "ALL" => Ok(DeviceSelector::All),
            _ => Err(Error::InvalidSelector(s.to_string())),
        }
    }
}

/// Static description of a device, queried once from the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Device name.
    pub name: String,
    /// Device vendor.
    pub vendor: String,
    /// Hardware class.
    pub class: DeviceClass,
    /// Double-precision support.
    pub supports_double: bool,
    /// Parallel compute units.
    pub compute_units: usize,
    /// Largest workgroup a kernel may be launched with.
    pub max_work_group_size: usize,
    /// Global memory in bytes.
    pub global_mem_bytes: u64,
    /// Driver version string.
    pub driver_version: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "vendor: {}", self.vendor)?;
        writeln!(f, "type: {}", self.class)?;
        writeln!(f, "double precision: {}", self.supports_double)?;
        writeln!(f, "max compute units: {}", self.compute_units)?;
        writeln!(f, "max work group size: {}", self.max_work_group_size)?;
        writeln!(f, "global mem size: {}", self.global_mem_bytes)?;
        write!(f, "driver version: {}", self.driver_version)
    }
}
