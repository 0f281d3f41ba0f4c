//! Driver traits.
//!
//! Every trait here is object safe; the engine holds drivers, platforms,
//! devices, contexts, queues and kernels as `Arc<dyn ...>`.

use super::{DeviceClass, DeviceId, DeviceInfo, DeviceSelector, Event, PlatformId};
use crate::dtype::{DType, ScalarValue, SharedBytes};
use crate::error::Result;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Entry point of a device backend.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// All platforms this driver can see, in a stable order.
    fn platforms(&self) -> Result<Vec<Arc<dyn Platform>>>;
}

/// A vendor platform grouping devices.
pub trait Platform: Send + Sync + fmt::Debug {
    /// Position of the platform within its driver.
    fn id(&self) -> PlatformId;

    /// Platform name as reported by the driver.
    fn name(&self) -> &str;

    /// Platform vendor as reported by the driver.
    fn vendor(&self) -> &str;

    /// All devices on this platform, in a stable order.
    fn devices(&self) -> Vec<Arc<dyn Device>>;

    /// Devices whose class matches `selector`.
    fn devices_of(&self, selector: DeviceSelector) -> Vec<Arc<dyn Device>> {
        self.devices()
            .into_iter()
            .filter(|d| selector.matches(d.info().class))
            .collect()
    }
}

/// One physical (or emulated) compute device.
pub trait Device: Send + Sync + fmt::Debug {
    /// Position of the device within its platform.
    fn id(&self) -> DeviceId;

    /// Capabilities queried once when the driver enumerated the device.
    fn info(&self) -> &DeviceInfo;

    /// Hardware class, shorthand for `info().class`.
    fn class(&self) -> DeviceClass {
        self.info().class
    }

    /// Whether the device runs double-precision kernels.
    fn supports_double(&self) -> bool {
        self.info().supports_double
    }

    /// Build an execution context bound to this device.
    ///
    /// Fails with [`crate::Error::DeviceConstruction`] when the driver cannot
    /// set the device up.
    fn create_context(&self, compile_flags: &[String]) -> Result<Arc<dyn Context>>;
}

/// An execution context. Queues and buffers created from one context share it.
pub trait Context: Send + Sync + fmt::Debug {
    /// Open another in-order command queue on the context's device.
    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>>;

    /// Allocate `len` bytes of device memory.
    ///
    /// With [`HostPtrMode::UseHostPtr`] and a host region the buffer aliases
    /// that region. Otherwise fresh device memory is allocated, filled from the
    /// host region when one is given and zeroed when not.
    fn create_buffer(
        &self,
        flags: MemFlags,
        len: usize,
        host: Option<HostRegion>,
    ) -> Result<DeviceBuffer>;

    /// Concrete context, for driver-specific entry points such as kernel builds.
    fn as_any(&self) -> &dyn Any;
}

/// An ordered command stream on one device.
///
/// Enqueue calls return immediately. Commands are only guaranteed to reach
/// the device after [`CommandQueue::flush`], and to be done after
/// [`CommandQueue::finish`] or after their event has completed.
pub trait CommandQueue: Send + Sync + fmt::Debug {
    /// Device the queue submits to.
    fn device_id(&self) -> DeviceId;

    /// Copy `src` into `buffer` at byte `offset`, once `wait_for` has completed.
    fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        src: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event>;

    /// Copy `dst.len` bytes from `buffer` at byte `offset` into `dst`.
    fn enqueue_read(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        dst: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event>;

    /// Launch `kernel` over `range` with positional `inputs`.
    fn enqueue_kernel(
        &self,
        kernel: &Arc<dyn Kernel>,
        inputs: Vec<LaunchInput>,
        range: NdRange,
        wait_for: &[Event],
    ) -> Result<Event>;

    /// Submit everything enqueued so far to the device.
    fn flush(&self) -> Result<()>;

    /// Flush and block until every submitted command has completed.
    fn finish(&self) -> Result<()>;
}

/// A compiled kernel, opaque to the engine.
///
/// A kernel is shared by every processor that launches it, so nothing about
/// one launch is stored on it.
pub trait Kernel: Send + Sync + fmt::Debug {
    /// Entry point name.
    fn name(&self) -> &str;

    /// Preferred workgroup-size multiple of this kernel on `device`.
    fn preferred_work_group_size_multiple(&self, device: &dyn Device) -> Result<usize>;

    /// Declared per-parameter scalar types, `None` entries for non-scalar
    /// parameters. Kernels without a declaration accept any argument list.
    fn scalar_arg_dtypes(&self) -> Option<&[Option<DType>]> {
        None
    }

    /// Concrete kernel, for the driver that built it.
    fn as_any(&self) -> &dyn Any;
}

/// Access mode of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    /// Kernels only read the buffer.
    ReadOnly,
    /// Kernels only write the buffer.
    WriteOnly,
    /// Kernels read and write the buffer.
    ReadWrite,
}

/// How a device buffer relates to host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPtrMode {
    /// Copy host data into device memory; results need an explicit read-back.
    CopyHostPtr,
    /// Let the device work directly on the host allocation.
    UseHostPtr,
}

/// Memory flags for buffer creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags {
    /// What kernels may do with the buffer.
    pub access: MemAccess,
    /// Whether the buffer copies or aliases host memory.
    pub host: HostPtrMode,
}

impl MemFlags {
    /// Flags from an access mode and a host-pointer mode.
    pub const fn new(access: MemAccess, host: HostPtrMode) -> Self {
        Self { access, host }
    }

    /// Whether kernels may write the buffer.
    pub fn is_writable(&self) -> bool {
        !matches!(self.access, MemAccess::ReadOnly)
    }

    /// Whether the buffer aliases host memory.
    pub fn uses_host_ptr(&self) -> bool {
        self.host == HostPtrMode::UseHostPtr
    }
}

/// A byte range inside shared host storage.
#[derive(Clone)]
pub struct HostRegion {
    /// The whole host allocation.
    pub storage: SharedBytes,
    /// First byte of the range.
    pub offset: usize,
    /// Length of the range in bytes.
    pub len: usize,
}

impl HostRegion {
    /// Whether both regions live in the same storage and share a byte.
    pub fn overlaps(&self, other: &HostRegion) -> bool {
        self.len > 0
            && other.len > 0
            && Arc::ptr_eq(&self.storage, &other.storage)
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Driver-specific buffer object.
pub trait BufferHandle: Send + Sync + fmt::Debug {
    /// Size in bytes.
    fn len(&self) -> usize;

    /// Whether the buffer holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flags the buffer was created with.
    fn flags(&self) -> MemFlags;

    /// Concrete buffer, for the driver that created it.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a driver buffer.
pub type DeviceBuffer = Arc<dyn BufferHandle>;

/// One positional kernel input.
#[derive(Debug, Clone)]
pub enum LaunchInput {
    /// A device buffer.
    Buffer(DeviceBuffer),
    /// A value passed by copy.
    Scalar(ScalarValue),
    /// Workgroup-local scratch of the given size in bytes.
    Local {
        /// Scratch size per workgroup.
        bytes: usize,
    },
}

impl LaunchInput {
    /// Human-readable kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchInput::Buffer(_) => "buffer",
            LaunchInput::Scalar(_) => "scalar",
            LaunchInput::Local { .. } => "local memory",
        }
    }
}

/// One dimensional launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    /// Total work items.
    pub global: usize,
    /// Work items per workgroup.
    pub local: usize,
    /// Global id of the first work item, a multiple of `local`.
    pub offset: usize,
}

impl NdRange {
    /// A range starting at global id 0.
    pub fn new(global: usize, local: usize) -> Self {
        Self {
            global,
            local,
            offset: 0,
        }
    }

    /// Shift the first global id to `offset`.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Number of workgroups, 0 for a zero local size.
    pub fn num_groups(&self) -> usize {
        if self.local == 0 {
            0
        } else {
            self.global / self.local
        }
    }

    /// Index of the first workgroup across the whole division.
    pub fn first_group(&self) -> usize {
        if self.local == 0 {
            0
        } else {
            self.offset / self.local
        }
    }
}
