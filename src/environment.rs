//! Compute environments: one device, its platform and an execution context.

use crate::device::{
    CommandQueue, Context, Device, DeviceClass, DeviceId, DeviceInfo, HostPtrMode, MemAccess,
    MemFlags, Platform, PlatformId,
};
use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// How buffers bound on an environment relate to host memory.
///
/// The default follows the classic discrete-GPU heuristic. Unified-memory
/// hardware may want one of the explicit variants instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryPolicy {
    /// GPUs copy host data into device memory, every other class shares the
    /// host allocation.
    #[default]
    ByDeviceClass,
    /// Every class copies host data into device memory.
    AlwaysCopy,
    /// Every class shares the host allocation.
    AlwaysUseHostPtr,
}

impl MemoryPolicy {
    /// Host-pointer mode for a device of `class`.
    pub fn host_ptr_mode(self, class: DeviceClass) -> HostPtrMode {
        match self {
            MemoryPolicy::ByDeviceClass if class == DeviceClass::Gpu => HostPtrMode::CopyHostPtr,
            MemoryPolicy::ByDeviceClass => HostPtrMode::UseHostPtr,
            MemoryPolicy::AlwaysCopy => HostPtrMode::CopyHostPtr,
            MemoryPolicy::AlwaysUseHostPtr => HostPtrMode::UseHostPtr,
        }
    }
}

struct EnvironmentInner {
    platform: Arc<dyn Platform>,
    device: Arc<dyn Device>,
    context: Arc<dyn Context>,
    queue: Mutex<Option<Arc<dyn CommandQueue>>>,
    compile_flags: Vec<String>,
    memory_policy: MemoryPolicy,
}

/// A single addressable compute target.
///
/// Clones share the same context and queue. Equality and hashing use the
/// `(platform, device)` identity, so environments can key maps.
#[derive(Clone)]
pub struct ComputeEnvironment {
    inner: Arc<EnvironmentInner>,
}

impl ComputeEnvironment {
    /// Build an environment, creating a fresh context for `device`.
    pub fn new(
        platform: Arc<dyn Platform>,
        device: Arc<dyn Device>,
        compile_flags: Vec<String>,
        memory_policy: MemoryPolicy,
    ) -> Result<Self> {
        let context = device.create_context(&compile_flags)?;
        Ok(Self::with_context(
            platform,
            device,
            context,
            compile_flags,
            memory_policy,
        ))
    }

    /// Build an environment around an existing context.
    pub fn with_context(
        platform: Arc<dyn Platform>,
        device: Arc<dyn Device>,
        context: Arc<dyn Context>,
        compile_flags: Vec<String>,
        memory_policy: MemoryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                platform,
                device,
                context,
                queue: Mutex::new(None),
                compile_flags,
                memory_policy,
            }),
        }
    }

    /// Platform and device ids, unique within one driver.
    pub fn identity(&self) -> (PlatformId, DeviceId) {
        (self.inner.platform.id(), self.inner.device.id())
    }

    /// Platform of the device.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    /// The device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.inner.device
    }

    /// Execution context bound to the device.
    pub fn context(&self) -> &Arc<dyn Context> {
        &self.inner.context
    }

    /// Capabilities of the device.
    pub fn info(&self) -> &DeviceInfo {
        self.inner.device.info()
    }

    /// Hardware class of the device.
    pub fn device_class(&self) -> DeviceClass {
        self.info().class
    }

    /// Whether the device is a GPU.
    pub fn is_gpu(&self) -> bool {
        self.device_class() == DeviceClass::Gpu
    }

    /// Whether the device is a CPU.
    pub fn is_cpu(&self) -> bool {
        self.device_class() == DeviceClass::Cpu
    }

    /// Whether the device runs double-precision kernels.
    pub fn supports_double_precision(&self) -> bool {
        self.info().supports_double
    }

    /// Flags for kernel builds on this environment.
    pub fn compile_flags(&self) -> &[String] {
        &self.inner.compile_flags
    }

    /// Memory policy the environment was created with.
    pub fn memory_policy(&self) -> MemoryPolicy {
        self.inner.memory_policy
    }

    /// The environment's own command queue, created on first use.
    pub fn queue(&self) -> Result<Arc<dyn CommandQueue>> {
        let mut slot = self.inner.queue.lock();
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let queue = self.inner.context.create_queue()?;
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// A new, independent queue on this environment's context and device.
    pub fn new_queue(&self) -> Result<Arc<dyn CommandQueue>> {
        self.inner.context.create_queue()
    }

    /// Host-pointer mode resolved from the policy and the device class.
    pub fn host_ptr_mode(&self) -> HostPtrMode {
        self.inner.memory_policy.host_ptr_mode(self.device_class())
    }

    /// Flags for buffers kernels only read.
    pub fn read_only_flags(&self) -> MemFlags {
        MemFlags::new(MemAccess::ReadOnly, self.host_ptr_mode())
    }

    /// Flags for buffers kernels only write.
    pub fn write_only_flags(&self) -> MemFlags {
        MemFlags::new(MemAccess::WriteOnly, self.host_ptr_mode())
    }

    /// Flags for buffers kernels read and write.
    pub fn read_write_flags(&self) -> MemFlags {
        MemFlags::new(MemAccess::ReadWrite, self.host_ptr_mode())
    }
}

impl PartialEq for ComputeEnvironment {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ComputeEnvironment {}

impl Hash for ComputeEnvironment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for ComputeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = if self.is_gpu() { "GPU" } else { "CPU" };
        write!(
            f,
            "{} - {} ({})",
            class,
            self.info().name,
            self.inner.platform.name()
        )
    }
}

impl fmt::Debug for ComputeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (platform, device) = self.identity();
        f.debug_struct("ComputeEnvironment")
            .field("platform", &platform)
            .field("device", &device)
            .field("name", &self.info().name)
            .field("class", &self.device_class())
            .field("memory_policy", &self.inner.memory_policy)
            .finish()
    }
}
