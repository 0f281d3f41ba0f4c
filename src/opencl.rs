//! OpenCL driver.
//!
//! Maps the driver seam onto the platforms, devices, contexts, in-order
//! command queues, programs and buffers of an OpenCL runtime through
//! `opencl3`. Memory flags become `CL_MEM_*` flags: copy bindings use
//! `CL_MEM_COPY_HOST_PTR` (or a plain allocation filled by an enqueued
//! write), host-pointer bindings use `CL_MEM_USE_HOST_PTR` over the host
//! array. Commands return events backed by `cl_event`s, and events passed as
//! dependencies become the wait list of the next command.
//!
//! Launches carry the batch's first work item as global offset, so
//! `get_group_id(0)` indexes per-instance buffers and
//! `get_global_id(0) / get_local_size(0)` indexes shared ones.
//!
//! # Feature Gate
//!
//! This module is only available when compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "opencl")]
//! # fn example() -> hetbatch::Result<()> {
//! use hetbatch::opencl::{build_kernel, OpenClDriver};
//! use hetbatch::prelude::*;
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(Arc::new(OpenClDriver::new()?), RuntimeConfig::build_default())?;
//! let source = "__kernel void square(__global const double* x, __global double* y) {
//!     size_t i = get_group_id(0);
//!     y[i] = x[i] * x[i];
//! }";
//! let kernels = runtime.compile_kernels(|env| build_kernel(env, source, "square", None))?;
//! # Ok(())
//! # }
//! ```

use crate::device::{
    BufferHandle, DeviceBuffer, DeviceClass, DeviceId, DeviceInfo, Driver, Event, EventStatus,
    HostPtrMode, HostRegion, LaunchInput, MemAccess, MemFlags, NativeEvent, NdRange, PlatformId,
};
use crate::dtype::{DType, ScalarValue, SharedBytes};
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU};
use opencl3::error_codes::ClError;
use opencl3::event::Event as ClEventHandle;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, ClMem, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_USE_HOST_PTR,
    CL_MEM_WRITE_ONLY,
};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_event, cl_int, cl_mem_flags, CL_NON_BLOCKING};
use parking_lot::Mutex;
use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// `CL_COMPLETE` execution status.
const COMMAND_COMPLETE: cl_int = 0;

/// Driver over every OpenCL platform of the machine.
#[derive(Debug)]
pub struct OpenClDriver {
    platforms: Vec<Arc<OpenClPlatform>>,
}

impl OpenClDriver {
    /// Enumerate platforms and devices and query their capabilities once.
    ///
    /// Devices whose info queries fail are skipped with a warning.
    pub fn new() -> Result<Self> {
        let platforms = get_platforms()
            .map_err(|e| Error::no_suitable_device(format!("no OpenCL platforms: {}", e)))?;

        let platforms = platforms
            .into_iter()
            .enumerate()
            .map(|(p, platform)| {
                let id = PlatformId(p as u32);
                let name = platform.name().unwrap_or_default().trim().to_string();
                let device_ids = platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_else(|e| {
                    warn!(platform = %name, error = %e, "failed to list OpenCL devices");
                    Vec::new()
                });
                let devices = device_ids
                    .into_iter()
                    .filter_map(|raw| match query_info(&Device::new(raw)) {
                        Ok(info) => Some(info),
                        Err(e) => {
                            warn!(platform = %name, error = %e, "skipping OpenCL device");
                            None
                        }
                    })
                    .enumerate()
                    .map(|(d, (raw, info))| {
                        Arc::new(OpenClDevice {
                            id: DeviceId(d as u32),
                            device: Device::new(raw),
                            info,
                        })
                    })
                    .collect();
                Arc::new(OpenClPlatform {
                    id,
                    vendor: platform.vendor().unwrap_or_default().trim().to_string(),
                    name,
                    devices,
                })
            })
            .collect();
        Ok(Self { platforms })
    }
}

fn query_info(device: &Device) -> std::result::Result<(cl_device_id, DeviceInfo), String> {
    let dev_type = device.dev_type().map_err(|e| e.to_string())?;
    let class = if dev_type & CL_DEVICE_TYPE_GPU != 0 {
        DeviceClass::Gpu
    } else if dev_type & CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else {
        DeviceClass::Other
    };
    let info = DeviceInfo {
        name: device.name().map_err(|e| e.to_string())?.trim().to_string(),
        vendor: device.vendor().unwrap_or_default().trim().to_string(),
        class,
        supports_double: device.double_fp_config().unwrap_or(0) != 0,
        compute_units: device.max_compute_units().unwrap_or(1) as usize,
        max_work_group_size: device.max_work_group_size().unwrap_or(1).max(1),
        global_mem_bytes: device.global_mem_size().unwrap_or(0),
        driver_version: device.driver_version().unwrap_or_default(),
    };
    Ok((device.id(), info))
}

impl Driver for OpenClDriver {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<Arc<dyn crate::device::Platform>>> {
        Ok(self
            .platforms
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn crate::device::Platform>)
            .collect())
    }
}

/// An OpenCL platform.
#[derive(Debug)]
pub struct OpenClPlatform {
    id: PlatformId,
    name: String,
    vendor: String,
    devices: Vec<Arc<OpenClDevice>>,
}

impl crate::device::Platform for OpenClPlatform {
    fn id(&self) -> PlatformId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn vendor(&self) -> &str {
        &self.vendor
    }

    fn devices(&self) -> Vec<Arc<dyn crate::device::Device>> {
        self.devices
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn crate::device::Device>)
            .collect()
    }
}

/// An OpenCL device.
pub struct OpenClDevice {
    id: DeviceId,
    device: Device,
    info: DeviceInfo,
}

// SAFETY: see `OpenClContext`.
unsafe impl Send for OpenClDevice {}
unsafe impl Sync for OpenClDevice {}

impl fmt::Debug for OpenClDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClDevice")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl crate::device::Device for OpenClDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_context(
        &self,
        compile_flags: &[String],
    ) -> Result<Arc<dyn crate::device::Context>> {
        let construction = |reason: String| Error::DeviceConstruction {
            device: self.info.name.clone(),
            reason,
        };
        let context = Context::from_device(&self.device).map_err(|e| construction(e.to_string()))?;
        debug!(device = %self.info.name, flags = ?compile_flags, "OpenCL context created");
        Ok(Arc::new(OpenClContext {
            context,
            device_id: self.id,
            raw_device: self.device.id(),
            info: self.info.clone(),
            compile_flags: compile_flags.join(" "),
        }))
    }
}

/// Context bound to one OpenCL device.
pub struct OpenClContext {
    context: Context,
    device_id: DeviceId,
    raw_device: cl_device_id,
    info: DeviceInfo,
    compile_flags: String,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue, kernel,
// and memory objects. The raw pointers in opencl3 types are opaque handles to the
// OpenCL runtime, which serializes access internally.
unsafe impl Send for OpenClContext {}
unsafe impl Sync for OpenClContext {}

impl fmt::Debug for OpenClContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClContext")
            .field("device", &self.info.name)
            .field("compile_flags", &self.compile_flags)
            .finish_non_exhaustive()
    }
}

impl OpenClContext {
    /// Compile `source` with the context's flags and create kernel `name`.
    ///
    /// `scalar_arg_dtypes` fixes the kernel's scalar signature; launches with
    /// other argument lists are rejected before anything is enqueued.
    pub fn build_kernel(
        &self,
        source: &str,
        name: &str,
        scalar_arg_dtypes: Option<Vec<Option<DType>>>,
    ) -> Result<Arc<dyn crate::device::Kernel>> {
        let build_error = |log: String| Error::KernelBuild {
            kernel: name.to_string(),
            log,
        };
        let program =
            Program::create_and_build_from_source(&self.context, source, &self.compile_flags)
                .map_err(build_error)?;
        let kernel = Kernel::create(&program, name).map_err(|e| build_error(e.to_string()))?;
        let num_args = kernel.num_args().map_err(|e| build_error(e.to_string()))? as usize;
        let preferred_multiple = kernel
            .get_work_group_size_multiple(self.raw_device)
            .map_err(|e| build_error(e.to_string()))?;

        debug!(
            kernel = name,
            device = %self.info.name,
            num_args,
            preferred_multiple,
            "OpenCL kernel built"
        );
        Ok(Arc::new(OpenClKernel {
            name: name.to_string(),
            kernel: Mutex::new(kernel),
            num_args,
            preferred_multiple: preferred_multiple.max(1),
            scalar_dtypes: scalar_arg_dtypes,
        }))
    }
}

/// Build kernel `name` from `source` for `env`, which must come from an
/// [`OpenClDriver`].
pub fn build_kernel(
    env: &ComputeEnvironment,
    source: &str,
    name: &str,
    scalar_arg_dtypes: Option<Vec<Option<DType>>>,
) -> Result<Arc<dyn crate::device::Kernel>> {
    env.context()
        .as_any()
        .downcast_ref::<OpenClContext>()
        .ok_or_else(|| Error::argument(format!("environment {} is not an OpenCL device", env)))?
        .build_kernel(source, name, scalar_arg_dtypes)
}

fn access_flags(access: MemAccess) -> cl_mem_flags {
    match access {
        MemAccess::ReadOnly => CL_MEM_READ_ONLY,
        MemAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        MemAccess::ReadWrite => CL_MEM_READ_WRITE,
    }
}

impl crate::device::Context for OpenClContext {
    fn create_queue(&self) -> Result<Arc<dyn crate::device::CommandQueue>> {
        // The OpenCL 1.2 entry point keeps macOS working.
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&self.context, 0)
            .map_err(|e| Error::queue(format!("{}: {}", self.info.name, e)))?;
        Ok(Arc::new(OpenClQueue {
            queue,
            device_id: self.device_id,
            info: self.info.clone(),
        }))
    }

    fn create_buffer(
        &self,
        flags: MemFlags,
        len: usize,
        host: Option<HostRegion>,
    ) -> Result<DeviceBuffer> {
        let host = host.filter(|region| region.len > 0);
        if let Some(region) = &host {
            if region.len != len {
                return Err(Error::argument(format!(
                    "host region of {} bytes for a buffer of {} bytes",
                    region.len, len
                )));
            }
        }

        let mut cl_flags = access_flags(flags.access);
        // OpenCL rejects zero-sized buffers; an empty binding still gets one byte.
        let alloc_len = len.max(1);
        let buffer = match &host {
            Some(region) => {
                cl_flags |= match flags.host {
                    HostPtrMode::UseHostPtr => CL_MEM_USE_HOST_PTR,
                    HostPtrMode::CopyHostPtr => CL_MEM_COPY_HOST_PTR,
                };
                let mut storage = region.storage.write();
                let bytes = storage
                    .get_mut(region.offset..region.offset + region.len)
                    .ok_or_else(|| Error::argument("host region exceeds its storage"))?;
                // SAFETY: `bytes` is valid for `len` bytes while the guard is held. A
                // USE_HOST_PTR buffer keeps using it afterwards; host arrays never resize
                // and the buffer keeps the storage alive.
                unsafe {
                    Buffer::<u8>::create(
                        &self.context,
                        cl_flags,
                        alloc_len,
                        bytes.as_mut_ptr() as *mut c_void,
                    )
                }
            }
            // SAFETY: no host pointer is passed.
            None => unsafe {
                Buffer::<u8>::create(&self.context, cl_flags, alloc_len, ptr::null_mut())
            },
        }
        .map_err(|e| Error::queue(format!("buffer allocation on {}: {}", self.info.name, e)))?;

        trace!(device = %self.info.name, len, flags = cl_flags, "OpenCL buffer created");
        let aliased = host
            .filter(|_| flags.uses_host_ptr())
            .map(|region| region.storage);
        Ok(Arc::new(OpenClBuffer {
            buffer: Mutex::new(buffer),
            len,
            flags,
            _host: aliased,
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An OpenCL memory object.
pub struct OpenClBuffer {
    buffer: Mutex<Buffer<u8>>,
    len: usize,
    flags: MemFlags,
    /// Host storage a `USE_HOST_PTR` buffer points into.
    _host: Option<SharedBytes>,
}

// SAFETY: see `OpenClContext`.
unsafe impl Send for OpenClBuffer {}
unsafe impl Sync for OpenClBuffer {}

impl fmt::Debug for OpenClBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClBuffer")
            .field("len", &self.len)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl BufferHandle for OpenClBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn flags(&self) -> MemFlags {
        self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A compiled OpenCL kernel.
///
/// Kernel arguments are state on the `cl_kernel`, so setting them and
/// enqueueing the launch happen under one lock.
pub struct OpenClKernel {
    name: String,
    kernel: Mutex<Kernel>,
    num_args: usize,
    preferred_multiple: usize,
    scalar_dtypes: Option<Vec<Option<DType>>>,
}

// SAFETY: see `OpenClContext`.
unsafe impl Send for OpenClKernel {}
unsafe impl Sync for OpenClKernel {}

impl fmt::Debug for OpenClKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClKernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .field("preferred_multiple", &self.preferred_multiple)
            .finish_non_exhaustive()
    }
}

impl crate::device::Kernel for OpenClKernel {
    fn name(&self) -> &str {
        &self.name
    }

    /// `CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE`, queried at build time
    /// for the context's device and capped by `device`.
    fn preferred_work_group_size_multiple(
        &self,
        device: &dyn crate::device::Device,
    ) -> Result<usize> {
        Ok(self
            .preferred_multiple
            .min(device.info().max_work_group_size)
            .max(1))
    }

    fn scalar_arg_dtypes(&self) -> Option<&[Option<DType>]> {
        self.scalar_dtypes.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Completion of one OpenCL command.
pub struct ClEvent {
    event: ClEventHandle,
    /// Host storage a non-blocking transfer reads from or writes into.
    _host: Option<SharedBytes>,
}

// SAFETY: see `OpenClContext`.
unsafe impl Send for ClEvent {}
unsafe impl Sync for ClEvent {}

impl ClEvent {
    fn raw(&self) -> cl_event {
        self.event.get()
    }
}

impl fmt::Debug for ClEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClEvent").finish_non_exhaustive()
    }
}

impl NativeEvent for ClEvent {
    fn wait(&self) -> std::result::Result<(), String> {
        self.event.wait().map_err(|e| e.to_string())?;
        match self.poll() {
            Some(EventStatus::Failed(reason)) => Err(reason),
            _ => Ok(()),
        }
    }

    fn poll(&self) -> Option<EventStatus> {
        match self.event.command_execution_status() {
            Ok(status) if status.0 == COMMAND_COMPLETE => Some(EventStatus::Complete),
            Ok(status) if status.0 < 0 => Some(EventStatus::Failed(format!(
                "command ended with status {}",
                status.0
            ))),
            Ok(_) => None,
            Err(e) => Some(EventStatus::Failed(e.to_string())),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-order OpenCL command queue.
pub struct OpenClQueue {
    queue: CommandQueue,
    device_id: DeviceId,
    info: DeviceInfo,
}

// SAFETY: see `OpenClContext`.
unsafe impl Send for OpenClQueue {}
unsafe impl Sync for OpenClQueue {}

impl fmt::Debug for OpenClQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClQueue")
            .field("device", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl OpenClQueue {
    /// `cl_event`s of `events`. Events from other drivers are waited on here.
    fn wait_list(&self, events: &[Event]) -> Result<Vec<cl_event>> {
        let mut raw = Vec::with_capacity(events.len());
        for event in events {
            let native = event.native();
            match native.as_deref().and_then(|n| n.as_any().downcast_ref::<ClEvent>()) {
                Some(cl) => raw.push(cl.raw()),
                None => event.wait()?,
            }
        }
        Ok(raw)
    }

    fn buffer<'b>(&self, buffer: &'b DeviceBuffer) -> Result<&'b OpenClBuffer> {
        buffer
            .as_any()
            .downcast_ref::<OpenClBuffer>()
            .ok_or_else(|| Error::argument("buffer was not created by the OpenCL driver"))
    }

    fn check_transfer(buffer: &OpenClBuffer, offset: usize, region: &HostRegion) -> Result<()> {
        if offset + region.len > buffer.len {
            return Err(Error::argument(format!(
                "transfer of {} bytes at offset {} exceeds buffer of {} bytes",
                region.len, offset, buffer.len
            )));
        }
        if region.offset + region.len > region.storage.read().len() {
            return Err(Error::argument("host region exceeds its storage"));
        }
        Ok(())
    }

    fn track(&self, label: &str, event: ClEventHandle, host: Option<SharedBytes>) -> Event {
        let tracked = Event::new(format!("{}:{}", self.info.name, label));
        tracked.set_status(EventStatus::Submitted);
        tracked.attach_native(Arc::new(ClEvent { event, _host: host }));
        tracked
    }

    fn set_scalar(
        kernel: &Kernel,
        index: u32,
        value: ScalarValue,
    ) -> std::result::Result<(), ClError> {
        // SAFETY: each value is a plain scalar matching its OpenCL type's size.
        unsafe {
            match value {
                ScalarValue::U8(v) => kernel.set_arg(index, &v),
                ScalarValue::I32(v) => kernel.set_arg(index, &v),
                ScalarValue::U32(v) => kernel.set_arg(index, &v),
                ScalarValue::I64(v) => kernel.set_arg(index, &v),
                ScalarValue::U64(v) => kernel.set_arg(index, &v),
                ScalarValue::F32(v) => kernel.set_arg(index, &v),
                ScalarValue::F64(v) => kernel.set_arg(index, &v),
            }
        }
    }
}

impl crate::device::CommandQueue for OpenClQueue {
    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        src: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event> {
        let target = self.buffer(buffer)?;
        Self::check_transfer(target, offset, &src)?;
        if src.len == 0 {
            return Ok(Event::complete("empty write"));
        }
        let wait_list = self.wait_list(wait_for)?;

        let data = src.storage.read().as_ptr();
        // SAFETY: the range was checked against the storage, host arrays never
        // resize, and the event keeps the storage alive until the copy is done.
        let event = unsafe {
            let bytes = std::slice::from_raw_parts(data.add(src.offset), src.len);
            self.queue.enqueue_write_buffer(
                &mut target.buffer.lock(),
                CL_NON_BLOCKING,
                offset,
                bytes,
                &wait_list,
            )
        }
        .map_err(|e| Error::queue(format!("write on {}: {}", self.info.name, e)))?;
        Ok(self.track("write", event, Some(src.storage)))
    }

    fn enqueue_read(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        dst: HostRegion,
        wait_for: &[Event],
    ) -> Result<Event> {
        let source = self.buffer(buffer)?;
        Self::check_transfer(source, offset, &dst)?;
        if dst.len == 0 {
            return Ok(Event::complete("empty read"));
        }
        let wait_list = self.wait_list(wait_for)?;

        let data = dst.storage.write().as_mut_ptr();
        // SAFETY: as for writes; the device is the only writer of the range
        // until the event completes.
        let event = unsafe {
            let bytes = std::slice::from_raw_parts_mut(data.add(dst.offset), dst.len);
            self.queue.enqueue_read_buffer(
                &source.buffer.lock(),
                CL_NON_BLOCKING,
                offset,
                bytes,
                &wait_list,
            )
        }
        .map_err(|e| Error::queue(format!("read on {}: {}", self.info.name, e)))?;
        Ok(self.track("read", event, Some(dst.storage)))
    }

    fn enqueue_kernel(
        &self,
        kernel: &Arc<dyn crate::device::Kernel>,
        inputs: Vec<LaunchInput>,
        range: NdRange,
        wait_for: &[Event],
    ) -> Result<Event> {
        let launch_error = |reason: String| Error::KernelLaunch {
            kernel: kernel.name().to_string(),
            environment: self.info.name.clone(),
            reason,
        };
        let cl_kernel = kernel
            .as_any()
            .downcast_ref::<OpenClKernel>()
            .ok_or_else(|| launch_error("kernel was not built for the OpenCL driver".into()))?;
        if inputs.len() != cl_kernel.num_args {
            return Err(launch_error(format!(
                "kernel takes {} arguments but {} were bound",
                cl_kernel.num_args,
                inputs.len()
            )));
        }
        if range.local == 0 || range.global % range.local != 0 {
            return Err(launch_error(format!(
                "global work size {} is not a multiple of local work size {}",
                range.global, range.local
            )));
        }
        if range.local > self.info.max_work_group_size {
            return Err(launch_error(format!(
                "work group size {} exceeds device maximum {}",
                range.local, self.info.max_work_group_size
            )));
        }
        let wait_list = self.wait_list(wait_for)?;

        let handle = cl_kernel.kernel.lock();
        for (index, input) in inputs.iter().enumerate() {
            let index = index as u32;
            let set = match input {
                LaunchInput::Buffer(buffer) => {
                    let buffer = self.buffer(buffer)?;
                    let mem = buffer.buffer.lock();
                    // SAFETY: a `cl_mem` handle is the argument a `__global` pointer takes.
                    unsafe { handle.set_arg(index, &mem.get()) }
                }
                LaunchInput::Scalar(value) => Self::set_scalar(&handle, index, *value),
                // SAFETY: local arguments only carry a size.
                LaunchInput::Local { bytes } => unsafe {
                    handle.set_arg_local_buffer(index, (*bytes).max(1))
                },
            };
            set.map_err(|e| launch_error(format!("argument {} ({}): {}", index, input.kind(), e)))?;
        }

        let global = [range.global];
        let local = [range.local];
        let offset = [range.offset];
        // SAFETY: the three arrays outlive the call and hold one dimension each.
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                handle.get(),
                1,
                offset.as_ptr(),
                global.as_ptr(),
                local.as_ptr(),
                &wait_list,
            )
        }
        .map_err(|e| launch_error(e.to_string()))?;
        drop(handle);

        trace!(kernel = kernel.name(), global = range.global, local = range.local, "enqueued");
        Ok(self.track(kernel.name(), event, None))
    }

    fn flush(&self) -> Result<()> {
        self.queue
            .flush()
            .map_err(|e| Error::queue(format!("flush on {}: {}", self.info.name, e)))
    }

    fn finish(&self) -> Result<()> {
        self.queue
            .finish()
            .map_err(|e| Error::queue(format!("finish on {}: {}", self.info.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::{InputBuffer, KernelArguments, OutputBuffer};
    use crate::config::RuntimeConfig;
    use crate::device::Driver as _;
    use crate::dtype::HostArray;
    use crate::environment::MemoryPolicy;
    use crate::runtime::Runtime;

    const SCALE: &str = "__kernel void scale(__global const float* x, float k, __global float* y) {
        size_t i = get_group_id(0);
        y[i] = x[i] * k;
    }";

    /// A runtime over every OpenCL device, or `None` on machines without one.
    fn runtime(policy: MemoryPolicy) -> Option<Runtime> {
        let driver = OpenClDriver::new().ok()?;
        let any = driver
            .platforms()
            .ok()?
            .iter()
            .any(|p| !p.devices().is_empty());
        if !any {
            return None;
        }
        let config = RuntimeConfig::builder()
            .require_double_precision(false)
            .memory_policy(policy)
            .build()
            .ok()?;
        Runtime::new(Arc::new(driver), config).ok()
    }

    #[test]
    fn test_access_flags() {
        assert_eq!(access_flags(MemAccess::ReadOnly), CL_MEM_READ_ONLY);
        assert_eq!(access_flags(MemAccess::WriteOnly), CL_MEM_WRITE_ONLY);
        assert_eq!(access_flags(MemAccess::ReadWrite), CL_MEM_READ_WRITE);
    }

    #[test]
    fn test_scale_on_every_device() {
        for policy in [MemoryPolicy::AlwaysCopy, MemoryPolicy::AlwaysUseHostPtr] {
            let Some(runtime) = runtime(policy) else {
                eprintln!("no OpenCL device, skipping");
                return;
            };
            let signature = Some(vec![None, Some(DType::F32), None]);
            let kernels = runtime
                .compile_kernels(|env| build_kernel(env, SCALE, "scale", signature.clone()))
                .unwrap();

            let x: Vec<f32> = (0..64).map(|v| v as f32).collect();
            let args = Arc::new(
                KernelArguments::new()
                    .with("x", InputBuffer::new(HostArray::from_slice(&x)))
                    .unwrap()
                    .with("k", ScalarValue::from(0.5f32))
                    .unwrap()
                    .with("y", OutputBuffer::new(DType::F32, vec![64]))
                    .unwrap(),
            );
            runtime.run(&kernels, Arc::clone(&args), 64).unwrap();

            let y = args.data("y").unwrap().to_vec::<f32>().unwrap();
            let expected: Vec<f32> = x.iter().map(|v| v * 0.5).collect();
            assert_eq!(y, expected, "{:?}", policy);
        }
    }

    #[test]
    fn test_preferred_multiple_from_work_group_info() {
        let Some(runtime) = runtime(MemoryPolicy::default()) else {
            return;
        };
        for env in runtime.environments() {
            let kernel = build_kernel(env, SCALE, "scale", None).unwrap();
            let multiple = kernel
                .preferred_work_group_size_multiple(env.device().as_ref())
                .unwrap();
            assert!(multiple >= 1);
            assert!(multiple <= env.info().max_work_group_size);
        }
    }

    #[test]
    fn test_build_failure_carries_log() {
        let Some(runtime) = runtime(MemoryPolicy::default()) else {
            return;
        };
        let env = &runtime.environments()[0];
        let err = build_kernel(env, "__kernel void broken( {", "broken", None).unwrap_err();
        assert!(matches!(err, Error::KernelBuild { .. }));
    }
}
