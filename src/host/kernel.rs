//! Kernels for the host driver.
//!
//! A host kernel is a Rust closure invoked once per workgroup. The closure
//! sees the whole group at once and loops over its lanes itself, so a
//! local-memory reduction is written as consecutive phases over the lanes
//! rather than with barriers.

use super::memory::HostBuffer;
use crate::device::{BufferHandle, Device, DeviceBuffer, DeviceInfo, Kernel, LaunchInput, NdRange};
use crate::dtype::{DType, Element, ScalarValue};
use crate::error::{Error, Result};
use std::any::Any;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

/// Body of a host kernel, called once per workgroup.
pub type KernelFn = dyn Fn(&mut WorkGroup<'_>) -> Result<()> + Send + Sync;

/// A kernel for the host driver.
///
/// Its signature is fixed when it is built, so one kernel can be shared by
/// any number of processors.
pub struct HostKernel {
    name: String,
    body: Arc<KernelFn>,
    preferred_multiple: usize,
    arity: Option<usize>,
    scalar_dtypes: Option<Vec<Option<DType>>>,
}

impl HostKernel {
    /// A kernel called `name` running `body` per workgroup.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut WorkGroup<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
            preferred_multiple: 1,
            arity: None,
            scalar_dtypes: None,
        }
    }

    /// Workgroup-size multiple reported to the engine, capped per device.
    pub fn with_preferred_multiple(mut self, multiple: usize) -> Self {
        self.preferred_multiple = multiple.max(1);
        self
    }

    /// Number of positional parameters; launches with another count are rejected.
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Declare the scalar type of every parameter, `None` for buffers and
    /// local memory. Launches binding other inputs are rejected.
    pub fn with_scalar_arg_dtypes(mut self, dtypes: Vec<Option<DType>>) -> Self {
        self.scalar_dtypes = Some(dtypes);
        self
    }

    /// Check a launch before it is enqueued. Returns the rejection reason.
    pub(crate) fn validate(
        &self,
        inputs: &[LaunchInput],
        range: NdRange,
        info: &DeviceInfo,
    ) -> std::result::Result<(), String> {
        if range.local == 0 {
            return Err("local work size must be positive".into());
        }
        if range.global % range.local != 0 {
            return Err(format!(
                "global work size {} is not a multiple of local work size {}",
                range.global, range.local
            ));
        }
        if range.local > info.max_work_group_size {
            return Err(format!(
                "work group size {} exceeds device maximum {}",
                range.local, info.max_work_group_size
            ));
        }
        if let Some(arity) = self.arity {
            if arity != inputs.len() {
                return Err(format!(
                    "kernel takes {} arguments but {} were bound",
                    arity,
                    inputs.len()
                ));
            }
        }

        if let Some(declared) = self.scalar_dtypes.as_deref() {
            if declared.len() != inputs.len() {
                return Err(format!(
                    "{} scalar dtypes declared for {} arguments",
                    declared.len(),
                    inputs.len()
                ));
            }
            for (index, (dtype, input)) in declared.iter().zip(inputs).enumerate() {
                match (dtype, input) {
                    (Some(expected), LaunchInput::Scalar(value)) if value.dtype() != *expected => {
                        return Err(format!(
                            "argument {}: expected {} scalar, got {}",
                            index,
                            expected,
                            value.dtype()
                        ));
                    }
                    (Some(expected), LaunchInput::Buffer(_) | LaunchInput::Local { .. }) => {
                        return Err(format!(
                            "argument {}: expected {} scalar, got {}",
                            index,
                            expected,
                            input.kind()
                        ));
                    }
                    (None, LaunchInput::Scalar(_)) => {
                        return Err(format!(
                            "argument {}: scalar bound without a declared dtype",
                            index
                        ));
                    }
                    _ => {}
                }
            }
        }

        for (index, input) in inputs.iter().enumerate() {
            if let LaunchInput::Buffer(buffer) = input {
                if buffer.as_any().downcast_ref::<HostBuffer>().is_none() {
                    return Err(format!(
                        "argument {}: buffer belongs to another driver",
                        index
                    ));
                }
            }
        }
        Ok(())
    }

    /// Execute every workgroup of the launch in order.
    pub(crate) fn run(&self, inputs: &[LaunchInput], range: NdRange) -> Result<()> {
        let mut args: Vec<BoundArg> = inputs
            .iter()
            .map(|input| match input {
                LaunchInput::Buffer(buffer) => BoundArg::Buffer(Arc::clone(buffer)),
                LaunchInput::Scalar(value) => BoundArg::Scalar(*value),
                LaunchInput::Local { bytes } => BoundArg::Local(LocalScratch::new(*bytes)),
            })
            .collect();

        let num_groups = range.num_groups();
        let first_group = range.first_group();
        for group_id in 0..num_groups {
            for arg in args.iter_mut() {
                if let BoundArg::Local(scratch) = arg {
                    scratch.clear();
                }
            }
            let mut group = WorkGroup {
                group_id,
                first_group,
                num_groups,
                local_size: range.local,
                args: &mut args,
            };
            (self.body)(&mut group).map_err(|e| {
                Error::execution(format!("{} (group {}): {}", self.name, group_id, e))
            })?;
        }
        Ok(())
    }
}

impl Kernel for HostKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn preferred_work_group_size_multiple(&self, device: &dyn Device) -> Result<usize> {
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

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.name)
            .field("preferred_multiple", &self.preferred_multiple)
            .field("arity", &self.arity)
            .field("scalar_dtypes", &self.scalar_dtypes)
            .finish_non_exhaustive()
    }
}

enum BoundArg {
    Buffer(DeviceBuffer),
    Scalar(ScalarValue),
    Local(LocalScratch),
}

/// Workgroup-local scratch, 8-byte aligned so any element type can view it.
struct LocalScratch {
    words: Vec<u64>,
    bytes: usize,
}

impl LocalScratch {
    fn new(bytes: usize) -> Self {
        Self {
            words: vec![0; bytes.div_ceil(8)],
            bytes,
        }
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

/// View of one workgroup handed to a host kernel body.
pub struct WorkGroup<'g> {
    group_id: usize,
    first_group: usize,
    num_groups: usize,
    local_size: usize,
    args: &'g mut [BoundArg],
}

impl<'g> WorkGroup<'g> {
    /// Index of this group within the launch. With one group per instance
    /// this is the instance index relative to the batch start, which is
    /// where per-instance buffers put the batch's first row.
    pub fn group_id(&self) -> usize {
        self.group_id
    }

    /// Index of this group across the whole division. Shared buffers hold
    /// every row, so this is the row a group owns in them.
    pub fn global_group_id(&self) -> usize {
        self.first_group + self.group_id
    }

    /// Groups in this launch.
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Lanes per group.
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    /// Work items in this launch.
    pub fn global_size(&self) -> usize {
        self.num_groups * self.local_size
    }

    /// Scalar argument `arg`.
    pub fn scalar(&self, arg: usize) -> Result<ScalarValue> {
        match self.args.get(arg) {
            Some(BoundArg::Scalar(value)) => Ok(*value),
            Some(_) => Err(Error::execution(format!("argument {} is not a scalar", arg))),
            None => Err(missing(arg)),
        }
    }

    /// Number of `T` elements in buffer argument `arg`.
    pub fn buffer_len<T: Element>(&self, arg: usize) -> Result<usize> {
        Ok(self.buffer(arg)?.len() / size_of::<T>())
    }

    /// `count` elements of buffer `arg` starting at element `offset`.
    pub fn load<T: Element>(&self, arg: usize, offset: usize, count: usize) -> Result<Vec<T>> {
        let size = size_of::<T>();
        let bytes = self.buffer(arg)?.load_bytes(offset * size, count * size)?;
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// Element `index` of buffer `arg`.
    pub fn load_one<T: Element>(&self, arg: usize, index: usize) -> Result<T> {
        let size = size_of::<T>();
        let bytes = self.buffer(arg)?.load_bytes(index * size, size)?;
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Write `values` into buffer `arg` starting at element `offset`.
    pub fn store<T: Element>(&self, arg: usize, offset: usize, values: &[T]) -> Result<()> {
        let buffer = self.writable_buffer(arg)?;
        buffer.store_bytes(offset * size_of::<T>(), bytemuck::cast_slice(values))
    }

    /// Write `value` at element `index` of buffer `arg`.
    pub fn store_one<T: Element>(&self, arg: usize, index: usize, value: T) -> Result<()> {
        let buffer = self.writable_buffer(arg)?;
        buffer.store_bytes(index * size_of::<T>(), bytemuck::bytes_of(&value))
    }

    /// Local memory argument `arg` viewed as `T`, zeroed at group start.
    pub fn local<T: Element>(&mut self, arg: usize) -> Result<&mut [T]> {
        match self.args.get_mut(arg) {
            Some(BoundArg::Local(scratch)) => {
                let count = scratch.bytes / size_of::<T>();
                let view: &mut [T] = bytemuck::try_cast_slice_mut(&mut scratch.words)
                    .map_err(|e| Error::execution(format!("local memory view: {}", e)))?;
                Ok(&mut view[..count])
            }
            Some(_) => Err(Error::execution(format!(
                "argument {} is not local memory",
                arg
            ))),
            None => Err(missing(arg)),
        }
    }

    fn buffer(&self, arg: usize) -> Result<&HostBuffer> {
        match self.args.get(arg) {
            Some(BoundArg::Buffer(handle)) => handle
                .as_any()
                .downcast_ref::<HostBuffer>()
                .ok_or_else(|| Error::execution(format!("argument {} is not a host buffer", arg))),
            Some(_) => Err(Error::execution(format!("argument {} is not a buffer", arg))),
            None => Err(missing(arg)),
        }
    }

    fn writable_buffer(&self, arg: usize) -> Result<&HostBuffer> {
        let buffer = self.buffer(arg)?;
        if !buffer.flags().is_writable() {
            return Err(Error::execution(format!("argument {} is read-only", arg)));
        }
        Ok(buffer)
    }
}

impl fmt::Debug for WorkGroup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGroup")
            .field("group_id", &self.group_id)
            .field("first_group", &self.first_group)
            .field("num_groups", &self.num_groups)
            .field("local_size", &self.local_size)
            .field("args", &self.args.len())
            .finish()
    }
}

fn missing(arg: usize) -> Error {
    Error::execution(format!("no argument bound at position {}", arg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceClass, HostPtrMode, MemAccess, MemFlags};

    fn info(max_wg: usize) -> DeviceInfo {
        DeviceInfo {
            name: "test".into(),
            vendor: "test".into(),
            class: DeviceClass::Cpu,
            supports_double: true,
            compute_units: 1,
            max_work_group_size: max_wg,
            global_mem_bytes: 0,
            driver_version: "0".into(),
        }
    }

    fn buffer(access: MemAccess, len: usize) -> LaunchInput {
        let flags = MemFlags::new(access, HostPtrMode::CopyHostPtr);
        LaunchInput::Buffer(Arc::new(HostBuffer::allocate(flags, len, None).unwrap()))
    }

    #[test]
    fn test_validate_geometry() {
        let kernel = HostKernel::new("k", |_| Ok(()));
        assert!(kernel.validate(&[], NdRange::new(8, 1), &info(64)).is_ok());
        assert!(kernel.validate(&[], NdRange::new(8, 0), &info(64)).is_err());
        assert!(kernel.validate(&[], NdRange::new(10, 4), &info(64)).is_err());
        assert!(kernel.validate(&[], NdRange::new(128, 128), &info(64)).is_err());
    }

    #[test]
    fn test_validate_scalar_dtypes() {
        let kernel = HostKernel::new("k", |_| Ok(()))
            .with_scalar_arg_dtypes(vec![None, Some(DType::U32)]);
        assert_eq!(
            Kernel::scalar_arg_dtypes(&kernel),
            Some(&[None, Some(DType::U32)][..])
        );

        let good = vec![buffer(MemAccess::ReadOnly, 8), LaunchInput::Scalar(3u32.into())];
        assert!(kernel.validate(&good, NdRange::new(1, 1), &info(1)).is_ok());

        let wrong = vec![buffer(MemAccess::ReadOnly, 8), LaunchInput::Scalar(3.0f64.into())];
        let reason = kernel.validate(&wrong, NdRange::new(1, 1), &info(1)).unwrap_err();
        assert!(reason.contains("expected uint scalar"));
    }

    #[test]
    fn test_arity() {
        let kernel = HostKernel::new("k", |_| Ok(())).with_arity(2);
        assert!(kernel
            .validate(&[buffer(MemAccess::ReadOnly, 4)], NdRange::new(1, 1), &info(1))
            .is_err());

        let short = HostKernel::new("k", |_| Ok(())).with_scalar_arg_dtypes(vec![None]);
        let two = [buffer(MemAccess::ReadOnly, 4), buffer(MemAccess::ReadOnly, 4)];
        let reason = short.validate(&two, NdRange::new(1, 1), &info(1)).unwrap_err();
        assert!(reason.contains("1 scalar dtypes declared for 2 arguments"));
    }

    #[test]
    fn test_run_groups_and_local_memory() {
        // Each group sums its lane ids through local memory.
        let kernel = HostKernel::new("lane_sum", |group| {
            let lanes = group.local_size();
            {
                let scratch = group.local::<u32>(1)?;
                for (lane, slot) in scratch.iter_mut().enumerate().take(lanes) {
                    *slot = lane as u32;
                }
            }
            let total: u32 = group.local::<u32>(1)?.iter().sum();
            group.store_one(0, group.group_id(), total)
        });

        let out = buffer(MemAccess::WriteOnly, 3 * 4);
        let inputs = vec![out.clone(), LaunchInput::Local { bytes: 4 * 4 }];
        kernel.run(&inputs, NdRange::new(12, 4)).unwrap();

        let LaunchInput::Buffer(handle) = out else { unreachable!() };
        let host = handle.as_any().downcast_ref::<HostBuffer>().unwrap();
        let values: Vec<u32> = host
            .load_bytes(0, 12)
            .unwrap()
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(values, vec![6, 6, 6]);
    }

    fn u32_values(input: &LaunchInput) -> Vec<u32> {
        let LaunchInput::Buffer(handle) = input else { unreachable!() };
        let host = handle.as_any().downcast_ref::<HostBuffer>().unwrap();
        host.load_bytes(0, handle.len())
            .unwrap()
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn test_buffer_len_in_elements() {
        let kernel = HostKernel::new("len", |group| {
            let elements = group.buffer_len::<u32>(0)? as u32;
            let bytes = group.buffer_len::<u8>(0)? as u32;
            group.store(0, 0, &[elements, bytes])
        });
        let out = buffer(MemAccess::WriteOnly, 5 * 4);
        kernel.run(std::slice::from_ref(&out), NdRange::new(1, 1)).unwrap();
        assert_eq!(u32_values(&out), vec![5, 20, 0, 0, 0]);
    }

    #[test]
    fn test_global_group_id_follows_offset() {
        let kernel = HostKernel::new("ids", |group| {
            let id = group.global_group_id() as u32;
            group.store_one(0, id as usize, id + 100)
        });
        let out = buffer(MemAccess::WriteOnly, 6 * 4);
        let range = NdRange::new(6, 2).with_offset(6);
        kernel.run(std::slice::from_ref(&out), range).unwrap();
        assert_eq!(u32_values(&out), vec![0, 0, 0, 103, 104, 105]);
    }

    #[test]
    fn test_store_to_read_only_fails() {
        let kernel = HostKernel::new("bad", |group| group.store_one(0, 0, 1.0f32));
        let err = kernel
            .run(&[buffer(MemAccess::ReadOnly, 4)], NdRange::new(1, 1))
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_preferred_multiple_capped_by_device() {
        use crate::host::{HostDeviceConfig, HostDriver, HostPlatformConfig};
        use crate::device::Driver;

        let driver = HostDriver::new(vec![HostPlatformConfig::new("p")
            .with_device(HostDeviceConfig::gpu("g").max_work_group_size(16))]);
        let device = driver.platforms().unwrap()[0].devices().remove(0);

        let kernel = HostKernel::new("k", |_| Ok(())).with_preferred_multiple(32);
        assert_eq!(
            kernel.preferred_work_group_size_multiple(device.as_ref()).unwrap(),
            16
        );
    }
}
