//! Host arrays bound as device buffers.
//!
//! Copy bindings of writable rows are tracked until their results reach the
//! host. Rows belong to whichever binding claimed them last: binding rows
//! again retires every older binding of those rows and reads it back before
//! the new launch may touch them.

use super::Materialized;
use crate::device::{DeviceBuffer, Event, HostPtrMode, HostRegion, LaunchInput, MemAccess, MemFlags};
use crate::dtype::{DType, HostArray};
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use crate::scheduler::WorkBatch;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// A device buffer holding a copy of some host rows.
#[derive(Clone)]
struct Binding {
    environment: ComputeEnvironment,
    buffer: DeviceBuffer,
    /// Byte offset of the owned rows inside `buffer`.
    offset: usize,
    /// Host rows this binding owns.
    rows: HostRegion,
}

impl Binding {
    fn read_back(&self) -> Result<Event> {
        let queue = self.environment.queue()?;
        let read = queue.enqueue_read(&self.buffer, self.offset, self.rows.clone(), &[])?;
        queue.flush()?;
        Ok(read)
    }
}

#[derive(Default)]
struct BindingTable {
    bindings: Mutex<Vec<Binding>>,
    /// Read-backs of retired bindings with the rows they fill.
    retired: Mutex<Vec<(HostRegion, Event)>>,
}

impl BindingTable {
    /// Retire every binding that owns any of `rows`, start reading it back,
    /// and return the read-backs the next user of `rows` must wait for.
    fn claim(&self, rows: &HostRegion) -> Result<Vec<Event>> {
        let stale: Vec<Binding> = {
            let mut bindings = self.bindings.lock();
            let (stale, live): (Vec<Binding>, Vec<Binding>) =
                bindings.drain(..).partition(|b| b.rows.overlaps(rows));
            *bindings = live;
            stale
        };

        let mut retired = self.retired.lock();
        retired.retain(|(_, read)| !read.is_complete());
        for binding in stale {
            trace!(
                environment = %binding.environment,
                offset = binding.rows.offset,
                bytes = binding.rows.len,
                "retiring stale binding"
            );
            let read = binding.read_back()?;
            retired.push((binding.rows, read));
        }
        Ok(retired
            .iter()
            .filter(|(region, _)| region.overlaps(rows))
            .map(|(_, read)| read.clone())
            .collect())
    }

    fn record(&self, binding: Binding) {
        self.bindings.lock().push(binding);
    }

    /// Read every live binding back into host memory, blocking.
    ///
    /// Retired read-backs land first, so the newest binding of a row wins.
    fn sync(&self) -> Result<()> {
        let retired: Vec<Event> = self.retired.lock().drain(..).map(|(_, e)| e).collect();
        Event::wait_all(&retired)?;

        let bindings = self.bindings.lock().clone();
        let mut reads = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            reads.push(binding.read_back()?);
        }
        Event::wait_all(&reads)
    }

    fn len(&self) -> usize {
        self.bindings.lock().len()
    }
}

/// Host bytes one argument is bound to for one launch.
struct Placement {
    /// Bytes the device buffer mirrors.
    bound: HostRegion,
    /// Rows the launch owns, inside `bound`. Only these are read back.
    owned: HostRegion,
}

/// Bind `placement` on `env` with `flags`.
///
/// Host-pointer bindings alias the host storage directly. Copy bindings get
/// their own device memory, filled by an enqueued write when `upload` is set,
/// and are remembered for read-back when writable. Either way a writable
/// binding first claims its owned rows.
fn bind(
    env: &ComputeEnvironment,
    flags: MemFlags,
    placement: Placement,
    upload: bool,
    wait_for: &[Event],
    table: &BindingTable,
) -> Result<Materialized> {
    let Placement { bound, owned } = placement;
    let context = env.context();
    let mut ready = if flags.is_writable() {
        table.claim(&owned)?
    } else {
        Vec::new()
    };

    if flags.host == HostPtrMode::UseHostPtr {
        let buffer = context.create_buffer(flags, bound.len, Some(bound))?;
        return Ok(Materialized {
            input: LaunchInput::Buffer(buffer),
            ready,
        });
    }

    let buffer = context.create_buffer(flags, bound.len, None)?;
    if upload && bound.len > 0 {
        let queue = env.queue()?;
        let mut dependencies = wait_for.to_vec();
        dependencies.extend(ready.iter().cloned());
        ready.push(queue.enqueue_write(&buffer, 0, bound.clone(), &dependencies)?);
    }

    if flags.is_writable() {
        table.record(Binding {
            environment: env.clone(),
            buffer: Arc::clone(&buffer),
            offset: owned.offset - bound.offset,
            rows: owned,
        });
    }
    Ok(Materialized {
        input: LaunchInput::Buffer(buffer),
        ready,
    })
}

fn rows_region(array: &HostArray, batch: WorkBatch) -> Result<HostRegion> {
    if batch.end > array.nmr_rows() {
        return Err(Error::argument(format!(
            "batch {} exceeds the {} rows of the array",
            batch,
            array.nmr_rows()
        )));
    }
    let row = array.row_bytes();
    Ok(HostRegion {
        storage: Arc::clone(array.storage()),
        offset: batch.start * row,
        len: batch.len() * row,
    })
}

/// A host array the kernel reads, and may write when bound read-write.
///
/// Per-instance buffers (the default) bind only the rows of the launched
/// batch; shared buffers bind the whole array on every launch. A launch owns
/// the rows of its batch either way, and only those are read back from a
/// copy, so kernels writing a shared array must write their own rows only
/// (see [`crate::host::WorkGroup::global_group_id`]).
#[derive(Clone)]
pub struct InputBuffer {
    array: HostArray,
    access: MemAccess,
    shared: bool,
    bindings: Arc<BindingTable>,
}

impl InputBuffer {
    /// A read-only input.
    pub fn new(array: HostArray) -> Self {
        Self::with_access(array, MemAccess::ReadOnly)
    }

    /// An input the kernel may also write.
    pub fn read_write(array: HostArray) -> Self {
        Self::with_access(array, MemAccess::ReadWrite)
    }

    fn with_access(array: HostArray, access: MemAccess) -> Self {
        Self {
            array,
            access,
            shared: false,
            bindings: Arc::new(BindingTable::default()),
        }
    }

    /// Bind the whole array on every launch instead of per-batch rows.
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    /// Whether the whole array is bound on every launch.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Whether kernels only read the array.
    pub fn is_read_only(&self) -> bool {
        self.access == MemAccess::ReadOnly
    }

    /// Element type of the array.
    pub fn dtype(&self) -> DType {
        self.array.dtype()
    }

    pub(crate) fn materialize(
        &self,
        env: &ComputeEnvironment,
        batch: WorkBatch,
        wait_for: &[Event],
    ) -> Result<Materialized> {
        let owned = rows_region(&self.array, batch)?;
        let bound = if self.shared {
            rows_region(&self.array, WorkBatch::new(0, self.array.nmr_rows()))?
        } else {
            owned.clone()
        };
        let flags = match self.access {
            MemAccess::ReadOnly => env.read_only_flags(),
            _ => env.read_write_flags(),
        };

        trace!(
            environment = %env,
            %batch,
            bytes = bound.len,
            shared = self.shared,
            "binding input"
        );
        bind(
            env,
            flags,
            Placement { bound, owned },
            true,
            wait_for,
            &self.bindings,
        )
    }

    /// The host array, with every device copy of writable rows read back.
    ///
    /// Only meaningful after the owning processors have finished.
    pub fn data(&self) -> Result<HostArray> {
        self.bindings.sync()?;
        Ok(self.array.clone())
    }

    /// The host array as it is right now, without any read-back.
    pub fn host_array(&self) -> &HostArray {
        &self.array
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("array", &self.array)
            .field("access", &self.access)
            .field("shared", &self.shared)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

/// Kernel-written result storage with one row per instance.
#[derive(Clone)]
pub struct OutputBuffer {
    array: HostArray,
    bindings: Arc<BindingTable>,
}

impl OutputBuffer {
    /// Zero-initialised output of `shape`; the first axis is the instance axis.
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self {
            array: HostArray::zeros(dtype, shape),
            bindings: Arc::new(BindingTable::default()),
        }
    }

    /// Element type of the array.
    pub fn dtype(&self) -> DType {
        self.array.dtype()
    }

    /// Shape of the array; the first axis is the instance axis.
    pub fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    pub(crate) fn materialize(
        &self,
        env: &ComputeEnvironment,
        batch: WorkBatch,
        wait_for: &[Event],
    ) -> Result<Materialized> {
        let owned = rows_region(&self.array, batch)?;
        trace!(environment = %env, %batch, bytes = owned.len, "binding output");
        let placement = Placement {
            bound: owned.clone(),
            owned,
        };
        bind(
            env,
            env.write_only_flags(),
            placement,
            false,
            wait_for,
            &self.bindings,
        )
    }

    /// The results, read back from every device copy.
    ///
    /// Only meaningful after the owning processors have finished.
    pub fn data(&self) -> Result<HostArray> {
        self.bindings.sync()?;
        Ok(self.array.clone())
    }

    /// The host array as it is right now, without any read-back.
    pub fn host_array(&self) -> &HostArray {
        &self.array
    }
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("array", &self.array)
            .field("bindings", &self.bindings.len())
            .finish()
    }
}
