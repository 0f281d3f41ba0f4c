//! The execution engine.
//!
//! A [`BatchProcessor`] launches one kernel over one batch of instances on one
//! environment. A [`MultiDeviceProcessor`] splits the whole instance range with
//! a load balancer and drives one batch processor per non-empty batch.

pub mod batch;
pub mod multi_device;

pub use batch::BatchProcessor;
pub use multi_device::MultiDeviceProcessor;

use crate::device::{Event, Kernel};
use crate::environment::ComputeEnvironment;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Completion event per environment of one `process` call.
pub type EventMap = HashMap<ComputeEnvironment, Event>;

/// Compiled kernel per environment.
pub type KernelMap = HashMap<ComputeEnvironment, Arc<dyn Kernel>>;

/// Launch geometry options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Size workgroups by the kernel's preferred multiple so it can reduce
    /// through local memory. Ignored when `local_size` is set.
    pub use_local_reduction: bool,
    /// Explicit workgroup size for every environment.
    pub local_size: Option<usize>,
}

impl LaunchOptions {
    /// Workgroups sized by each kernel's preferred multiple.
    pub fn with_local_reduction() -> Self {
        Self {
            use_local_reduction: true,
            local_size: None,
        }
    }

    /// One fixed workgroup size.
    pub fn with_local_size(local_size: usize) -> Self {
        Self {
            use_local_reduction: false,
            local_size: Some(local_size),
        }
    }
}

/// Something that launches kernels and can be synchronised.
pub trait Processor {
    /// Enqueue the work, after every event in `wait_for`.
    ///
    /// With `is_blocking` the call returns once the launched work completed.
    fn process(&self, is_blocking: bool, wait_for: Option<&EventMap>) -> Result<EventMap>;

    /// Submit enqueued work without waiting.
    fn flush(&self) -> Result<()>;

    /// Block until all enqueued work is done.
    fn finish(&self) -> Result<()>;
}

/// Flatten an optional event map into a wait list.
pub(crate) fn wait_list(wait_for: Option<&EventMap>) -> Vec<Event> {
    wait_for
        .map(|events| events.values().cloned().collect())
        .unwrap_or_default()
}
