use crate::dtype::DType;
use std::fmt;
use std::sync::Arc;

type SizeFn = dyn Fn(usize) -> usize + Send + Sync;

/// Workgroup-local scratch memory, sized when the launch geometry is known.
#[derive(Clone)]
pub struct LocalMemory {
    dtype: DType,
    elements: Arc<SizeFn>,
}

impl LocalMemory {
    /// One element per work item.
    pub fn new(dtype: DType) -> Self {
        Self::per_item(dtype, 1)
    }

    /// `count` elements per work item.
    pub fn per_item(dtype: DType, count: usize) -> Self {
        Self::with_size(dtype, move |workgroup_size| workgroup_size * count)
    }

    /// Element count computed from the workgroup size by `elements`.
    pub fn with_size<F>(dtype: DType, elements: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        Self {
            dtype,
            elements: Arc::new(elements),
        }
    }

    /// Element type of the scratch.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Scratch bytes per workgroup of `workgroup_size` lanes.
    pub fn size_in_bytes(&self, workgroup_size: usize) -> usize {
        (self.elements)(workgroup_size) * self.dtype.size()
    }
}

impl fmt::Debug for LocalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMemory")
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}
