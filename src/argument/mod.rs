//! Kernel arguments.
//!
//! Every kernel parameter is one of four kinds. Each kind knows its scalar
//! signature and how to turn itself into a launch input for one environment,
//! workgroup size and batch.

mod buffer;
mod local;

pub use buffer::{InputBuffer, OutputBuffer};
pub use local::LocalMemory;

use crate::device::{Event, LaunchInput};
use crate::dtype::{DType, HostArray, ScalarValue};
use crate::environment::ComputeEnvironment;
use crate::error::{Error, Result};
use crate::scheduler::WorkBatch;

/// A launch input plus the events that must complete before the launch.
#[derive(Debug, Clone)]
pub struct Materialized {
    /// What the kernel parameter is bound to.
    pub input: LaunchInput,
    /// Uploads and earlier read-backs the launch depends on.
    pub ready: Vec<Event>,
}

/// One kernel parameter.
#[derive(Debug, Clone)]
pub enum KernelArgument {
    /// A host array the kernel reads, and may write.
    Input(InputBuffer),
    /// A host array the kernel writes.
    Output(OutputBuffer),
    /// A value passed by copy.
    Scalar(ScalarValue),
    /// Workgroup-local scratch.
    Local(LocalMemory),
}

impl KernelArgument {
    /// Scalar dtype per kernel parameter this argument occupies.
    pub fn scalar_arg_dtypes(&self) -> Vec<Option<DType>> {
        match self {
            KernelArgument::Scalar(value) => vec![Some(value.dtype())],
            KernelArgument::Input(_) | KernelArgument::Output(_) | KernelArgument::Local(_) => {
                vec![None]
            }
        }
    }

    /// Produce the launch input for `batch` on `env`.
    ///
    /// Uploads wait on `wait_for`.
    pub fn materialize(
        &self,
        env: &ComputeEnvironment,
        workgroup_size: usize,
        batch: WorkBatch,
        wait_for: &[Event],
    ) -> Result<Materialized> {
        match self {
            KernelArgument::Input(buffer) => buffer.materialize(env, batch, wait_for),
            KernelArgument::Output(buffer) => buffer.materialize(env, batch, wait_for),
            KernelArgument::Scalar(value) => Ok(Materialized {
                input: LaunchInput::Scalar(*value),
                ready: Vec::new(),
            }),
            KernelArgument::Local(local) => Ok(Materialized {
                input: LaunchInput::Local {
                    bytes: local.size_in_bytes(workgroup_size),
                },
                ready: Vec::new(),
            }),
        }
    }

    /// Host data of a buffer argument, read back from devices. `None` for
    /// scalars and local memory.
    pub fn data(&self) -> Result<Option<HostArray>> {
        match self {
            KernelArgument::Input(buffer) => buffer.data().map(Some),
            KernelArgument::Output(buffer) => buffer.data().map(Some),
            KernelArgument::Scalar(_) | KernelArgument::Local(_) => Ok(None),
        }
    }
}

impl From<InputBuffer> for KernelArgument {
    fn from(buffer: InputBuffer) -> Self {
        KernelArgument::Input(buffer)
    }
}

impl From<OutputBuffer> for KernelArgument {
    fn from(buffer: OutputBuffer) -> Self {
        KernelArgument::Output(buffer)
    }
}

impl From<ScalarValue> for KernelArgument {
    fn from(value: ScalarValue) -> Self {
        KernelArgument::Scalar(value)
    }
}

impl From<LocalMemory> for KernelArgument {
    fn from(local: LocalMemory) -> Self {
        KernelArgument::Local(local)
    }
}

/// Named kernel arguments in kernel parameter order.
#[derive(Debug, Clone, Default)]
pub struct KernelArguments {
    entries: Vec<(String, KernelArgument)>,
}

impl KernelArguments {
    /// An empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter. Names must be unique.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        argument: impl Into<KernelArgument>,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(Error::argument(format!("duplicate argument name '{}'", name)));
        }
        self.entries.push((name, argument.into()));
        Ok(())
    }

    /// Builder form of [`KernelArguments::insert`].
    pub fn with(
        mut self,
        name: impl Into<String>,
        argument: impl Into<KernelArgument>,
    ) -> Result<Self> {
        self.insert(name, argument)?;
        Ok(self)
    }

    /// The argument called `name`.
    pub fn get(&self, name: &str) -> Option<&KernelArgument> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, argument)| argument)
    }

    /// Arguments with their names, in parameter order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KernelArgument)> {
        self.entries.iter().map(|(n, a)| (n.as_str(), a))
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Scalar signature of the whole parameter list.
    pub fn scalar_arg_dtypes(&self) -> Vec<Option<DType>> {
        self.entries
            .iter()
            .flat_map(|(_, argument)| argument.scalar_arg_dtypes())
            .collect()
    }

    /// Read back the buffer argument `name`.
    pub fn data(&self, name: &str) -> Result<HostArray> {
        let argument = self
            .get(name)
            .ok_or_else(|| Error::argument(format!("no argument named '{}'", name)))?;
        argument
            .data()?
            .ok_or_else(|| Error::argument(format!("argument '{}' is not a buffer", name)))
    }
}
