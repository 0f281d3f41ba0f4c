//! hetbatch - batch execution across heterogeneous compute devices
//!
//! Runs one pre-compiled kernel over N independent task instances, spread
//! across every suitable device of a host: discovery picks the devices, a
//! load balancer assigns each one a contiguous slice of the instances, and
//! the execution engine binds arguments and launches asynchronously.
//!
//! # Quick Start
//!
//! ```no_run
//! use hetbatch::prelude::*;
//! use std::sync::Arc;
//!
//! let driver: Arc<dyn Driver> = Arc::new(HostDriver::detect());
//! let runtime = Runtime::new(driver, RuntimeConfig::build_default()).unwrap();
//!
//! let kernels = runtime
//!     .compile_kernels(|_| {
//!         let kernel: Arc<dyn Kernel> = Arc::new(HostKernel::new("square", |group| {
//!             let i = group.group_id();
//!             let x: f64 = group.load_one(0, i)?;
//!             group.store_one(1, i, x * x)
//!         }));
//!         Ok(kernel)
//!     })
//!     .unwrap();
//!
//! let arguments = KernelArguments::new()
//!     .with("x", InputBuffer::new(HostArray::from_slice(&[1.0f64, 2.0, 3.0])))
//!     .unwrap()
//!     .with("y", OutputBuffer::new(DType::F64, vec![3]))
//!     .unwrap();
//! let arguments = Arc::new(arguments);
//!
//! runtime.run(&kernels, Arc::clone(&arguments), 3).unwrap();
//! let y = arguments.data("y").unwrap().to_vec::<f64>().unwrap();
//! assert_eq!(y, vec![1.0, 4.0, 9.0]);
//! ```
//!
//! # Features
//!
//! - **Capability-based discovery**: device class, platform and
//!   double-precision filtering
//! - **Pluggable load balancing**: contiguous, order-preserving partitions
//! - **Asynchronous launches**: per-environment completion events
//! - **Host driver**: emulated CPU/GPU devices running Rust kernels
//! - **OpenCL driver**: real devices through `opencl3` (feature `opencl`)
//! - **Telemetry**: launch counters and latency histograms (optional)

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod argument;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dtype;
pub mod environment;
pub mod error;
pub mod executor;
pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod prelude;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;

pub use argument::{InputBuffer, KernelArgument, KernelArguments, LocalMemory, OutputBuffer};
pub use config::{BalancerPolicy, ConfigBuilder, RuntimeConfig};
pub use device::{DeviceClass, DeviceSelector, Event, EventStatus};
pub use discovery::{Discovery, DiscoveryMode, DiscoveryOptions};
pub use dtype::{DType, Element, HostArray, ScalarValue};
pub use environment::{ComputeEnvironment, MemoryPolicy};
pub use error::{Error, Result};
pub use executor::{
    BatchProcessor, EventMap, KernelMap, LaunchOptions, MultiDeviceProcessor, Processor,
};
pub use runtime::Runtime;
pub use scheduler::{LoadBalancer, WorkBatch};
