//! Error type shared by every module.

/// Result alias with [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong from discovery to read-back.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested device class/platform combination has no candidates.
    #[error("no devices of the specified type ({selector}) found{}", platform_suffix(.platform))]
    NoMatchingDevice {
        /// Selector that matched nothing.
        selector: String,
        /// Platform filter, if one was given.
        platform: Option<String>,
    },

    /// Candidates exist but none is usable (capabilities or context failures).
    #[error("no suitable compute device found: {0}")]
    NoSuitableDevice(String),

    /// A single device could not produce a context. Discovery skips these.
    #[error("failed to construct context for device {device}: {reason}")]
    DeviceConstruction {
        /// Device name.
        device: String,
        /// Driver message.
        reason: String,
    },

    /// The driver rejected a kernel launch.
    #[error("kernel launch failed for '{kernel}' on {environment}: {reason}")]
    KernelLaunch {
        /// Kernel name.
        kernel: String,
        /// Environment the launch targeted.
        environment: String,
        /// Why the driver refused.
        reason: String,
    },

    /// A driver could not build a kernel from source.
    #[error("failed to build kernel '{kernel}': {log}")]
    KernelBuild {
        /// Entry point that was requested.
        kernel: String,
        /// Compiler output.
        log: String,
    },

    /// A launched command failed while running on the device.
    #[error("execution failed: {0}")]
    KernelExecution(String),

    /// A load balancer returned batches that break the partition rules.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// A kernel map has no entry for an environment that got work.
    #[error("no compiled kernel registered for environment {0}")]
    MissingKernel(String),

    /// An argument does not fit the kernel, the batch or the array.
    #[error("invalid kernel argument: {0}")]
    InvalidArgument(String),

    /// A device selector string did not parse.
    #[error("invalid device selector '{0}', expected one of GPU, CPU, ALL")]
    InvalidSelector(String),

    /// A configuration value was rejected.
    #[error("config error: {0}")]
    Config(String),

    /// A command queue could not accept or run commands.
    #[error("queue error: {0}")]
    Queue(String),
}

fn platform_suffix(platform: &Option<String>) -> String {
    match platform {
        Some(p) => format!(" on platform {}", p),
        None => String::new(),
    }
}

impl Error {
    /// [`Error::NoSuitableDevice`] from a message.
    pub fn no_suitable_device<S: Into<String>>(msg: S) -> Self {
        Error::NoSuitableDevice(msg.into())
    }

    /// [`Error::KernelExecution`] from a message.
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Error::KernelExecution(msg.into())
    }

    /// [`Error::InvalidPartition`] from a message.
    pub fn partition<S: Into<String>>(msg: S) -> Self {
        Error::InvalidPartition(msg.into())
    }

    /// [`Error::InvalidArgument`] from a message.
    pub fn argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// [`Error::Config`] from a message.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// [`Error::Queue`] from a message.
    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Error::Queue(msg.into())
    }

    /// True for the two discovery failures that leave the caller without devices.
    pub fn is_discovery_failure(&self) -> bool {
        matches!(self, Error::NoMatchingDevice { .. } | Error::NoSuitableDevice(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_matching_device_message() {
        let err = Error::NoMatchingDevice {
            selector: "GPU".into(),
            platform: Some("host".into()),
        };
        assert_eq!(
            err.to_string(),
            "no devices of the specified type (GPU) found on platform host"
        );

        let err = Error::NoMatchingDevice {
            selector: "CPU".into(),
            platform: None,
        };
        assert_eq!(err.to_string(), "no devices of the specified type (CPU) found");
        assert!(err.is_discovery_failure());
    }

    #[test]
    fn test_helpers() {
        assert!(matches!(Error::config("x"), Error::Config(_)));
        assert!(!Error::queue("closed").is_discovery_failure());
    }
}
