//! Locating devices and turning them into compute environments.

use crate::device::{Device, DeviceSelector, Driver, Platform, PlatformId};
use crate::environment::{ComputeEnvironment, MemoryPolicy};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many environments a discovery call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// The first eligible device of the first (or named) platform.
    Single,
    /// Every eligible device on every (or the named) platform.
    #[default]
    All,
}

/// What to discover and how to set each environment up.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Device classes to look for.
    pub selector: DeviceSelector,
    /// Only look on this platform.
    pub platform: Option<PlatformId>,
    /// Skip devices without double precision support.
    pub require_double_precision: bool,
    /// Use any device when the requested class has none.
    pub fallback_to_any: bool,
    /// One device or all of them.
    pub mode: DiscoveryMode,
    /// Flags stored on every environment for kernel builds.
    pub compile_flags: Vec<String>,
    /// Memory policy stored on every environment.
    pub memory_policy: MemoryPolicy,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            selector: DeviceSelector::All,
            platform: None,
            require_double_precision: true,
            fallback_to_any: false,
            mode: DiscoveryMode::All,
            compile_flags: Vec::new(),
            memory_policy: MemoryPolicy::default(),
        }
    }
}

impl DiscoveryOptions {
    /// First matching device only.
    pub fn single(selector: DeviceSelector) -> Self {
        Self {
            selector,
            mode: DiscoveryMode::Single,
            ..Self::default()
        }
    }

    /// Every matching device.
    pub fn all(selector: DeviceSelector) -> Self {
        Self {
            selector,
            mode: DiscoveryMode::All,
            ..Self::default()
        }
    }

    /// Only look on `platform`.
    pub fn on_platform(mut self, platform: PlatformId) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Skip devices without double precision support.
    pub fn require_double_precision(mut self, required: bool) -> Self {
        self.require_double_precision = required;
        self
    }

    /// Use any device when the requested class has none.
    pub fn fallback_to_any(mut self, fallback: bool) -> Self {
        self.fallback_to_any = fallback;
        self
    }

    /// Replace the compile flags.
    pub fn compile_flags(mut self, flags: Vec<String>) -> Self {
        self.compile_flags = flags;
        self
    }

    /// Replace the memory policy.
    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = policy;
        self
    }
}

/// Discovery over one driver.
#[derive(Debug)]
pub struct Discovery<'d> {
    driver: &'d dyn Driver,
}

impl<'d> Discovery<'d> {
    /// Discover through `driver`.
    pub fn new(driver: &'d dyn Driver) -> Self {
        Self { driver }
    }

    /// One environment on the first platform (or on `platform`).
    pub fn single_device(
        &self,
        selector: DeviceSelector,
        platform: Option<PlatformId>,
        require_double_precision: bool,
    ) -> Result<ComputeEnvironment> {
        let mut options =
            DiscoveryOptions::single(selector).require_double_precision(require_double_precision);
        options.platform = platform;
        let mut found = self.discover(&options)?;
        Ok(found.remove(0))
    }

    /// Every eligible environment, optionally limited to one platform.
    pub fn all_devices(
        &self,
        selector: DeviceSelector,
        platform: Option<PlatformId>,
        require_double_precision: bool,
    ) -> Result<Vec<ComputeEnvironment>> {
        let mut options =
            DiscoveryOptions::all(selector).require_double_precision(require_double_precision);
        options.platform = platform;
        self.discover(&options)
    }

    /// Run discovery. The result is never empty.
    pub fn discover(&self, options: &DiscoveryOptions) -> Result<Vec<ComputeEnvironment>> {
        let platforms = self.target_platforms(options)?;

        let mut candidates: Vec<(Arc<dyn Platform>, Arc<dyn Device>)> = platforms
            .iter()
            .flat_map(|p| {
                p.devices_of(options.selector)
                    .into_iter()
                    .map(move |d| (Arc::clone(p), d))
            })
            .collect();

        if candidates.is_empty() && options.selector.is_specific() {
            if !options.fallback_to_any {
                return Err(Error::NoMatchingDevice {
                    selector: options.selector.to_string(),
                    platform: options.platform.map(|p| p.to_string()),
                });
            }
            info!(
                selector = %options.selector,
                "no device of the requested type, falling back to any device"
            );
            candidates = platforms
                .iter()
                .flat_map(|p| p.devices().into_iter().map(move |d| (Arc::clone(p), d)))
                .collect();
        }

        let mut environments = Vec::new();
        for (platform, device) in candidates {
            if options.require_double_precision && !device.supports_double() {
                debug!(
                    device = %device.info().name,
                    "skipping device without double precision support"
                );
                continue;
            }

            let env = match ComputeEnvironment::new(
                Arc::clone(&platform),
                device,
                options.compile_flags.clone(),
                options.memory_policy,
            ) {
                Ok(env) => env,
                Err(e) => {
                    warn!(platform = platform.name(), error = %e, "skipping device");
                    continue;
                }
            };

            debug!(environment = %env, "environment created");
            environments.push(env);
            if options.mode == DiscoveryMode::Single {
                break;
            }
        }

        if environments.is_empty() {
            return Err(Error::no_suitable_device(format!(
                "no {} device{} could be used",
                options.selector,
                if options.require_double_precision {
                    " with double precision support"
                } else {
                    ""
                }
            )));
        }
        Ok(environments)
    }

    fn target_platforms(&self, options: &DiscoveryOptions) -> Result<Vec<Arc<dyn Platform>>> {
        let mut platforms = self.driver.platforms()?;

        match (options.platform, options.mode) {
            (Some(id), _) => {
                platforms.retain(|p| p.id() == id);
                if platforms.is_empty() {
                    return Err(Error::NoMatchingDevice {
                        selector: options.selector.to_string(),
                        platform: Some(id.to_string()),
                    });
                }
            }
            (None, DiscoveryMode::Single) => platforms.truncate(1),
            (None, DiscoveryMode::All) => {}
        }
        Ok(platforms)
    }
}
