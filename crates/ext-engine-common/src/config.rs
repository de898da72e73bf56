//! Configuration structures for the extension engine.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, epochs, caching)
//! - [`ExtEngineConfig`]: Per-engine guest settings (memory, buffers, panics)
//! - [`ExtensionLimits`]: Per-invocation limits (execution interval, fuel)

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Size of a WebAssembly linear memory page in bytes.
pub const MEMORY_PAGE_SIZE: u64 = 0x10000;

/// Memory limit used when `memory_limit_pages` is zero.
pub const DEFAULT_MEMORY_LIMIT_PAGES: u32 = 0x100;

/// Largest accepted `memory_limit_pages`.
pub const MAX_MEMORY_PAGES: u32 = 0xffff;

/// Total memory must exceed the preallocated buffer by this factor.
const MEMORY_LIMIT_COEF: f64 = 1.7;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Guest-facing configuration for every extension engine.
    #[serde(default)]
    pub extension: ExtEngineConfig,

    /// Per-invocation limits.
    #[serde(default)]
    pub limits: ExtensionLimits,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine shared by all
/// extension engines of a factory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for fast re-instantiation on recovery.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Enable epoch-based interruption.
    ///
    /// Required for `ExtensionLimits::execution_interval` to take effect.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,

    /// Interval between epoch ticks in milliseconds.
    #[serde(default = "defaults::epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Enable fuel metering.
    ///
    /// Required for `ExtensionLimits::max_fuel` to take effect.
    #[serde(default)]
    pub fuel_metering: bool,

    /// Directory for precompiled module artifacts.
    ///
    /// When set, compiled modules are serialized to `{cache_dir}/{hash}.cwasm`
    /// and loaded from there on subsequent factory runs.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            epoch_interruption: defaults::epoch_interruption(),
            epoch_tick_ms: defaults::epoch_tick_ms(),
            fuel_metering: false,
            cache_dir: None,
        }
    }
}

/// Guest-facing configuration of an extension engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtEngineConfig {
    /// Linear memory limit in 64 KiB pages; zero selects the default.
    #[serde(default)]
    pub memory_limit_pages: u32,

    /// Size of the return buffer allocated right after instantiation.
    #[serde(default = "defaults::preallocated_buffer_size")]
    pub preallocated_buffer_size: u32,

    /// Minimum size of every additional return buffer.
    #[serde(default = "defaults::buffer_growth_increment")]
    pub buffer_growth_increment: u32,

    /// Captured guest stdout is truncated beyond this many bytes.
    #[serde(default = "defaults::max_stdout_size")]
    pub max_stdout_size: usize,

    /// Prefix the guest runtime prints before panic text.
    #[serde(default = "defaults::panic_prefix")]
    pub panic_prefix: String,

    /// Wasm backtrace frame names identifying the guest allocator.
    ///
    /// A trap raised inside one of these frames is treated as memory overflow.
    #[serde(default = "defaults::alloc_frame_markers")]
    pub alloc_frame_markers: Vec<String>,
}

impl Default for ExtEngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: 0,
            preallocated_buffer_size: defaults::preallocated_buffer_size(),
            buffer_growth_increment: defaults::buffer_growth_increment(),
            max_stdout_size: defaults::max_stdout_size(),
            panic_prefix: defaults::panic_prefix(),
            alloc_frame_markers: defaults::alloc_frame_markers(),
        }
    }
}

impl ExtEngineConfig {
    /// Effective memory limit in pages.
    pub fn effective_memory_pages(&self) -> u32 {
        if self.memory_limit_pages == 0 {
            DEFAULT_MEMORY_LIMIT_PAGES
        } else {
            self.memory_limit_pages
        }
    }

    /// Validate the configuration and return the memory limit in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the page count exceeds [`MAX_MEMORY_PAGES`] or the
    /// memory limit is not larger than 170% of the preallocated buffer.
    pub fn memory_limit_bytes(&self) -> Result<u64, RuntimeError> {
        let pages = self.effective_memory_pages();
        if pages > MAX_MEMORY_PAGES {
            return Err(RuntimeError::invalid_config(format!(
                "maximum allowed MemoryLimitPages is {MAX_MEMORY_PAGES:#x}"
            )));
        }

        if self.preallocated_buffer_size == 0 {
            return Err(RuntimeError::invalid_config(
                "preallocated buffer size must be positive",
            ));
        }

        let memory_limit = u64::from(pages) * MEMORY_PAGE_SIZE;
        let minimum = (f64::from(self.preallocated_buffer_size) * MEMORY_LIMIT_COEF).trunc();
        #[allow(clippy::cast_precision_loss)]
        let requested = memory_limit as f64;

        if requested <= minimum {
            return Err(RuntimeError::invalid_config(format!(
                "the minimum limit of memory is: {minimum:.1} bytes, requested limit is: {requested:.1}"
            )));
        }

        Ok(memory_limit)
    }
}

/// Per-invocation limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExtensionLimits {
    /// Wall-clock budget of one invocation in milliseconds; `None` is unbounded.
    #[serde(default)]
    pub execution_interval_ms: Option<u64>,

    /// Fuel budget of one invocation; `None` is unbounded.
    #[serde(default)]
    pub max_fuel: Option<u64>,
}

impl ExtensionLimits {
    /// Limits with the given execution interval.
    pub fn with_execution_interval(interval: Duration) -> Self {
        Self {
            execution_interval_ms: Some(u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)),
            max_fuel: None,
        }
    }

    /// Get the execution interval as a `Duration`.
    pub fn execution_interval(&self) -> Option<Duration> {
        self.execution_interval_ms.map(Duration::from_millis)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn epoch_tick_ms() -> u64 {
        1
    }

    pub const fn preallocated_buffer_size() -> u32 {
        64 * 1024
    }

    pub const fn buffer_growth_increment() -> u32 {
        64 * 1024
    }

    pub const fn max_stdout_size() -> usize {
        1024
    }

    pub fn panic_prefix() -> String {
        "panic: ".to_string()
    }

    pub fn alloc_frame_markers() -> Vec<String> {
        vec!["runtime.alloc".to_string()]
    }
}
