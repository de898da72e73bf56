//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared across all extension engines of a factory
//! - Optionally configured with the pooling allocator for fast re-instantiation
//! - Set up with epoch interruption (and optionally fuel) for invocation limits

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use ext_engine_common::{EngineConfig, RuntimeError};

/// Epoch deadline used while no execution interval applies.
pub(crate) const NO_DEADLINE: u64 = u64::MAX / 2;

/// Thread-safe WebAssembly engine wrapper.
///
/// This struct wraps a Wasmtime [`Engine`] configured for hosting extension
/// modules. The engine holds no per-instance state and is cheap to clone.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Epoch Interruption**: Enables wall-clock execution intervals. A
///   background thread advances the epoch every `epoch_tick_ms`.
/// - **Fuel Metering**: Optional deterministic CPU limiting
/// - **Pooling Allocator**: Optional, makes recovery re-instantiation cheap
///
/// # Example
///
/// ```ignore
/// use ext_engine_common::EngineConfig;
/// use ext_engine_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
    ticker: Option<Arc<EpochTicker>>,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be spawned
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        // Backtraces carry the frame names used to recognise allocator traps
        wasmtime_config.wasm_backtrace(true);

        if config.fuel_metering {
            wasmtime_config.consume_fuel(true);
        }

        if config.epoch_interruption {
            if config.epoch_tick_ms == 0 {
                return Err(RuntimeError::invalid_config("epoch_tick_ms must be positive"));
            }
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        let ticker = if config.epoch_interruption {
            let tick = Duration::from_millis(config.epoch_tick_ms);
            Some(Arc::new(EpochTicker::spawn(engine.clone(), tick)?))
        } else {
            None
        };

        info!(
            epoch_interruption = config.epoch_interruption,
            fuel_metering = config.fuel_metering,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
            ticker,
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        // Guest memory is bounded per store by the resource limiter; the
        // pool slot must fit the largest page count we accept.
        pooling.max_memory_size(usize::try_from(4u64 << 30).unwrap_or(usize::MAX));

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of epoch ticks covering `interval`, rounded up.
    pub fn deadline_ticks(&self, interval: Duration) -> u64 {
        let tick_ms = u128::from(self.config.epoch_tick_ms.max(1));
        let ticks = interval.as_millis().div_ceil(tick_ms).max(1);
        u64::try_from(ticks).unwrap_or(NO_DEADLINE).min(NO_DEADLINE)
    }

    /// Check if epoch interruption is enabled.
    pub fn is_epoch_enabled(&self) -> bool {
        self.ticker.is_some()
    }

    /// Check if fuel metering is enabled.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("fuel_metering", &self.config.fuel_metering)
            .finish_non_exhaustive()
    }
}

/// Background thread advancing the engine epoch at a fixed interval.
///
/// Stops when the last [`WasmEngine`] clone holding it is dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn spawn(engine: Engine, tick: Duration) -> Result<Self, RuntimeError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("ext-engine-epoch".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to spawn epoch ticker: {e}")))?;

        debug!(tick_ms = tick.as_millis(), "Epoch ticker started");

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Epoch ticker thread panicked");
            }
        }
    }
}
