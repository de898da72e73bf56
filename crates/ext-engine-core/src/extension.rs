//! Extension engine: invocation control, recovery and error classification.
//!
//! An [`ExtensionEngine`] holds one [`ModuleInstance`] per package and runs
//! extensions synchronously, one at a time. It is `Send` but not shared;
//! callers that need parallelism create several engines from one factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use wasmtime::{Trap, WasmBacktrace};

use crate::engine::NO_DEADLINE;
use crate::instance::ModuleInstance;
use crate::metrics::EngineMetrics;
use crate::state::ExtensionIo;
use crate::WasmEngine;
use ext_engine_common::{AbiError, ExtEngineConfig, ExtensionLimits, RuntimeError, StateError};

/// Why an invocation attempt failed.
enum InvokeFailure {
    /// Lookup failed before any guest code ran.
    Lookup(RuntimeError),
    /// The guest call failed.
    Guest(wasmtime::Error),
}

/// Extension engine hosting a set of modules.
pub struct ExtensionEngine {
    app: String,
    engine: WasmEngine,
    modules: HashMap<String, ModuleInstance>,
    limits: ExtensionLimits,
    auto_recover: bool,
    panic_prefix: String,
    alloc_frame_markers: Vec<String>,
    metrics: EngineMetrics,
}

impl ExtensionEngine {
    pub(crate) fn new(
        app: &str,
        engine: WasmEngine,
        config: &ExtEngineConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            app: app.to_string(),
            engine,
            modules: HashMap::new(),
            limits: ExtensionLimits::default(),
            auto_recover: true,
            panic_prefix: config.panic_prefix.clone(),
            alloc_frame_markers: config.alloc_frame_markers.clone(),
            metrics,
        }
    }

    pub(crate) fn add_module(&mut self, instance: ModuleInstance) {
        self.modules.insert(instance.package().to_string(), instance);
    }

    /// Application the engine was created for.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Package paths of the loaded modules.
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Set the limits applied to subsequent invocations.
    pub fn set_limits(&mut self, limits: ExtensionLimits) {
        if limits.execution_interval_ms.is_some() && !self.engine.is_epoch_enabled() {
            warn!("Execution interval set but epoch interruption is disabled");
        }
        if limits.max_fuel.is_some() && !self.engine.is_fuel_enabled() {
            warn!("Fuel limit set but fuel metering is disabled");
        }
        self.limits = limits;
    }

    /// Current invocation limits.
    pub fn limits(&self) -> &ExtensionLimits {
        &self.limits
    }

    /// Enable or disable instance replacement after memory overflow.
    ///
    /// Enabled by default.
    pub fn set_auto_recover(&mut self, enabled: bool) {
        self.auto_recover = enabled;
    }

    /// Invoke `extension` of `package` against `io`.
    ///
    /// A memory overflow replaces the module instance and retries once when
    /// auto recovery is enabled. Each attempt is counted separately.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The package or extension is unknown
    /// - The guest panics, traps or misuses the host ABI
    /// - The state bridge fails
    /// - The execution interval or fuel limit is exceeded
    #[instrument(skip(self, io), fields(app = %self.app))]
    pub fn invoke(
        &mut self,
        package: &str,
        extension: &str,
        io: Arc<dyn ExtensionIo>,
    ) -> Result<(), RuntimeError> {
        let mut result = self.invoke_once(package, extension, &io);

        if self.auto_recover {
            if let Err(InvokeFailure::Guest(err)) = &result {
                if self.is_memory_overflow(err) {
                    self.recover(package)?;
                    result = self.invoke_once(package, extension, &io);
                }
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(InvokeFailure::Lookup(err)) => Err(err),
            Err(InvokeFailure::Guest(err)) => Err(self.classify(package, err)),
        }
    }

    fn invoke_once(
        &mut self,
        package: &str,
        extension: &str,
        io: &Arc<dyn ExtensionIo>,
    ) -> Result<(), InvokeFailure> {
        let fuel_enabled = self.engine.is_fuel_enabled();
        let deadline = match self.limits.execution_interval() {
            Some(interval) if self.engine.is_epoch_enabled() => {
                Some(self.engine.deadline_ticks(interval))
            }
            _ => None,
        };
        let max_fuel = self.limits.max_fuel.unwrap_or(u64::MAX);

        let instance = self
            .modules
            .get_mut(package)
            .ok_or_else(|| InvokeFailure::Lookup(RuntimeError::undefined_package(package)))?;
        let func = instance.extension(extension).ok_or_else(|| {
            InvokeFailure::Lookup(RuntimeError::invalid_extension_name(extension))
        })?;

        let store = instance.store_mut();
        {
            let ctx = store.data_mut();
            ctx.state.bind(Arc::clone(io));
            ctx.buffers.reset();
            ctx.stdout().reset();
        }
        if let Some(ticks) = deadline {
            store.set_epoch_deadline(ticks);
        }
        if fuel_enabled {
            store.set_fuel(max_fuel).map_err(InvokeFailure::Guest)?;
        }

        let start = Instant::now();
        let result = func.call(&mut *store, ());
        let elapsed = start.elapsed();

        // Leave the store usable for diagnostics calls
        store.data_mut().state.release();
        if deadline.is_some() {
            store.set_epoch_deadline(NO_DEADLINE);
        }
        if fuel_enabled {
            store.set_fuel(u64::MAX).map_err(InvokeFailure::Guest)?;
        }

        self.metrics.invocations_total.increase(1.0);
        self.metrics
            .invocations_seconds
            .increase(elapsed.as_secs_f64());
        if result.is_err() {
            self.metrics.errors_total.increase(1.0);
        }

        debug!(
            package,
            extension,
            duration_us = elapsed.as_micros(),
            ok = result.is_ok(),
            "Extension invoked"
        );

        result.map_err(InvokeFailure::Guest)
    }

    fn recover(&mut self, package: &str) -> Result<(), RuntimeError> {
        let instance = self
            .modules
            .get_mut(package)
            .ok_or_else(|| RuntimeError::undefined_package(package))?;
        instance.reset()?;

        self.metrics.recovers_total.increase(1.0);
        info!("{}/{} engine recovered", self.app, package);
        Ok(())
    }

    /// Returns `true` if the failure came from the guest running out of memory.
    ///
    /// Limit traps and state errors are never overflows, whichever frame
    /// they were raised in.
    fn is_memory_overflow(&self, err: &wasmtime::Error) -> bool {
        if matches!(
            host_abi_error(err),
            Some(AbiError::GuestOutOfMemory { .. })
        ) {
            return true;
        }
        if is_state_error(err) {
            return false;
        }
        match err.downcast_ref::<Trap>() {
            Some(Trap::Interrupt | Trap::OutOfFuel) | None => return false,
            Some(_) => {}
        }

        let in_allocator = |name: &str| {
            self.alloc_frame_markers
                .iter()
                .any(|marker| name.contains(marker.as_str()))
        };

        if let Some(backtrace) = err.downcast_ref::<WasmBacktrace>() {
            if backtrace
                .frames()
                .iter()
                .any(|frame| frame.func_name().is_some_and(in_allocator))
            {
                return true;
            }
        }

        // Nested guest calls may carry the allocator frame only in the
        // rendered error chain
        in_allocator(&format!("{err:?}"))
    }

    fn classify(&self, package: &str, err: wasmtime::Error) -> RuntimeError {
        if let Some(trap) = err.downcast_ref::<Trap>() {
            match trap {
                Trap::Interrupt => {
                    return RuntimeError::DeadlineExceeded {
                        interval_ms: self.limits.execution_interval_ms.unwrap_or_default(),
                    };
                }
                Trap::OutOfFuel => return RuntimeError::FuelExhausted,
                _ => {
                    if let Some(message) = self.panic_text(package) {
                        return RuntimeError::GuestPanic { message };
                    }
                }
            }
        }

        if self.is_memory_overflow(&err) {
            return RuntimeError::MemoryOverflow {
                message: err.to_string(),
            };
        }

        match take_host_error(err) {
            Ok(host) => host,
            Err(err) => RuntimeError::trap(format!("{err:#}")),
        }
    }

    /// Captured stdout of the package if it starts with the panic prefix.
    fn panic_text(&self, package: &str) -> Option<String> {
        let output = self.modules.get(package)?.store().data().stdout().text();
        output
            .starts_with(&self.panic_prefix)
            .then(|| output.trim().to_string())
    }

    fn module_mut(&mut self, package: &str) -> Result<&mut ModuleInstance, RuntimeError> {
        self.modules
            .get_mut(package)
            .ok_or_else(|| RuntimeError::undefined_package(package))
    }

    /// Guest heap bytes in use by one module.
    pub fn heap_in_use(&mut self, package: &str) -> Result<u64, RuntimeError> {
        self.module_mut(package)?.heap_in_use()
    }

    /// Guest heap bytes one module obtained from the system.
    pub fn heap_sys(&mut self, package: &str) -> Result<u64, RuntimeError> {
        self.module_mut(package)?.heap_sys()
    }

    /// Guest allocations of one module.
    pub fn mallocs(&mut self, package: &str) -> Result<u64, RuntimeError> {
        self.module_mut(package)?.mallocs()
    }

    /// Guest deallocations of one module.
    pub fn frees(&mut self, package: &str) -> Result<u64, RuntimeError> {
        self.module_mut(package)?.frees()
    }

    /// Run the garbage collector of one module.
    pub fn gc(&mut self, package: &str) -> Result<(), RuntimeError> {
        self.module_mut(package)?.gc()
    }

    /// Number of return buffers one module has allocated.
    pub fn allocated_buffers(&self, package: &str) -> Result<usize, RuntimeError> {
        self.modules
            .get(package)
            .map(ModuleInstance::allocated_buffers)
            .ok_or_else(|| RuntimeError::undefined_package(package))
    }

    /// Release every module instance.
    pub fn close(mut self) {
        let modules = self.modules.len();
        self.modules.clear();
        debug!(app = %self.app, modules, "Extension engine closed");
    }
}

impl std::fmt::Debug for ExtensionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEngine")
            .field("app", &self.app)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .field("auto_recover", &self.auto_recover)
            .finish_non_exhaustive()
    }
}

/// ABI misuse raised by a host function, if that is what failed.
fn host_abi_error(err: &wasmtime::Error) -> Option<&AbiError> {
    err.downcast_ref::<AbiError>().or_else(|| {
        match err.downcast_ref::<RuntimeError>() {
            Some(RuntimeError::Abi(abi)) => Some(abi),
            _ => None,
        }
    })
}

/// Returns `true` if the state bridge raised the error.
fn is_state_error(err: &wasmtime::Error) -> bool {
    err.downcast_ref::<StateError>().is_some()
        || matches!(err.downcast_ref::<RuntimeError>(), Some(RuntimeError::State(_)))
}

/// Recover the error a host function returned, passing it through unchanged.
fn take_host_error(err: wasmtime::Error) -> Result<RuntimeError, wasmtime::Error> {
    let err = match err.downcast::<RuntimeError>() {
        Ok(host) => return Ok(host),
        Err(err) => err,
    };
    let err = match err.downcast::<AbiError>() {
        Ok(abi) => return Ok(abi.into()),
        Err(err) => err,
    };
    err.downcast::<StateError>().map(RuntimeError::from)
}
