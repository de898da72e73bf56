//! Host function registration for Wasmtime linkers.
//!
//! This module provides functions to register host functions on Wasmtime linkers,
//! enabling guest extension modules to call into the host runtime.

use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{Caller, Linker, Trap};

use ext_engine_common::{EngineConfig, RuntimeError};
use ext_engine_core::{ExtensionContext, ExtensionEngineFactory, Metrics, WasmEngine};

use crate::memory::read_str;
use crate::row_writer::register_row_writer;
use crate::state_abi::{HOST_MODULE, register_state_abi};

/// Register all host functions on a core module linker.
///
/// This registers:
/// - The state ABI (`hostGetKey`, `hostReadValues`, value readers, ...)
/// - Row writers shared by key builders and intents
/// - `hostPanic`
/// - WASI preview 1, with stdout captured per store
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<ExtensionContext>) -> Result<(), RuntimeError> {
    register_state_abi(linker)?;
    register_row_writer(linker)?;
    register_panic(linker)?;
    register_wasi(linker)?;
    Ok(())
}

/// Register WASI preview 1 imports.
///
/// Guests compiled for `wasip1` print through `fd_write`; their stdout lands
/// in the store's [`ext_engine_core::CapturedOutput`].
pub fn register_wasi(linker: &mut Linker<ExtensionContext>) -> Result<(), RuntimeError> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, ExtensionContext::wasi_mut)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register WASI: {e}")))
}

/// Register the panic host function.
///
/// Registers `env::hostPanic(ptr: u32, len: u32)`. The message replaces the
/// captured stdout, prefixed with the configured panic prefix, and the call
/// traps. The engine reports the stdout text as the guest panic.
pub fn register_panic(linker: &mut Linker<ExtensionContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            HOST_MODULE,
            "hostPanic",
            |caller: Caller<'_, ExtensionContext>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                let message = read_str(&caller, ptr, len)?;
                let ctx = caller.data();
                let stdout = ctx.stdout();
                stdout.reset();
                stdout.append(format!("{}{message}", ctx.panic_prefix()).as_bytes());

                debug!(message = %message, "Guest panicked");
                Err(Trap::UnreachableCodeReached.into())
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register hostPanic function: {e}"))
        })?;

    Ok(())
}

/// Create a linker with every host function registered.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn create_linker(engine: &WasmEngine) -> Result<Linker<ExtensionContext>, RuntimeError> {
    let mut linker = Linker::new(engine.inner());
    register_all(&mut linker)?;
    Ok(linker)
}

/// Build an extension engine factory with the full host ABI.
///
/// # Errors
///
/// Returns an error if the Wasmtime engine cannot be created or host
/// function registration fails.
pub fn provide_extension_engine_factory(
    config: &EngineConfig,
    vvm_name: &str,
    metrics: Arc<Metrics>,
) -> Result<ExtensionEngineFactory, RuntimeError> {
    let engine = WasmEngine::new(config)?;
    let linker = create_linker(&engine)?;

    info!(vvm = vvm_name, "Extension engine factory created");
    Ok(ExtensionEngineFactory::new(engine, linker, metrics, vvm_name))
}
