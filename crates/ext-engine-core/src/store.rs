//! Per-instance store data.
//!
//! This module provides:
//! - [`ExtensionContext`]: Store data accessible from host functions
//! - [`CapturedOutput`]: Bounded capture of guest standard output
//! - [`StoreSettings`]: Settings every store of an engine is created with

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{
    HostOutputStream, StdoutStream, StreamResult, Subscribe, WasiCtxBuilder,
};

use crate::allocator::ReturnBuffers;
use crate::engine::NO_DEADLINE;
use crate::instance::GuestExports;
use crate::state::StateHandles;
use crate::WasmEngine;
use ext_engine_common::{AbiError, ExtEngineConfig, RuntimeError};

/// Writes accepted per `check_write` call.
const WRITE_BUDGET: usize = 64 * 1024;

/// Settings shared by every store of one extension engine.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Linear memory limit in bytes.
    pub memory_limit: usize,
    pub preallocated_buffer_size: u32,
    pub buffer_growth_increment: u32,
    pub max_stdout_size: usize,
    pub panic_prefix: String,
}

impl StoreSettings {
    /// Derive store settings from the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory limit is invalid.
    pub fn from_config(config: &ExtEngineConfig) -> Result<Self, RuntimeError> {
        let memory_limit = usize::try_from(config.memory_limit_bytes()?)
            .map_err(|_| RuntimeError::invalid_config("memory limit exceeds address space"))?;

        Ok(Self {
            memory_limit,
            preallocated_buffer_size: config.preallocated_buffer_size,
            buffer_growth_increment: config.buffer_growth_increment.max(1),
            max_stdout_size: config.max_stdout_size,
            panic_prefix: config.panic_prefix.clone(),
        })
    }
}

/// Store data of one module instance.
///
/// Host functions reach it through [`wasmtime::Caller::data_mut`]. It outlives
/// individual invocations and is replaced together with the store on reset.
pub struct ExtensionContext {
    wasi: WasiP1Ctx,

    limits: StoreLimits,

    /// Handle tables of the current invocation.
    pub state: StateHandles,

    /// Return buffers allocated in guest memory.
    pub buffers: ReturnBuffers,

    stdout: CapturedOutput,

    panic_prefix: String,

    guest: Option<GuestExports>,
}

impl ExtensionContext {
    /// Create a context with WASI stdout redirected to a bounded buffer.
    pub fn new(settings: &StoreSettings) -> Self {
        let stdout = CapturedOutput::new(settings.max_stdout_size);

        let wasi = WasiCtxBuilder::new().stdout(stdout.clone()).build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(settings.memory_limit)
            .build();

        Self {
            wasi,
            limits,
            state: StateHandles::default(),
            buffers: ReturnBuffers::new(settings.buffer_growth_increment),
            stdout,
            panic_prefix: settings.panic_prefix.clone(),
            guest: None,
        }
    }

    /// WASI preview1 context, used when linking WASI imports.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Captured guest stdout.
    pub fn stdout(&self) -> &CapturedOutput {
        &self.stdout
    }

    /// Prefix the guest runtime prints before panic text.
    pub fn panic_prefix(&self) -> &str {
        &self.panic_prefix
    }

    /// Resolved guest exports.
    ///
    /// # Errors
    ///
    /// Fails while the instance is still being set up.
    pub fn guest(&self) -> Result<&GuestExports, AbiError> {
        self.guest.as_ref().ok_or(AbiError::MissingGuestExports)
    }

    pub(crate) fn set_guest(&mut self, guest: GuestExports) {
        self.guest = Some(guest);
    }
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("state", &self.state)
            .field("buffers", &self.buffers.len())
            .field("stdout_len", &self.stdout.len())
            .finish_non_exhaustive()
    }
}

/// Create a store for one module instance.
///
/// The store has the memory limiter installed, no epoch deadline and, with
/// fuel metering enabled, an unbounded fuel tank.
///
/// # Errors
///
/// Returns an error if fuel cannot be set.
pub fn create_store(
    engine: &WasmEngine,
    settings: &StoreSettings,
) -> Result<Store<ExtensionContext>, RuntimeError> {
    let mut store = Store::new(engine.inner(), ExtensionContext::new(settings));
    store.limiter(|ctx| &mut ctx.limits);

    if engine.is_epoch_enabled() {
        store.epoch_deadline_trap();
        store.set_epoch_deadline(NO_DEADLINE);
    }

    if engine.is_fuel_enabled() {
        store
            .set_fuel(u64::MAX)
            .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    Ok(store)
}

/// Bounded, resettable capture of guest standard output.
///
/// Writes beyond the limit are silently dropped; the guest never sees an
/// error for them.
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
    limit: usize,
}

impl CapturedOutput {
    /// Create an empty capture holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    /// Append bytes, truncating at the limit.
    pub fn append(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock();
        let room = self.limit.saturating_sub(buffer.len());
        buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Discard captured output.
    pub fn reset(&self) {
        self.buffer.lock().clear();
    }

    /// Captured output decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

impl StdoutStream for CapturedOutput {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

impl HostOutputStream for CapturedOutput {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.append(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_BUDGET)
    }
}

#[async_trait::async_trait]
impl Subscribe for CapturedOutput {
    async fn ready(&mut self) {}
}
