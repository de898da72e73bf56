//! Core Wasmtime runtime for ext-engine.
//!
//! This crate hosts guest extension modules and mediates their access to a
//! state store:
//! - [`WasmEngine`]: Configured Wasmtime engine with epoch ticker
//! - [`CompiledModule`]: Compiled WebAssembly module wrapper
//! - [`ExtensionEngineFactory`]: Creates batches of engines sharing compiled code
//! - [`ExtensionEngine`]: Runs extensions, recovers from guest memory overflow
//! - [`StateHandles`]: Per-invocation handle tables over an [`ExtensionIo`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               ExtensionEngineFactory                    │
//! │  - WasmEngine (shared, thread-safe)                     │
//! │  - Linker with host ABI and WASI                        │
//! │  - Compiled module cache                                │
//! └─────────────────────────────────────────────────────────┘
//!                            │ new_engines
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ExtensionEngine                        │
//! │  (One per worker, used from one thread at a time)       │
//! │  - Limits, auto recovery, metrics                       │
//! └─────────────────────────────────────────────────────────┘
//!                            │ one per package
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │      ModuleInstance: Store<ExtensionContext>            │
//! │  - Linear memory and return buffers                     │
//! │  - Handle tables bound to an ExtensionIo per invocation │
//! │  - Captured stdout                                      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
pub mod engine;
pub mod extension;
pub mod factory;
pub mod instance;
pub mod metrics;
pub mod module;
pub mod state;
pub mod store;

pub use allocator::{ReturnBuffers, pack_region, unpack_region};
pub use engine::WasmEngine;
pub use extension::ExtensionEngine;
pub use factory::{ExtensionEngineFactory, ExtensionModule, ModuleSource};
pub use instance::{GuestExports, ModuleInstance};
pub use metrics::{MetricSample, MetricValue, Metrics};
pub use module::CompiledModule;
pub use state::{
    ExtensionIo, NOT_FOUND, ReadCallback, RowReader, RowWriter, RowWriterRef, StateHandles,
    StateKey, StateKeyBuilder, StateValue, StateValueBuilder,
};
pub use store::{CapturedOutput, ExtensionContext, StoreSettings};
