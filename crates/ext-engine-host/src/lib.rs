//! Host functions implementation for ext-engine.
//!
//! This crate provides the `env` functions guest extension modules import to
//! reach the state store, plus an in-memory store to run them against.
//!
//! # Interfaces
//!
//! - [`state_abi`]: Keys, values, reads and intents addressed by handle
//! - [`row_writer`]: Field writers shared by key builders and intents
//! - [`linker`]: Registration of every host function, WASI and `hostPanic`
//! - [`mem_state`]: In-memory [`ext_engine_core::ExtensionIo`]
//!
//! # Memory Protocol
//!
//! Guests pass strings and bytes as `(ptr, len)` pairs. Data going back to
//! the guest is copied into return buffers allocated with the guest's own
//! `malloc` and returned as `(addr << 32) | len`.

pub mod linker;
pub mod mem_state;
mod memory;
pub mod row_writer;
pub mod state_abi;

pub use linker::{create_linker, provide_extension_engine_factory, register_all};
pub use mem_state::{FieldValue, Fields, MemOperation, MemState, Record};
