//! Common types, errors, and configuration for ext-engine.
//!
//! This crate provides shared functionality used across the ext-engine workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engines, guests, and invocation limits
//! - Qualified names exchanged with guest code

pub mod config;
pub mod config_file;
pub mod error;
pub mod qname;

pub use config::{EngineConfig, ExtEngineConfig, ExtensionLimits, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{AbiError, RuntimeError, StateError};
pub use qname::{FullQName, QName};
