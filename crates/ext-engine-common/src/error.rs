//! Error types for the extension engine.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors returned by the factory and engines
//! - [`AbiError`]: Misuse of the host function ABI by guest code
//! - [`StateError`]: Errors raised by the backing state store

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// an extension engine, from module loading to invocation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// WebAssembly compilation or instantiation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module URL uses a scheme or host the engine cannot load from.
    #[error("unsupported URL: {url}")]
    UnsupportedUrl {
        /// The rejected URL.
        url: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No module was loaded under the requested package path.
    #[error("undefined package: {package}")]
    UndefinedPackage {
        /// The package path that was looked up.
        package: String,
    },

    /// The extension is not declared by the package.
    #[error("invalid extension name: {name}")]
    InvalidExtensionName {
        /// The requested extension name.
        name: String,
    },

    /// The extension name collides with a name reserved by the guest runtime.
    #[error("incorrect extension name: {name}")]
    IncorrectExtensionName {
        /// The rejected extension name.
        name: String,
    },

    /// The guest module does not export a required function.
    #[error("missing exported function: {name}")]
    MissingExport {
        /// Name of the missing export.
        name: String,
    },

    /// The guest does not declare a compatible ABI version.
    #[error("unsupported WASM version")]
    UnsupportedAbiVersion,

    /// Invocation was interrupted by the execution interval limit.
    #[error("deadline exceeded after {interval_ms}ms")]
    DeadlineExceeded {
        /// The configured execution interval in milliseconds.
        interval_ms: u64,
    },

    /// Invocation exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The guest allocator could not obtain more linear memory.
    #[error("out of memory: {message}")]
    MemoryOverflow {
        /// Underlying failure reported by the virtual machine.
        message: String,
    },

    /// The guest panicked and printed its panic text before trapping.
    #[error("{message}")]
    GuestPanic {
        /// Captured panic text, prefix included.
        message: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// The guest misused the host function ABI.
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// The backing state store failed.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Misuse of the host function ABI.
///
/// Raised from inside host functions; the guest call is aborted and the
/// error surfaces as the invocation result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbiError {
    /// Key builder handle is out of range or stale.
    #[error("incorrect key builder")]
    IncorrectKeyBuilder,

    /// Key handle is out of range or stale.
    #[error("incorrect key")]
    IncorrectKey,

    /// Value handle is out of range or stale.
    #[error("incorrect value")]
    IncorrectValue,

    /// Intent handle is out of range or stale.
    #[error("incorrect intent")]
    IncorrectIntent,

    /// A `(pointer, length)` pair points outside guest memory.
    #[error("unable to read memory")]
    UnableToReadMemory,

    /// A return buffer lies outside guest memory.
    #[error("memory out of range")]
    MemoryOutOfRange,

    /// The guest allocator returned a null pointer.
    #[error("guest allocator returned null for {size} bytes")]
    GuestOutOfMemory {
        /// Requested buffer size.
        size: u32,
    },

    /// Row writer discriminator is neither key builder nor intent.
    #[error("invalid row writer kind: {kind}")]
    InvalidRowWriterKind {
        /// The received discriminator.
        kind: u32,
    },

    /// The key builder is being read and cannot be modified until the read
    /// returns.
    #[error("key builder is in use by a read")]
    KeyBuilderInUse,

    /// A string could not be parsed as a qualified name.
    #[error("convert error: string «{value}»")]
    InvalidQName {
        /// The offending string.
        value: String,
    },

    /// A host function was called while no state bridge is bound.
    #[error("no state bound to the invocation")]
    UnboundState,

    /// Host function called before guest exports were resolved.
    #[error("guest exports are not resolved")]
    MissingGuestExports,
}

/// Errors raised by the backing state store.
///
/// The engine adds no semantics to these; they are passed through verbatim.
#[derive(Error, Debug)]
pub enum StateError {
    /// The requested item does not exist.
    #[error("not exists")]
    NotExists,

    /// The field name is unknown for the item.
    #[error("name not found: {name}")]
    NameNotFound {
        /// The requested field name.
        name: String,
    },

    /// The field exists but holds a different type.
    #[error("type mismatch for field {name}")]
    TypeMismatch {
        /// The requested field name.
        name: String,
    },

    /// Indexed access beyond the end of an array value.
    #[error("index out of range: {index}")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
    },

    /// The storage is not provided by this state.
    #[error("unsupported storage: {storage}")]
    UnsupportedStorage {
        /// Storage qualified name.
        storage: String,
    },

    /// Storage I/O failed.
    #[error("{0}")]
    Io(String),

    /// Any other store-specific failure.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl RuntimeError {
    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `UndefinedPackage` error.
    pub fn undefined_package(package: impl Into<String>) -> Self {
        Self::UndefinedPackage {
            package: package.into(),
        }
    }

    /// Create a new `InvalidExtensionName` error.
    pub fn invalid_extension_name(name: impl Into<String>) -> Self {
        Self::InvalidExtensionName { name: name.into() }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Returns `true` if the invocation was cut off by the execution interval.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Returns `true` if the package or extension was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UndefinedPackage { .. } | Self::InvalidExtensionName { .. }
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            Self::FuelExhausted | Self::MemoryOverflow { .. } | Self::DeadlineExceeded { .. }
        )
    }
}

impl StateError {
    /// Create a new `Io` error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::undefined_package("github.com/company/pkg");
        assert_eq!(err.to_string(), "undefined package: github.com/company/pkg");

        let err = RuntimeError::GuestPanic {
            message: "panic: goodbye, world".into(),
        };
        assert_eq!(err.to_string(), "panic: goodbye, world");
    }

    #[test]
    fn test_abi_error_is_transparent() {
        let err: RuntimeError = AbiError::IncorrectKeyBuilder.into();
        assert_eq!(err.to_string(), "incorrect key builder");

        let err: RuntimeError = AbiError::InvalidQName {
            value: "foo".into(),
        }
        .into();
        assert_eq!(err.to_string(), "convert error: string «foo»");
    }

    #[test]
    fn test_state_error_passthrough() {
        let err: RuntimeError = StateError::io("test i/o error").into();
        assert_eq!(err.to_string(), "test i/o error");
        assert!(matches!(err, RuntimeError::State(StateError::Io(_))));
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::FuelExhausted.is_resource_limit());
        assert!(RuntimeError::DeadlineExceeded { interval_ms: 50 }.is_resource_limit());
        assert!(
            RuntimeError::MemoryOverflow {
                message: "alloc".into()
            }
            .is_resource_limit()
        );
        assert!(!RuntimeError::trap("unreachable").is_resource_limit());
    }

    #[test]
    fn test_is_not_found() {
        assert!(RuntimeError::undefined_package("pkg").is_not_found());
        assert!(RuntimeError::invalid_extension_name("ext").is_not_found());
        assert!(!RuntimeError::FuelExhausted.is_not_found());
        assert!(RuntimeError::DeadlineExceeded { interval_ms: 1 }.is_deadline_exceeded());
    }
}
