//! Module instance lifecycle management.
//!
//! A [`ModuleInstance`] is one instantiated extension module inside one
//! extension engine. It owns its store, so replacing the instance after a
//! memory overflow is just dropping the store and instantiating again:
//!
//! 1. Create a fresh store with the memory limiter installed
//! 2. Instantiate from the pre-linked module
//! 3. Resolve the required guest exports and the declared extensions
//! 4. Check the ABI version export
//! 5. Preallocate the first return buffer through guest `malloc`

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};
use wasmtime::{Instance, InstancePre, Linker, Memory, Store, TypedFunc};

use crate::store::{ExtensionContext, StoreSettings, create_store};
use crate::{CompiledModule, WasmEngine};
use ext_engine_common::{AbiError, RuntimeError};

/// Export the guest calls to announce the ABI it was built against.
pub const ABI_VERSION_EXPORT: &str = "WasmAbiVersion_0_0_1";

/// Names guest runtimes export themselves; extensions may not use them.
const RESERVED_NAMES: &[&str] = &[
    "alloc", "free", "calloc", "realloc", "malloc", "_start", "memory",
];

/// Prefix of the runtime exports of the guest SDK.
const RESERVED_PREFIX: &str = "Wasm";

/// Returns `true` if `name` collides with a guest runtime export.
pub fn is_reserved_extension_name(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || RESERVED_NAMES.contains(&name)
}

/// Guest exports every extension module must provide.
#[derive(Clone)]
pub struct GuestExports {
    pub memory: Memory,
    pub malloc: TypedFunc<u32, u32>,
    pub free: TypedFunc<u32, ()>,
    pub heap_in_use: TypedFunc<(), u64>,
    pub heap_sys: TypedFunc<(), u64>,
    pub mallocs: TypedFunc<(), u64>,
    pub frees: TypedFunc<(), u64>,
    pub gc: TypedFunc<(), ()>,
    pub on_read_value: TypedFunc<(u64, u64), ()>,
}

impl GuestExports {
    fn resolve(
        instance: &Instance,
        store: &mut Store<ExtensionContext>,
    ) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| missing("memory"))?;

        Ok(Self {
            memory,
            malloc: typed(instance, store, "malloc")?,
            free: typed(instance, store, "free")?,
            heap_in_use: typed(instance, store, "WasmGetHeapInuse")?,
            heap_sys: typed(instance, store, "WasmGetHeapSys")?,
            mallocs: typed(instance, store, "WasmGetMallocs")?,
            frees: typed(instance, store, "WasmGetFrees")?,
            gc: typed(instance, store, "WasmGC")?,
            on_read_value: typed(instance, store, "WasmOnReadValue")?,
        })
    }
}

fn missing(name: &str) -> RuntimeError {
    RuntimeError::MissingExport {
        name: name.to_string(),
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: &mut Store<ExtensionContext>,
    name: &str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|_| missing(name))
}

/// One extension module instantiated in its own store.
pub struct ModuleInstance {
    package: String,
    module: Arc<CompiledModule>,
    engine: WasmEngine,
    pre: InstancePre<ExtensionContext>,
    settings: Arc<StoreSettings>,
    store: Store<ExtensionContext>,
    guest: GuestExports,
    extensions: HashMap<String, TypedFunc<(), ()>>,
}

impl ModuleInstance {
    /// Instantiate `module` for `package`, exposing `extension_names`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An extension name is reserved or not exported
    /// - A required runtime export is missing
    /// - The ABI version check fails
    /// - The guest cannot allocate the first return buffer
    #[instrument(skip_all, fields(package = %package))]
    pub fn new(
        engine: &WasmEngine,
        linker: &Linker<ExtensionContext>,
        package: &str,
        module: Arc<CompiledModule>,
        extension_names: &[String],
        settings: Arc<StoreSettings>,
    ) -> Result<Self, RuntimeError> {
        for name in extension_names {
            if is_reserved_extension_name(name) {
                return Err(RuntimeError::IncorrectExtensionName { name: name.clone() });
            }
            if !module.exports_func(name) {
                return Err(missing(name));
            }
        }
        if !module.exports_func(ABI_VERSION_EXPORT) {
            return Err(RuntimeError::UnsupportedAbiVersion);
        }

        let pre = linker.instantiate_pre(module.inner()).map_err(|e| {
            RuntimeError::compilation_failed(format!("Failed to link {package}: {e}"))
        })?;

        let (store, guest, extensions) =
            Self::instantiate(engine, &pre, &settings, extension_names)?;

        debug!(extensions = extensions.len(), "Module instantiated");

        Ok(Self {
            package: package.to_string(),
            module,
            engine: engine.clone(),
            pre,
            settings,
            store,
            guest,
            extensions,
        })
    }

    fn instantiate(
        engine: &WasmEngine,
        pre: &InstancePre<ExtensionContext>,
        settings: &StoreSettings,
        extension_names: &[String],
    ) -> Result<
        (
            Store<ExtensionContext>,
            GuestExports,
            HashMap<String, TypedFunc<(), ()>>,
        ),
        RuntimeError,
    > {
        let mut store = create_store(engine, settings)?;

        let instance = pre.instantiate(&mut store).map_err(|e| {
            RuntimeError::compilation_failed(format!("Instantiation failed: {e}"))
        })?;

        let guest = GuestExports::resolve(&instance, &mut store)?;

        let mut extensions = HashMap::with_capacity(extension_names.len());
        for name in extension_names {
            extensions.insert(name.clone(), typed(&instance, &mut store, name)?);
        }

        let version: TypedFunc<(), ()> = typed(&instance, &mut store, ABI_VERSION_EXPORT)?;
        version
            .call(&mut store, ())
            .map_err(|_| RuntimeError::UnsupportedAbiVersion)?;

        store.data_mut().set_guest(guest.clone());

        let size = settings.preallocated_buffer_size;
        let addr = guest
            .malloc
            .call(&mut store, size)
            .map_err(|e| RuntimeError::MemoryOverflow {
                message: format!("preallocating {size} bytes: {e}"),
            })?;
        if addr == 0 {
            return Err(AbiError::GuestOutOfMemory { size }.into());
        }
        store.data_mut().buffers.push(addr, size);

        Ok((store, guest, extensions))
    }

    /// Replace the instance with a fresh one.
    ///
    /// Guest memory, return buffers and captured output are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation fails; the old instance is kept.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        let names: Vec<String> = self.extensions.keys().cloned().collect();
        let (store, guest, extensions) =
            Self::instantiate(&self.engine, &self.pre, &self.settings, &names)?;

        self.store = store;
        self.guest = guest;
        self.extensions = extensions;

        debug!(package = %self.package, "Module instance reset");
        Ok(())
    }

    /// Package path of the module.
    pub fn package(&self) -> &str {
        &self.package
    }

    /// The compiled module this instance runs.
    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    /// Look up a declared extension.
    pub fn extension(&self, name: &str) -> Option<TypedFunc<(), ()>> {
        self.extensions.get(name).cloned()
    }

    pub fn store(&self) -> &Store<ExtensionContext> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store<ExtensionContext> {
        &mut self.store
    }

    /// Guest heap bytes in use.
    pub fn heap_in_use(&mut self) -> Result<u64, RuntimeError> {
        self.call_stat(|guest| &guest.heap_in_use)
    }

    /// Guest heap bytes obtained from the system.
    pub fn heap_sys(&mut self) -> Result<u64, RuntimeError> {
        self.call_stat(|guest| &guest.heap_sys)
    }

    /// Number of guest allocations.
    pub fn mallocs(&mut self) -> Result<u64, RuntimeError> {
        self.call_stat(|guest| &guest.mallocs)
    }

    /// Number of guest deallocations.
    pub fn frees(&mut self) -> Result<u64, RuntimeError> {
        self.call_stat(|guest| &guest.frees)
    }

    /// Run the guest garbage collector.
    pub fn gc(&mut self) -> Result<(), RuntimeError> {
        self.guest
            .gc
            .call(&mut self.store, ())
            .map_err(|e| RuntimeError::trap(e.to_string()))
    }

    /// Number of return buffers allocated in guest memory.
    pub fn allocated_buffers(&self) -> usize {
        self.store.data().buffers.len()
    }

    fn call_stat(
        &mut self,
        select: impl FnOnce(&GuestExports) -> &TypedFunc<(), u64>,
    ) -> Result<u64, RuntimeError> {
        select(&self.guest)
            .call(&mut self.store, ())
            .map_err(|e| RuntimeError::trap(e.to_string()))
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("package", &self.package)
            .field("module", &self.module)
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
