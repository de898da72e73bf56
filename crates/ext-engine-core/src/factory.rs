//! Extension engine factory.
//!
//! The factory owns the shared Wasmtime engine, the host function linker and
//! a cache of compiled modules. It produces batches of independent
//! [`ExtensionEngine`]s for one application.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;
use wasmtime::Linker;

use crate::extension::ExtensionEngine;
use crate::instance::ModuleInstance;
use crate::metrics::{EngineMetrics, Metrics};
use crate::module::compute_hash;
use crate::store::{ExtensionContext, StoreSettings};
use crate::{CompiledModule, WasmEngine};
use ext_engine_common::{ExtEngineConfig, RuntimeError};

/// Where a module's code comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A `file://` URL of a `.wasm` binary or `.cwasm` artifact.
    Url(Url),
    /// An in-memory Wasm binary.
    Wasm(Arc<[u8]>),
    /// WebAssembly text.
    Wat(Arc<str>),
}

impl ModuleSource {
    fn cache_key(&self) -> String {
        match self {
            Self::Url(url) => url.to_string(),
            Self::Wasm(bytes) => format!("wasm:{}", compute_hash(bytes)),
            Self::Wat(text) => format!("wat:{}", compute_hash(text.as_bytes())),
        }
    }
}

/// A module to load into every engine.
#[derive(Debug, Clone)]
pub struct ExtensionModule {
    /// Package path extensions are addressed by.
    pub path: String,
    pub source: ModuleSource,
    /// Extension entry points the module exports.
    pub extension_names: Vec<String>,
}

impl ExtensionModule {
    /// Module loaded from a URL string.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse.
    pub fn from_url(
        path: impl Into<String>,
        url: &str,
        extension_names: Vec<String>,
    ) -> Result<Self, RuntimeError> {
        let url = Url::parse(url).map_err(|_| RuntimeError::UnsupportedUrl {
            url: url.to_string(),
        })?;
        Ok(Self {
            path: path.into(),
            source: ModuleSource::Url(url),
            extension_names,
        })
    }
}

/// Creates extension engines sharing compiled modules.
pub struct ExtensionEngineFactory {
    engine: WasmEngine,
    linker: Arc<Linker<ExtensionContext>>,
    metrics: Arc<Metrics>,
    vvm_name: String,
    compiled: DashMap<String, Arc<CompiledModule>>,
}

impl ExtensionEngineFactory {
    /// Create a factory.
    ///
    /// `linker` must already define every host import guest modules use.
    pub fn new(
        engine: WasmEngine,
        linker: Linker<ExtensionContext>,
        metrics: Arc<Metrics>,
        vvm_name: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            linker: Arc::new(linker),
            metrics,
            vvm_name: vvm_name.into(),
            compiled: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn vvm_name(&self) -> &str {
        &self.vvm_name
    }

    /// Create `num_engines` engines for `app`, each with every module loaded.
    ///
    /// Either all engines are created or none is.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any module fails
    /// to load, compile or instantiate.
    #[instrument(skip(self, modules, config), fields(modules = modules.len()))]
    pub fn new_engines(
        &self,
        app: &str,
        modules: &[ExtensionModule],
        config: &ExtEngineConfig,
        num_engines: usize,
    ) -> Result<Vec<ExtensionEngine>, RuntimeError> {
        let settings = Arc::new(StoreSettings::from_config(config)?);

        let compiled = modules
            .iter()
            .map(|module| self.load_module(&module.source))
            .collect::<Result<Vec<_>, _>>()?;

        let mut engines = Vec::with_capacity(num_engines);
        for _ in 0..num_engines {
            let metrics = EngineMetrics::new(&self.metrics, &self.vvm_name, app);
            let mut engine = ExtensionEngine::new(app, self.engine.clone(), config, metrics);

            for (module, code) in modules.iter().zip(&compiled) {
                let instance = ModuleInstance::new(
                    &self.engine,
                    &self.linker,
                    &module.path,
                    Arc::clone(code),
                    &module.extension_names,
                    Arc::clone(&settings),
                )?;
                engine.add_module(instance);
            }

            engines.push(engine);
        }

        info!(
            app,
            engines = engines.len(),
            memory_limit = settings.memory_limit,
            pooling = self.engine.is_pooling_enabled(),
            "Extension engines created"
        );

        Ok(engines)
    }

    /// Load a module, compiling it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or compiled.
    pub fn load_module(&self, source: &ModuleSource) -> Result<Arc<CompiledModule>, RuntimeError> {
        let key = source.cache_key();
        if let Some(module) = self.compiled.get(&key) {
            debug!(key = %key, "Module cache hit");
            return Ok(Arc::clone(module.value()));
        }

        let module = Arc::new(match source {
            ModuleSource::Url(url) => self.load_file(&module_path(url)?)?,
            ModuleSource::Wasm(bytes) => self.compile_cached(bytes)?,
            ModuleSource::Wat(text) => CompiledModule::from_wat(self.engine.inner(), text)?,
        });

        self.compiled.insert(key, Arc::clone(&module));
        Ok(module)
    }

    fn load_file(&self, path: &Path) -> Result<CompiledModule, RuntimeError> {
        if path.extension().is_some_and(|ext| ext == "cwasm") {
            return CompiledModule::from_precompiled(self.engine.inner(), path);
        }

        let bytes = std::fs::read(path)?;
        self.compile_cached(&bytes)
    }

    /// Compile bytes, going through the artifact directory when configured.
    fn compile_cached(&self, bytes: &[u8]) -> Result<CompiledModule, RuntimeError> {
        let Some(dir) = &self.engine.config().cache_dir else {
            return CompiledModule::from_bytes(self.engine.inner(), bytes);
        };

        let artifact = PathBuf::from(dir).join(format!("{}.cwasm", compute_hash(bytes)));
        if artifact.exists() {
            match CompiledModule::from_precompiled(self.engine.inner(), &artifact) {
                Ok(module) => return Ok(module),
                Err(e) => warn!(path = %artifact.display(), error = %e, "Ignoring stale artifact"),
            }
        }

        let module = CompiledModule::from_bytes(self.engine.inner(), bytes)?;
        std::fs::create_dir_all(dir)?;
        std::fs::write(&artifact, module.serialize()?)?;
        debug!(path = %artifact.display(), "Artifact written");

        Ok(module)
    }

    /// Number of compiled modules in the cache.
    pub fn cached_modules(&self) -> usize {
        self.compiled.len()
    }
}

impl std::fmt::Debug for ExtensionEngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEngineFactory")
            .field("engine", &self.engine)
            .field("vvm_name", &self.vvm_name)
            .field("cached_modules", &self.compiled.len())
            .finish_non_exhaustive()
    }
}

/// Local path of a `file://` URL with an empty or `localhost` host.
fn module_path(url: &Url) -> Result<PathBuf, RuntimeError> {
    let unsupported = || RuntimeError::UnsupportedUrl {
        url: url.to_string(),
    };

    if url.scheme() != "file" {
        return Err(unsupported());
    }
    match url.host_str() {
        None | Some("" | "localhost") => {}
        Some(_) => return Err(unsupported()),
    }

    url.to_file_path().map_err(|()| unsupported())
}
