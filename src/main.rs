//! Extension engine CLI entry point.
//!
//! Loads extension modules listed in a TOML file, seeds an in-memory state,
//! runs the configured invocations and prints the resulting state and
//! metrics as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ext_engine_common::config_file::SeedEntry;
use ext_engine_common::{ConfigFile, FullQName, QName};
use ext_engine_core::{ExtensionEngine, ExtensionModule, Metrics};
use ext_engine_host::{MemState, mem_state::fields_from_toml, provide_extension_engine_factory};

/// Run WebAssembly extensions against an in-memory state.
#[derive(Debug, Parser)]
#[command(name = "ext-engine", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(env = "EXT_ENGINE_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ext_engine=debug".into()),
        )
        .with(args.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting extension engine");

    let config = ConfigFile::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!(
        app = %config.app,
        modules = config.modules.len(),
        invocations = config.invocations.len(),
        "Configuration loaded"
    );

    let state = Arc::new(seed_state(&config.seed)?);
    let metrics = Arc::new(Metrics::new());

    let factory = provide_extension_engine_factory(
        &config.runtime.engine,
        &config.vvm_name,
        Arc::clone(&metrics),
    )?;

    let modules = config
        .modules
        .iter()
        .map(|entry| {
            ExtensionModule::from_url(entry.path.clone(), &entry.url, entry.extensions.clone())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut engines: Vec<Option<ExtensionEngine>> = factory
        .new_engines(
            &config.app,
            &modules,
            &config.runtime.extension,
            config.num_engines,
        )?
        .into_iter()
        .map(|mut engine| {
            engine.set_limits(config.runtime.limits.clone());
            Some(engine)
        })
        .collect();
    if let Some(Some(engine)) = engines.first() {
        let packages: Vec<&str> = engine.packages().collect();
        info!(engines = engines.len(), packages = ?packages, "Engines ready");
    }

    let mut failures = 0usize;
    for invocation in &config.invocations {
        let Some(slot) = engines.get_mut(invocation.engine) else {
            bail!(
                "invocation {}/{} targets engine {} of {}",
                invocation.package,
                invocation.extension,
                invocation.engine,
                config.num_engines
            );
        };
        let Some(mut engine) = slot.take() else {
            bail!("engine {} was lost by a failed task", invocation.engine);
        };

        let io = Arc::clone(&state);
        let package = invocation.package.clone();
        let extension = invocation.extension.clone();

        // WASI blocks on the tokio handle, so guests never run on a worker thread
        let (engine, result) = tokio::task::spawn_blocking(move || {
            let result = engine.invoke(&package, &extension, io);
            (engine, result)
        })
        .await?;
        *slot = Some(engine);

        match result {
            Ok(()) => {
                let applied = state.apply_intents();
                debug!(
                    package = %invocation.package,
                    extension = %invocation.extension,
                    applied,
                    "Invocation succeeded"
                );
            }
            Err(e) => {
                state.discard_intents();
                failures += 1;
                error!(
                    package = %invocation.package,
                    extension = %invocation.extension,
                    error = %e,
                    "Invocation failed"
                );
            }
        }
    }

    for engine in engines.into_iter().flatten() {
        engine.close();
    }

    let report = serde_json::json!({
        "records": state.records(),
        "metrics": metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failures > 0 {
        bail!("{failures} of {} invocations failed", config.invocations.len());
    }
    Ok(())
}

fn seed_state(seed: &[SeedEntry]) -> anyhow::Result<MemState> {
    let state = MemState::new();
    for entry in seed {
        let storage: QName = entry
            .storage
            .parse()
            .with_context(|| format!("Invalid seed storage {}", entry.storage))?;
        let entity = if entry.entity.is_empty() {
            None
        } else {
            Some(
                entry
                    .entity
                    .parse::<FullQName>()
                    .with_context(|| format!("Invalid seed entity {}", entry.entity))?,
            )
        };
        state.insert(
            storage,
            entity,
            fields_from_toml(&entry.key),
            fields_from_toml(&entry.value),
        );
    }
    Ok(state)
}
