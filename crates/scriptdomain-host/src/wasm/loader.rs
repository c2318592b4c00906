use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};
use wasmtime::{Engine, Module};

use super::engine::create_engine;
use super::module::WasmContext;
use crate::config::{RuntimeConfig, WasmConfig};
use crate::context::{ContextFactory, EmbeddedContext, HostBridge};
use crate::session::ResourceContext;

/// File extensions the loader accepts
const MODULE_EXTENSIONS: [&str; 2] = ["wasm", "wat"];

/// Compiles script modules and hands out factories for them
#[derive(Clone)]
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
}

impl WasmRuntime {
    pub fn new(config: WasmConfig) -> Result<Self> {
        Ok(Self {
            engine: create_engine(&config)?,
            config,
        })
    }

    /// Whether `path` names a module this runtime can load
    pub fn handles_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MODULE_EXTENSIONS.contains(&ext))
    }

    pub fn factory_from_file(&self, path: &Path) -> Result<WasmModuleFactory> {
        let module = Module::from_file(&self.engine, path)
            .with_context(|| format!("Failed to compile {}", path.display()))?;
        Ok(self.factory(module))
    }

    /// Compile a module from binary or text format
    pub fn factory_from_bytes(&self, bytes: impl AsRef<[u8]>) -> Result<WasmModuleFactory> {
        let module = Module::new(&self.engine, bytes).context("Failed to compile module")?;
        Ok(self.factory(module))
    }

    fn factory(&self, module: Module) -> WasmModuleFactory {
        WasmModuleFactory {
            engine: self.engine.clone(),
            module,
            config: self.config.clone(),
        }
    }

    /// Compile every enabled module in a directory
    ///
    /// Each file becomes one resource named after its file stem. Files that
    /// fail to compile are logged and skipped.
    pub fn load_dir(
        &self,
        dir: &Path,
        config: &RuntimeConfig,
    ) -> Vec<(ResourceContext, WasmModuleFactory)> {
        let mut loaded = Vec::new();

        if !dir.exists() {
            info!(
                target: "runtime::wasm",
                "Resource directory does not exist: {} (this is fine if no resources are being used)",
                dir.display()
            );
            return loaded;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    target: "runtime::wasm",
                    "Failed to read resource directory {}: {}",
                    dir.display(),
                    e
                );
                return loaded;
            }
        };

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.handles_file(path))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if !config.is_resource_enabled(name) {
                info!(
                    target: "runtime::wasm",
                    "Skipping disabled resource: {} from {}",
                    name,
                    path.display()
                );
                continue;
            }

            if loaded
                .iter()
                .any(|(resource, _): &(ResourceContext, _)| resource.name() == name)
            {
                warn!(
                    target: "runtime::wasm",
                    "Skipping {}: resource {} is already loaded",
                    path.display(),
                    name
                );
                continue;
            }

            match self.factory_from_file(&path) {
                Ok(factory) => {
                    info!(target: "runtime::wasm", "Loaded resource: {} from {}", name, path.display());
                    loaded.push((ResourceContext::new(name).with_path(&path), factory));
                }
                Err(e) => {
                    warn!(
                        target: "runtime::wasm",
                        "Failed to load resource {}: {:#}",
                        path.display(),
                        e
                    );
                }
            }
        }

        if loaded.is_empty() {
            info!(target: "runtime::wasm", "No resources found in {}", dir.display());
        }

        loaded
    }
}

/// Builds a [`WasmContext`] for each session started from one module
#[derive(Clone)]
pub struct WasmModuleFactory {
    engine: Engine,
    module: Module,
    config: WasmConfig,
}

impl ContextFactory for WasmModuleFactory {
    fn create_context(&self, bridge: HostBridge) -> Result<Box<dyn EmbeddedContext>> {
        let context = WasmContext::instantiate(&self.engine, &self.module, &self.config, bridge)?;
        Ok(Box::new(context))
    }
}
