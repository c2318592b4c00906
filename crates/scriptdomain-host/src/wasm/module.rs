use anyhow::{Context, Result};
use scriptdomain_api::AsyncResultId;
use tracing::debug;
use wasmtime::{Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};

use super::bindings::{Bindings, add_host_imports};
use super::engine::create_wasi_context;
use crate::config::WasmConfig;
use crate::context::{ContextCapabilities, EmbeddedContext, HostBridge};
use crate::marshal::{CallMeta, EventCall, ExportCall, ExportReply, Payload, RefCall};
use crate::pending::AsyncResult;

/// Per-session store data
pub(crate) struct DomainState {
    bridge: HostBridge,
    /// Set once the instance's exports have been resolved
    bindings: Option<Bindings>,
    limits: StoreLimits,
    wasi: WasiP1Ctx,
}

impl DomainState {
    pub(crate) fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    pub(crate) fn bindings(&self) -> Option<&Bindings> {
        self.bindings.as_ref()
    }
}

/// One instantiated script module
pub struct WasmContext {
    store: Store<DomainState>,
    bindings: Bindings,
    fuel_per_call: Option<u64>,
}

impl WasmContext {
    /// Instantiate `module` for the session behind `bridge`
    ///
    /// Every required export is resolved here; a module missing one fails
    /// before any of its code runs.
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        config: &WasmConfig,
        bridge: HostBridge,
    ) -> Result<Self> {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(max) = config.max_memory_bytes {
            limits = limits.memory_size(max);
        }

        let state = DomainState {
            bridge,
            bindings: None,
            limits: limits.build(),
            wasi: create_wasi_context(config)?,
        };

        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel_per_call {
            store.set_fuel(fuel)?;
        }

        let mut linker = Linker::new(engine);
        add_host_imports(&mut linker)?;
        if config.wasi {
            preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)?;
        }

        let instance = linker
            .instantiate(&mut store, module)
            .context("Failed to instantiate script module")?;
        let bindings = Bindings::resolve(&mut store, &instance)?;
        store.data_mut().bindings = Some(bindings.clone());

        debug!(
            target: "runtime::wasm",
            "Instantiated module for {} (memory usage: {}, profiling: {})",
            store.data().bridge.resource_name(),
            bindings.has_memory_usage(),
            bindings.has_profiling()
        );

        Ok(Self {
            store,
            bindings,
            fuel_per_call: config.fuel_per_call,
        })
    }

    /// Give the next call its own fuel budget
    fn refuel(&mut self) -> Result<()> {
        if let Some(fuel) = self.fuel_per_call {
            self.store.set_fuel(fuel)?;
        }
        Ok(())
    }
}

impl EmbeddedContext for WasmContext {
    fn capabilities(&self) -> ContextCapabilities {
        let mut capabilities = ContextCapabilities::empty();
        if self.bindings.has_memory_usage() {
            capabilities |= ContextCapabilities::MEMORY_USAGE;
        }
        if self.bindings.has_profiling() {
            capabilities |= ContextCapabilities::PROFILING;
        }
        if self.bindings.has_async_result() {
            capabilities |= ContextCapabilities::ASYNC_RESULT;
        }
        capabilities
    }

    fn init(&mut self) -> Result<()> {
        self.refuel()?;
        self.bindings.init(&mut self.store).context("fx_init failed")
    }

    fn tick(&mut self, meta: CallMeta) -> Result<()> {
        self.refuel()?;
        self.bindings.tick(&mut self.store, meta)
    }

    fn trigger_event(&mut self, event: &EventCall<'_>) -> Result<bool> {
        self.refuel()?;
        self.bindings.trigger_event(&mut self.store, event)
    }

    fn call_ref(&mut self, call: &RefCall<'_>) -> Result<Payload> {
        self.refuel()?;
        self.bindings.call_ref(&mut self.store, call)
    }

    fn duplicate_ref(&mut self, engine_ref: i32) -> Result<i32> {
        self.refuel()?;
        self.bindings.duplicate_ref(&mut self.store, engine_ref)
    }

    fn remove_ref(&mut self, engine_ref: i32) -> Result<()> {
        self.refuel()?;
        self.bindings.remove_ref(&mut self.store, engine_ref)
    }

    fn invoke_export(&mut self, call: &ExportCall<'_>) -> Result<ExportReply> {
        self.refuel()?;
        self.bindings.invoke_export(&mut self.store, call)
    }

    fn memory_usage(&mut self) -> Result<i64> {
        self.refuel()?;
        self.bindings.memory_usage(&mut self.store)
    }

    fn start_profiling(&mut self) -> Result<()> {
        self.refuel()?;
        self.bindings.start_profiling(&mut self.store)
    }

    fn stop_profiling(&mut self) -> Result<()> {
        self.refuel()?;
        self.bindings.stop_profiling(&mut self.store)
    }

    fn async_result(&mut self, async_id: AsyncResultId, result: &AsyncResult) -> Result<()> {
        self.refuel()?;
        self.bindings.async_result(&mut self.store, async_id, result)
    }

    fn shutdown(&mut self) {
        self.store.data_mut().bindings = None;
        debug!(
            target: "runtime::wasm",
            "Released module for {}",
            self.store.data().bridge.resource_name()
        );
    }
}
