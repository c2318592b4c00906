pub(crate) mod bindings;
mod engine;
mod loader;
pub(crate) mod memory;
mod module;

pub use engine::{create_engine, create_wasi_context};
pub use loader::{WasmModuleFactory, WasmRuntime};
pub use module::WasmContext;
