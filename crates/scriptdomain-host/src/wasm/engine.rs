use anyhow::{Context, Result};
use wasmtime::{Config, Engine, OptLevel};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use crate::config::WasmConfig;

/// Create a configured Wasmtime engine for resource modules
pub fn create_engine(config: &WasmConfig) -> Result<Engine> {
    let mut engine_config = Config::new();

    // Scripts run synchronously on the host thread
    engine_config.async_support(false);

    if config.fuel_per_call.is_some() {
        engine_config.consume_fuel(true);
    }

    engine_config.cranelift_opt_level(if config.optimize {
        OptLevel::Speed
    } else {
        OptLevel::None
    });

    Engine::new(&engine_config).context("Failed to create Wasmtime engine")
}

/// Create the WASI context for one session
///
/// Without `wasi` enabled the context is empty and never linked.
pub fn create_wasi_context(config: &WasmConfig) -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();

    if !config.wasi {
        return Ok(builder.build_p1());
    }

    if config.inherit_stdio {
        builder.inherit_stdio();
    }

    if let Some(ref data_dir) = config.data_dir {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create script data directory {}", data_dir.display())
        })?;
        builder.preopened_dir(data_dir, "/data", DirPerms::all(), FilePerms::all())?;
    }

    Ok(builder.build_p1())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_with_fuel() {
        let config = WasmConfig {
            fuel_per_call: Some(10_000),
            ..WasmConfig::default()
        };
        assert!(create_engine(&config).is_ok());
    }

    #[test]
    fn test_wasi_data_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config = WasmConfig {
            wasi: true,
            data_dir: Some(data_dir.clone()),
            ..WasmConfig::default()
        };

        assert!(create_wasi_context(&config).is_ok());
        assert!(data_dir.is_dir());
    }
}
