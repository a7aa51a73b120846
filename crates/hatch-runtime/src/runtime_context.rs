// Ported from microsoft/wassette (MIT License, with hatch-specific modifications)
// Copyright (c) Microsoft Corporation.

use std::path::Path;

use wasmtime::component::{Component, InstancePre, Linker};
use wasmtime::{Config, Engine, Store};

use crate::error::RuntimeError;
use crate::wasistate::WasiState;

/// Engine and linker shared by every module one [`WasmRuntime`](crate::WasmRuntime) loads.
///
/// The linker carries WASI p2 and WASI HTTP host functions. Stores are
/// never shared: each call to [`RuntimeContext::store`] starts a fresh guest.
pub struct RuntimeContext {
    pub engine: Engine,
    linker: Linker<WasiState>,
}

impl RuntimeContext {
    pub fn new() -> Result<Self, RuntimeError> {
        let mut config = Config::new();
        config.wasm_component_model(true);
        config.async_support(true);

        let engine = Engine::new(&config)?;
        let mut linker: Linker<WasiState> = Linker::new(&engine);
        wasmtime_wasi::p2::add_to_linker_async(&mut linker)?;
        wasmtime_wasi_http::add_only_http_to_linker_async(&mut linker)?;

        tracing::debug!("Guest engine ready (component model, async, WASI p2, WASI HTTP)");
        Ok(Self { engine, linker })
    }

    /// Resolve a component's imports once so later instantiation is cheap.
    pub fn prepare(&self, label: &str, component: &Component) -> Result<InstancePre<WasiState>, RuntimeError> {
        self.linker
            .instantiate_pre(component)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{label}: {e}")))
    }

    pub fn store(&self, working_dir: Option<&Path>) -> Store<WasiState> {
        Store::new(&self.engine, WasiState::new(working_dir))
    }
}
