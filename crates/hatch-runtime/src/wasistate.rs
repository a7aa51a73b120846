// Ported from microsoft/wassette (MIT License)
// Copyright (c) Microsoft Corporation.

use std::path::Path;

use wasmtime::component::ResourceTable;
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder, WasiCtxView, WasiView};
use wasmtime_wasi_http::{WasiHttpCtx, WasiHttpView};

/// Environment variable carrying the application's working directory.
pub const WORKING_DIR_ENV: &str = "HATCH_WORKING_DIR";

/// Per-invocation guest state.
///
/// A fresh `WasiState` backs every invocation (one request, or one lifespan
/// connection).
///
/// Deny-default:
/// - No filesystem preopens
/// - Only the working directory is passed in, as [`WORKING_DIR_ENV`]
/// - stderr is inherited so guest logs land next to the worker's
pub struct WasiState {
    ctx: WasiCtx,
    table: ResourceTable,
    http: WasiHttpCtx,
}

impl WasiView for WasiState {
    fn ctx(&mut self) -> WasiCtxView<'_> {
        WasiCtxView {
            ctx: &mut self.ctx,
            table: &mut self.table,
        }
    }
}

impl WasiHttpView for WasiState {
    fn ctx(&mut self) -> &mut WasiHttpCtx {
        &mut self.http
    }
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}

impl WasiState {
    pub fn new(working_dir: Option<&Path>) -> Self {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stderr();
        if let Some(dir) = working_dir {
            builder.env(WORKING_DIR_ENV, dir.to_string_lossy());
        }

        Self {
            ctx: builder.build(),
            table: ResourceTable::new(),
            http: WasiHttpCtx::new(),
        }
    }
}
