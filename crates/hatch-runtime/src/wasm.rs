// Ported from microsoft/wassette (MIT License, with hatch-specific modifications)
// Copyright (c) Microsoft Corporation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use hatch_core::spec::absolute_dir;
use hatch_core::{ApplicationSpec, AsgiMessage, Scope};
use serde::Serialize;
use tokio::sync::RwLock;
use wasmtime::Store;
use wasmtime::component::{Func, InstancePre, Val};

use crate::error::RuntimeError;
use crate::guest::{
    GuestCall, GuestCallable, GuestChannel, GuestOutcome, GuestRuntime, SyncRequest, SyncResponse,
    convention_mismatch,
};
use crate::registry::{ModuleKey, ModuleRegistry};
use crate::runtime_context::RuntimeContext;
use crate::storage::ComponentStorage;
use crate::wasistate::WasiState;

/// A component that has been compiled and is ready for instantiation.
struct WasmModule {
    instance_pre: InstancePre<WasiState>,
}

/// Handle stored inside a [`GuestCallable`] produced by [`WasmRuntime`].
struct WasmExport {
    instance_pre: InstancePre<WasiState>,
    export: String,
    label: String,
    working_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct AsyncBatch<'a> {
    scope: &'a Scope,
    messages: &'a [AsgiMessage],
}

/// Guest runtime backed by WebAssembly components.
///
/// Every export is `func(input: string) -> result<string, string>`; see
/// [`GuestRuntime::invoke`] for the JSON carried across it.
///
/// # Threading
///
/// `WasmRuntime` is `Send + Sync` and is typically wrapped in `Arc`. Each
/// invocation creates its own `Store`, so concurrent invocations never
/// share guest state.
pub struct WasmRuntime {
    runtime: Arc<RuntimeContext>,
    storage: ComponentStorage,
    modules: RwLock<ModuleRegistry<WasmModule>>,
}

impl WasmRuntime {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, RuntimeError> {
        let runtime = Arc::new(RuntimeContext::new()?);
        let cache_dir = cache_dir.unwrap_or_else(ComponentStorage::default_path);
        let storage = ComponentStorage::new(cache_dir);
        storage.init()?;
        Ok(Self {
            runtime,
            storage,
            modules: RwLock::new(ModuleRegistry::new()),
        })
    }

    /// Number of modules currently registered.
    pub async fn module_count(&self) -> usize {
        self.modules.read().await.len()
    }

    async fn load(&self, spec: &ApplicationSpec) -> Result<GuestCallable, RuntimeError> {
        let module_name = &spec.entry.module;
        let mut roots = Vec::with_capacity(spec.search_paths.len() + 1);
        roots.push(spec.origin());
        roots.extend(spec.search_paths.iter().map(|p| absolute_dir(p)));

        let (root, wasm_path) = self.storage.locate(module_name, &roots)?;
        let key = ModuleKey::new(module_name.clone(), root);

        let cached = self.modules.read().await.get(&key);
        let module = match cached {
            Some(module) => {
                tracing::debug!(module = %module_name, "Module already loaded");
                module
            }
            None => {
                tracing::info!(module = %module_name, path = %wasm_path.display(), "Loading component");
                let component = self
                    .storage
                    .load_or_compile(&wasm_path, &self.runtime.engine)?;
                let instance_pre = self.runtime.prepare(module_name, &component)?;
                self.modules
                    .write()
                    .await
                    .insert(key, wasm_path.clone(), WasmModule { instance_pre })
            }
        };

        // Instantiate once to surface missing exports at load time.
        let attribute = &spec.entry.attribute;
        let mut store = self.runtime.store(None);
        let instance = module
            .instance_pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{module_name}: {e}")))?;
        if instance.get_func(&mut store, attribute.as_str()).is_none() {
            return Err(RuntimeError::AttributeNotFound {
                module: module_name.clone(),
                attribute: attribute.clone(),
            });
        }

        let export = WasmExport {
            instance_pre: module.instance_pre.clone(),
            export: attribute.clone(),
            label: spec.entry.to_string(),
            working_dir: spec.source_root(),
        };
        Ok(GuestCallable::new(
            spec.entry.clone(),
            spec.convention,
            wasm_path,
            export,
        ))
    }

    async fn instantiate(
        &self,
        export: &WasmExport,
    ) -> Result<(Store<WasiState>, Func), RuntimeError> {
        let mut store = self.runtime.store(export.working_dir.as_deref());
        let instance = export
            .instance_pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{}: {e}", export.label)))?;
        let func = instance
            .get_func(&mut store, export.export.as_str())
            .ok_or_else(|| RuntimeError::AttributeNotFound {
                module: export.label.clone(),
                attribute: export.export.clone(),
            })?;
        Ok((store, func))
    }

    async fn call_sync(
        &self,
        export: &WasmExport,
        request: SyncRequest,
    ) -> Result<SyncResponse, RuntimeError> {
        let (mut store, func) = self.instantiate(export).await?;
        let input = serde_json::to_string(&request)?;
        let output = call_export(&mut store, func, &export.label, input).await?;
        serde_json::from_str(&output)
            .map_err(|e| RuntimeError::GuestError(format!("{}: malformed response: {e}", export.label)))
    }

    /// Batch host messages up to each dispatch point and hand them to the
    /// export. An HTTP connection ends after one batch; a lifespan
    /// connection keeps the same instance until the host hangs up.
    async fn call_async(
        &self,
        export: &WasmExport,
        scope: Scope,
        mut channel: GuestChannel,
    ) -> Result<(), RuntimeError> {
        let (mut store, func) = self.instantiate(export).await?;
        let single_shot = !scope.is_lifespan();
        loop {
            let mut batch = Vec::new();
            let closed = loop {
                match channel.receive().await {
                    Some(message) => {
                        let dispatch = message.is_dispatch_point();
                        batch.push(message);
                        if dispatch {
                            break false;
                        }
                    }
                    None => break true,
                }
            };
            if batch.is_empty() {
                return Ok(());
            }

            let input = serde_json::to_string(&AsyncBatch {
                scope: &scope,
                messages: &batch,
            })?;
            let output = call_export(&mut store, func, &export.label, input).await?;
            let replies: Vec<AsgiMessage> = serde_json::from_str(&output).map_err(|e| {
                RuntimeError::GuestError(format!("{}: malformed messages: {e}", export.label))
            })?;
            for reply in replies {
                if channel.send(reply).await.is_err() {
                    return Ok(());
                }
            }
            if single_shot || closed {
                return Ok(());
            }
        }
    }
}

impl GuestRuntime for WasmRuntime {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    fn load_module<'a>(
        &'a self,
        spec: &'a ApplicationSpec,
    ) -> Pin<Box<dyn Future<Output = Result<GuestCallable, RuntimeError>> + Send + 'a>> {
        Box::pin(self.load(spec))
    }

    /// Sync calls pass `{"environ": {...}, "input": "<base64>"}` and expect
    /// `{"status": u16, "headers": [[k, v]], "chunks": ["<base64>"]}`.
    /// Async calls pass `{"scope": {...}, "messages": [...]}` and expect a
    /// JSON array of messages.
    fn invoke<'a>(
        &'a self,
        callable: &'a GuestCallable,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let export = callable.handle::<WasmExport>()?;
            if callable.convention != call.convention() {
                return Err(convention_mismatch(callable, &call));
            }
            tracing::debug!(entry = %callable.entry, "Invoking component");
            match call {
                GuestCall::Sync(request) => {
                    Ok(GuestOutcome::Sync(self.call_sync(export, request).await?))
                }
                GuestCall::Async { scope, channel } => {
                    self.call_async(export, scope, channel).await?;
                    Ok(GuestOutcome::AsyncDone)
                }
            }
        })
    }

    fn evict_modules<'a>(
        &'a self,
        dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>> {
        Box::pin(async move { self.modules.write().await.purge_under(dir) })
    }
}

/// Call `func(input: string) -> result<string, string>` once.
async fn call_export(
    store: &mut Store<WasiState>,
    func: Func,
    label: &str,
    input: String,
) -> Result<String, RuntimeError> {
    let params = [Val::String(input)];
    let mut results = vec![Val::Bool(false)]; // placeholder; overwritten by call

    func.call_async(&mut *store, &params, &mut results)
        .await
        .map_err(|e| RuntimeError::InvocationFailed(format!("{label}: {e}")))?;

    // Required after any component call that may return results
    func.post_return_async(&mut *store)
        .await
        .map_err(|e| RuntimeError::InvocationFailed(format!("{label} post_return: {e}")))?;

    extract_run_result(label, results)
}

/// Extract the string value from `result<string, string>` Val.
fn extract_run_result(label: &str, results: Vec<Val>) -> Result<String, RuntimeError> {
    match results.into_iter().next() {
        Some(Val::Result(Ok(Some(boxed)))) => match *boxed {
            Val::String(s) => Ok(s),
            other => Err(RuntimeError::InvocationFailed(format!(
                "{label}: expected string in Ok variant, got {other:?}"
            ))),
        },
        Some(Val::Result(Err(Some(boxed)))) => match *boxed {
            Val::String(e) => Err(RuntimeError::GuestError(e)),
            other => Err(RuntimeError::GuestError(format!("{other:?}"))),
        },
        Some(Val::Result(Ok(None))) => Ok("null".into()),
        Some(Val::Result(Err(None))) => Err(RuntimeError::GuestError("(no error detail)".into())),
        Some(other) => Err(RuntimeError::InvocationFailed(format!(
            "{label}: unexpected return Val: {other:?}"
        ))),
        None => Err(RuntimeError::InvocationFailed(format!(
            "{label}: component returned no values"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use hatch_core::{CallingConvention, EntryPoint};

    use super::*;

    #[test]
    fn ok_string_is_returned() {
        let results = vec![Val::Result(Ok(Some(Box::new(Val::String("{}".into())))))];
        assert_eq!(extract_run_result("m:app", results).unwrap(), "{}");
    }

    #[test]
    fn err_string_is_a_guest_error() {
        let results = vec![Val::Result(Err(Some(Box::new(Val::String("boom".into())))))];
        assert!(matches!(
            extract_run_result("m:app", results),
            Err(RuntimeError::GuestError(msg)) if msg == "boom"
        ));
    }

    #[test]
    fn missing_results_are_invocation_failures() {
        assert!(matches!(
            extract_run_result("m:app", vec![]),
            Err(RuntimeError::InvocationFailed(_))
        ));
        assert!(matches!(
            extract_run_result("m:app", vec![Val::Bool(true)]),
            Err(RuntimeError::InvocationFailed(_))
        ));
    }

    #[tokio::test]
    async fn missing_module_is_reported_with_search_roots() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WasmRuntime::new(Some(dir.path().join("cache"))).unwrap();
        let spec = ApplicationSpec::new(
            EntryPoint::parse("nothere:app").unwrap(),
            CallingConvention::Sync,
        )
        .with_working_directory(dir.path());
        match runtime.load_module(&spec).await {
            Err(RuntimeError::ModuleNotFound { module, searched }) => {
                assert_eq!(module, "nothere");
                assert_eq!(searched.len(), 1);
            }
            other => panic!("expected ModuleNotFound, got {other:?}"),
        }
        assert_eq!(runtime.module_count().await, 0);
    }
}
