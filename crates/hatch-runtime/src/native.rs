use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hatch_core::{ApplicationSpec, CallingConvention, Scope};
use tokio::sync::RwLock;

use crate::error::RuntimeError;
use crate::guest::{
    GuestCall, GuestCallable, GuestChannel, GuestOutcome, GuestRuntime, SyncRequest, SyncResponse,
    convention_mismatch,
};
use crate::registry::{ModuleKey, ModuleRegistry};

pub type SyncHandler = Arc<
    dyn Fn(SyncRequest) -> Pin<Box<dyn Future<Output = Result<SyncResponse, String>> + Send>>
        + Send
        + Sync,
>;

pub type AsyncHandler = Arc<
    dyn Fn(Scope, GuestChannel) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;

type Loader = Arc<dyn Fn(&ModuleContext) -> Result<NativeModule, String> + Send + Sync>;

/// One exported attribute of a native module.
#[derive(Clone)]
pub enum NativeExport {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl NativeExport {
    fn convention(&self) -> CallingConvention {
        match self {
            NativeExport::Sync(_) => CallingConvention::Sync,
            NativeExport::Async(_) => CallingConvention::Async,
        }
    }
}

/// The result of importing a native module: its exported attributes.
#[derive(Clone, Default)]
pub struct NativeModule {
    exports: HashMap<String, NativeExport>,
}

impl NativeModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync<F, Fut>(mut self, attribute: impl Into<String>, f: F) -> Self
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncResponse, String>> + Send + 'static,
    {
        let handler: SyncHandler = Arc::new(move |request| {
            let fut: Pin<Box<dyn Future<Output = Result<SyncResponse, String>> + Send>> =
                Box::pin(f(request));
            fut
        });
        self.exports
            .insert(attribute.into(), NativeExport::Sync(handler));
        self
    }

    pub fn with_async<F, Fut>(mut self, attribute: impl Into<String>, f: F) -> Self
    where
        F: Fn(Scope, GuestChannel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |scope, channel| {
            let fut: Pin<Box<dyn Future<Output = Result<(), String>> + Send>> =
                Box::pin(f(scope, channel));
            fut
        });
        self.exports
            .insert(attribute.into(), NativeExport::Async(handler));
        self
    }
}

/// What a loader sees when its module is (re)imported.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub module: String,
    pub working_directory: Option<PathBuf>,
    pub search_paths: Vec<PathBuf>,
}

impl ModuleContext {
    /// Read a file relative to the working directory.
    pub fn read_to_string(&self, relative: impl AsRef<Path>) -> std::io::Result<String> {
        let base = self.working_directory.clone().unwrap_or_default();
        std::fs::read_to_string(base.join(relative))
    }
}

/// Guest runtime whose modules are Rust closures.
///
/// A module is registered by name with a loader. The loader runs on first
/// import from a given root and again only after that root is purged, the
/// way an interpreter keeps imported modules in its module table.
#[derive(Default)]
pub struct NativeRuntime {
    loaders: RwLock<HashMap<String, Loader>>,
    modules: RwLock<ModuleRegistry<NativeModule>>,
    imports: AtomicU64,
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module<F>(mut self, name: impl Into<String>, loader: F) -> Self
    where
        F: Fn(&ModuleContext) -> Result<NativeModule, String> + Send + Sync + 'static,
    {
        self.loaders
            .get_mut()
            .insert(name.into(), Arc::new(loader));
        self
    }

    pub async fn register_module<F>(&self, name: impl Into<String>, loader: F)
    where
        F: Fn(&ModuleContext) -> Result<NativeModule, String> + Send + Sync + 'static,
    {
        self.loaders
            .write()
            .await
            .insert(name.into(), Arc::new(loader));
    }

    /// How many times any loader has run.
    pub fn import_count(&self) -> u64 {
        self.imports.load(Ordering::Relaxed)
    }

    pub async fn module_count(&self) -> usize {
        self.modules.read().await.len()
    }

    async fn load(&self, spec: &ApplicationSpec) -> Result<GuestCallable, RuntimeError> {
        let module_name = &spec.entry.module;
        let root = spec.origin();
        let key = ModuleKey::new(module_name.clone(), root.clone());

        let cached = self.modules.read().await.get(&key);
        let module = match cached {
            Some(module) => module,
            None => {
                let loader = self
                    .loaders
                    .read()
                    .await
                    .get(module_name)
                    .cloned()
                    .ok_or_else(|| RuntimeError::ModuleNotFound {
                        module: module_name.clone(),
                        searched: vec![root.clone()],
                    })?;
                let context = ModuleContext {
                    module: module_name.clone(),
                    working_directory: spec.source_root(),
                    search_paths: spec.search_paths.clone(),
                };
                let loaded = loader(&context)
                    .map_err(|e| RuntimeError::ImportFailed(format!("{module_name}: {e}")))?;
                self.imports.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(module = %module_name, root = %root.display(), "Imported native module");
                self.modules
                    .write()
                    .await
                    .insert(key, root.clone(), loaded)
            }
        };

        let attribute = &spec.entry.attribute;
        let export = module
            .exports
            .get(attribute)
            .cloned()
            .ok_or_else(|| RuntimeError::AttributeNotFound {
                module: module_name.clone(),
                attribute: attribute.clone(),
            })?;
        if export.convention() != spec.convention {
            return Err(RuntimeError::ConventionMismatch {
                entry: spec.entry.to_string(),
                expected: spec.convention.to_string(),
            });
        }
        Ok(GuestCallable::new(
            spec.entry.clone(),
            spec.convention,
            root,
            export,
        ))
    }
}

impl GuestRuntime for NativeRuntime {
    fn kind(&self) -> &'static str {
        "native"
    }

    fn load_module<'a>(
        &'a self,
        spec: &'a ApplicationSpec,
    ) -> Pin<Box<dyn Future<Output = Result<GuestCallable, RuntimeError>> + Send + 'a>> {
        Box::pin(self.load(spec))
    }

    fn invoke<'a>(
        &'a self,
        callable: &'a GuestCallable,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, RuntimeError>> + Send + 'a>> {
        Box::pin(async move {
            let export = callable.handle::<NativeExport>()?;
            match (export, call) {
                (NativeExport::Sync(handler), GuestCall::Sync(request)) => handler(request)
                    .await
                    .map(GuestOutcome::Sync)
                    .map_err(RuntimeError::GuestError),
                (NativeExport::Async(handler), GuestCall::Async { scope, channel }) => {
                    handler(scope, channel)
                        .await
                        .map_err(RuntimeError::GuestError)?;
                    Ok(GuestOutcome::AsyncDone)
                }
                (_, call) => Err(convention_mismatch(callable, &call)),
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

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hatch_core::EntryPoint;

    use super::*;

    fn greeting_runtime() -> NativeRuntime {
        NativeRuntime::new().with_module("site", |ctx| {
            let greeting = ctx
                .read_to_string("greeting.txt")
                .map_err(|e| e.to_string())?;
            Ok(NativeModule::new().with_sync("app", move |_req| {
                let greeting = greeting.clone();
                async move { Ok(SyncResponse::new(200).with_chunk(greeting)) }
            }))
        })
    }

    fn request() -> GuestCall {
        GuestCall::Sync(SyncRequest {
            environ: Default::default(),
            input: Bytes::new(),
        })
    }

    async fn body(runtime: &NativeRuntime, callable: &GuestCallable) -> Bytes {
        match runtime.invoke(callable, request()).await.unwrap() {
            GuestOutcome::Sync(resp) => resp.chunks.concat().into(),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn module_is_imported_once_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "v1").unwrap();
        let runtime = greeting_runtime();
        let spec = ApplicationSpec::new(EntryPoint::parse("site:app").unwrap(), CallingConvention::Sync)
            .with_working_directory(dir.path());

        let first = runtime.load_module(&spec).await.unwrap();
        std::fs::write(dir.path().join("greeting.txt"), "v2").unwrap();
        let second = runtime.load_module(&spec).await.unwrap();
        assert_eq!(runtime.import_count(), 1);
        assert_eq!(body(&runtime, &second).await, "v1");

        let root = spec.source_root().unwrap();
        assert_eq!(runtime.evict_modules(&root).await, 1);
        let third = runtime.load_module(&spec).await.unwrap();
        assert_eq!(runtime.import_count(), 2);
        assert_eq!(body(&runtime, &third).await, "v2");

        // Callables loaded before the purge keep their original code.
        assert_eq!(body(&runtime, &first).await, "v1");
    }

    #[tokio::test]
    async fn same_module_from_different_roots_is_distinct() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("greeting.txt"), "tenant a").unwrap();
        std::fs::write(b.path().join("greeting.txt"), "tenant b").unwrap();
        let runtime = greeting_runtime();
        let entry = EntryPoint::parse("site:app").unwrap();

        let spec_a = ApplicationSpec::new(entry.clone(), CallingConvention::Sync)
            .with_working_directory(a.path());
        let spec_b =
            ApplicationSpec::new(entry, CallingConvention::Sync).with_working_directory(b.path());
        let callable_a = runtime.load_module(&spec_a).await.unwrap();
        let callable_b = runtime.load_module(&spec_b).await.unwrap();

        assert_eq!(runtime.module_count().await, 2);
        assert_eq!(body(&runtime, &callable_a).await, "tenant a");
        assert_eq!(body(&runtime, &callable_b).await, "tenant b");
    }

    #[tokio::test]
    async fn load_errors_are_specific() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = greeting_runtime();

        let unknown = ApplicationSpec::new(EntryPoint::parse("nope:app").unwrap(), CallingConvention::Sync);
        assert!(matches!(
            runtime.load_module(&unknown).await,
            Err(RuntimeError::ModuleNotFound { .. })
        ));

        // No greeting.txt: the loader fails.
        let broken = ApplicationSpec::new(EntryPoint::parse("site:app").unwrap(), CallingConvention::Sync)
            .with_working_directory(dir.path());
        assert!(matches!(
            runtime.load_module(&broken).await,
            Err(RuntimeError::ImportFailed(_))
        ));

        std::fs::write(dir.path().join("greeting.txt"), "hi").unwrap();
        let missing_attr = ApplicationSpec::new(EntryPoint::parse("site:other").unwrap(), CallingConvention::Sync)
            .with_working_directory(dir.path());
        assert!(matches!(
            runtime.load_module(&missing_attr).await,
            Err(RuntimeError::AttributeNotFound { .. })
        ));

        let wrong_convention = ApplicationSpec::new(EntryPoint::parse("site:app").unwrap(), CallingConvention::Async)
            .with_working_directory(dir.path());
        assert!(matches!(
            runtime.load_module(&wrong_convention).await,
            Err(RuntimeError::ConventionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn guest_errors_surface_as_guest_error() {
        let runtime = NativeRuntime::new().with_module("boom", |_| {
            Ok(NativeModule::new().with_sync("app", |_req| async { Err("exploded".to_string()) }))
        });
        let spec = ApplicationSpec::new(EntryPoint::parse("boom:app").unwrap(), CallingConvention::Sync);
        let callable = runtime.load_module(&spec).await.unwrap();
        assert!(matches!(
            runtime.invoke(&callable, request()).await,
            Err(RuntimeError::GuestError(msg)) if msg == "exploded"
        ));
    }
}
