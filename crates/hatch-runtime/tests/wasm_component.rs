/// End-to-end tests for the wasm guest runtime.
///
/// These need a prebuilt component exporting
/// `app: func(input: string) -> result<string, string>` that echoes the
/// request body back with status 200. Point `HATCH_TEST_COMPONENT` at it.
///
/// Run with: `HATCH_TEST_COMPONENT=/path/echo.wasm cargo test -p hatch-runtime --test wasm_component -- --include-ignored`
use bytes::Bytes;
use hatch_core::{ApplicationSpec, CallingConvention, EntryPoint};
use hatch_runtime::{GuestCall, GuestOutcome, GuestRuntime, SyncRequest, WasmRuntime};

fn component_path() -> std::path::PathBuf {
    std::env::var_os("HATCH_TEST_COMPONENT")
        .map(std::path::PathBuf::from)
        .expect("HATCH_TEST_COMPONENT must point at an echo component")
}

#[tokio::test]
#[ignore = "requires a prebuilt echo component in HATCH_TEST_COMPONENT"]
async fn echo_component_round_trips_body() {
    let site = tempfile::tempdir().unwrap();
    std::fs::copy(component_path(), site.path().join("echo.wasm")).unwrap();
    let cache = tempfile::tempdir().unwrap();

    let runtime = WasmRuntime::new(Some(cache.path().to_path_buf())).unwrap();
    let spec = ApplicationSpec::new(EntryPoint::parse("echo:app").unwrap(), CallingConvention::Sync)
        .with_working_directory(site.path());

    let callable = runtime.load_module(&spec).await.unwrap();
    let outcome = runtime
        .invoke(
            &callable,
            GuestCall::Sync(SyncRequest {
                environ: Default::default(),
                input: Bytes::from_static(b"ping"),
            }),
        )
        .await
        .unwrap();

    match outcome {
        GuestOutcome::Sync(resp) => {
            assert_eq!(resp.status, Some(200));
            assert_eq!(resp.chunks.concat(), b"ping");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    // A second load reuses the registered module and the precompiled cache.
    runtime.load_module(&spec).await.unwrap();
    assert_eq!(runtime.module_count().await, 1);
    let cached: Vec<_> = std::fs::read_dir(cache.path()).unwrap().collect();
    assert_eq!(cached.len(), 1);

    let root = spec.source_root().unwrap();
    assert_eq!(runtime.evict_modules(&root).await, 1);
    assert_eq!(runtime.module_count().await, 0);
}
