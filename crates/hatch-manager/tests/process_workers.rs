//! Process-model pools driven over in-memory pipes.
//!
//! Each "process" is the real worker serve loop running on a task, joined
//! to the host by two duplex pipes instead of a child's stdin and stdout.
//! Aborting that task is a worker crash.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hatch_core::{
    ApplicationSpec, AsgiMessage, CallingConvention, EntryPoint, HostRequest, HostResponse,
    RequestBody, ResponseSink, Scope,
};
use hatch_manager::bridge;
use hatch_manager::worker::process::ProcessWorker;
use hatch_manager::{
    AppInstance, ManagerError, ManagerMetrics, RuntimeWorker, WorkerPool, WorkerSettings,
    WorkerSpawner, serve_worker,
};
use hatch_runtime::{GuestChannel, GuestRuntime, NativeModule, NativeRuntime, SyncRequest, SyncResponse};
use tokio::task::{AbortHandle, JoinSet};

struct DuplexSpawner {
    runtime: Arc<dyn GuestRuntime>,
    spec: ApplicationSpec,
    settings: WorkerSettings,
    spawned: AtomicUsize,
    serving: Mutex<Vec<AbortHandle>>,
}

impl DuplexSpawner {
    fn new(runtime: NativeRuntime, spec: ApplicationSpec) -> Self {
        Self {
            runtime: Arc::new(runtime),
            settings: WorkerSettings::for_spec(&spec, Duration::from_secs(2), Duration::from_secs(2)),
            spec,
            spawned: AtomicUsize::new(0),
            serving: Mutex::new(Vec::new()),
        }
    }

    /// Kill every worker spawned so far.
    fn crash_all(&self) {
        for serving in self.serving.lock().unwrap().drain(..) {
            serving.abort();
        }
    }
}

impl WorkerSpawner for DuplexSpawner {
    fn spawn<'a>(
        &'a self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RuntimeWorker>, ManagerError>> + Send + 'a>> {
        Box::pin(async move {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (host_out, worker_in) = tokio::io::duplex(64 * 1024);
            let (worker_out, host_in) = tokio::io::duplex(64 * 1024);
            let serving = tokio::spawn(serve_worker(
                Arc::clone(&self.runtime),
                self.spec.clone(),
                self.settings,
                worker_in,
                worker_out,
            ));
            self.serving.lock().unwrap().push(serving.abort_handle());

            let worker = ProcessWorker::connect(
                id,
                Box::new(host_in),
                Box::new(host_out),
                None,
                self.settings.startup_timeout,
            )
            .await?;
            Ok(Arc::new(worker) as Arc<dyn RuntimeWorker>)
        })
    }
}

fn instance(spawner: Arc<DuplexSpawner>, workers: usize, metrics: Arc<ManagerMetrics>) -> AppInstance {
    let spec = spawner.spec.clone();
    let pool = WorkerPool::new("proc", workers, spawner, Arc::clone(&metrics))
        .with_shutdown_timeout(Duration::from_secs(2));
    AppInstance::new("proc", spec, Arc::new(pool), metrics)
}

async fn serve(instance: &AppInstance, request: HostRequest) -> (Result<(), ManagerError>, HostResponse) {
    let (mut sink, stream) = ResponseSink::channel(16);
    let handled = async move {
        let result = bridge::handle(instance, request, &mut sink).await;
        drop(sink);
        result
    };
    let (result, response) = tokio::join!(handled, stream.collect());
    (result, response.expect("a response head"))
}

fn echo_runtime() -> NativeRuntime {
    NativeRuntime::new().with_module("echo", |_ctx| {
        Ok(NativeModule::new().with_sync("app", |req: SyncRequest| async move {
            let multiprocess = req.environ.get("wsgi.multiprocess").cloned().unwrap_or_default();
            Ok(SyncResponse::new(200)
                .with_header("x-multiprocess", multiprocess)
                .with_chunk(req.input))
        }))
    })
}

fn echo_spec(workers: usize) -> ApplicationSpec {
    ApplicationSpec::new(EntryPoint::parse("echo:app").unwrap(), CallingConvention::Sync).with_workers(workers)
}

#[tokio::test]
async fn sync_requests_round_trip_through_worker_processes() {
    let spawner = Arc::new(DuplexSpawner::new(echo_runtime(), echo_spec(2)));
    let app = Arc::new(instance(Arc::clone(&spawner), 2, Arc::new(ManagerMetrics::new())));

    let mut requests = JoinSet::new();
    for i in 0..12u8 {
        let app = Arc::clone(&app);
        requests.spawn(async move {
            let body = vec![i; 100 * 1024];
            let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body(body.clone())).await;
            result.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.header("x-multiprocess"), Some("true"));
            assert_eq!(response.body.as_ref(), body.as_slice());
        });
    }
    while let Some(joined) = requests.join_next().await {
        joined.unwrap();
    }
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    app.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn crashed_worker_fails_one_request_and_is_replaced() {
    let metrics = Arc::new(ManagerMetrics::new());
    let spawner = Arc::new(DuplexSpawner::new(echo_runtime(), echo_spec(1)));
    let app = instance(Arc::clone(&spawner), 1, Arc::clone(&metrics));

    let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body("one")).await;
    result.unwrap();
    assert_eq!(response.text(), "one");

    spawner.crash_all();
    let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body("two")).await;
    assert!(result.unwrap_err().is_worker_failure());
    assert_eq!(response.status, 500);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body("three")).await;
        if result.is_ok() {
            assert_eq!(response.text(), "three");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker was never replaced");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.snapshot().worker_restarts, 1);
    app.shutdown(Duration::from_secs(1)).await;
}

#[derive(Default)]
struct Counters {
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// Async app that reports how its request body arrived and runs lifespan.
fn chunk_runtime(counters: Arc<Counters>) -> NativeRuntime {
    NativeRuntime::new().with_module("chunks", move |_ctx| {
        let counters = Arc::clone(&counters);
        Ok(NativeModule::new().with_async("app", move |scope: Scope, mut channel: GuestChannel| {
            let counters = Arc::clone(&counters);
            async move {
                if scope.is_lifespan() {
                    while let Some(message) = channel.receive().await {
                        let reply = match message {
                            AsgiMessage::LifespanStartup => {
                                counters.startups.fetch_add(1, Ordering::SeqCst);
                                AsgiMessage::LifespanStartupComplete
                            }
                            AsgiMessage::LifespanShutdown => {
                                counters.shutdowns.fetch_add(1, Ordering::SeqCst);
                                AsgiMessage::LifespanShutdownComplete
                            }
                            _ => continue,
                        };
                        channel.send(reply).await.map_err(|e| e.to_string())?;
                    }
                    return Ok(());
                }

                let mut total = 0;
                let mut messages = 0;
                while let Some(message) = channel.receive().await {
                    if let AsgiMessage::HttpRequest { body, more_body } = message {
                        total += body.len();
                        messages += 1;
                        if !more_body {
                            break;
                        }
                    }
                }
                channel
                    .send(AsgiMessage::HttpResponseStart {
                        status: 200,
                        headers: vec![],
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                for part in [format!("{total} bytes"), format!(" in {messages} messages")] {
                    channel
                        .send(AsgiMessage::HttpResponseBody {
                            body: Bytes::from(part),
                            more_body: true,
                        })
                        .await
                        .map_err(|e| e.to_string())?;
                }
                channel
                    .send(AsgiMessage::HttpResponseBody {
                        body: Bytes::new(),
                        more_body: false,
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
        }))
    })
}

#[tokio::test]
async fn async_workers_stream_bodies_and_run_lifespan_per_process() {
    let counters = Arc::new(Counters::default());
    let spec = ApplicationSpec::new(EntryPoint::parse("chunks:app").unwrap(), CallingConvention::Async)
        .with_lifespan(true)
        .with_workers(2);
    let spawner = Arc::new(DuplexSpawner::new(chunk_runtime(Arc::clone(&counters)), spec));
    let app = instance(Arc::clone(&spawner), 2, Arc::new(ManagerMetrics::new()));

    let (sender, body) = RequestBody::channel(4);
    let feed = tokio::spawn(async move {
        for _ in 0..3 {
            sender.send(Ok(Bytes::from(vec![b'x'; 1000]))).await.unwrap();
        }
    });
    let (result, response) = serve(&app, HostRequest::new("POST", "/upload").with_body_stream(body)).await;
    feed.await.unwrap();
    result.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "3000 bytes in 3 messages");
    // Once per worker process, not once per instance.
    assert_eq!(counters.startups.load(Ordering::SeqCst), 2);

    app.shutdown(Duration::from_secs(1)).await;
    assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 2);
}

/// Sync app that takes a while to answer a body of "slow".
fn slow_runtime() -> NativeRuntime {
    NativeRuntime::new().with_module("slow", |_ctx| {
        Ok(NativeModule::new().with_sync("app", |req: SyncRequest| async move {
            if req.input.as_ref() == b"slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(SyncResponse::new(200).with_chunk(req.input))
        }))
    })
}

#[tokio::test]
async fn dropped_sync_request_keeps_the_worker() {
    let metrics = Arc::new(ManagerMetrics::new());
    let spec = ApplicationSpec::new(EntryPoint::parse("slow:app").unwrap(), CallingConvention::Sync).with_workers(1);
    let spawner = Arc::new(DuplexSpawner::new(slow_runtime(), spec));
    let app = instance(Arc::clone(&spawner), 1, Arc::clone(&metrics));

    let dropped = tokio::time::timeout(
        Duration::from_millis(20),
        serve(&app, HostRequest::new("POST", "/").with_body("slow")),
    )
    .await;
    assert!(dropped.is_err());

    // The next request waits out the old answer on the same worker.
    let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body("next")).await;
    result.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "next");
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot().worker_restarts, 0);
    app.shutdown(Duration::from_secs(1)).await;
}

/// Async app that holds `/hang` open until the client disconnects.
fn hanging_runtime(disconnects: Arc<AtomicUsize>) -> NativeRuntime {
    NativeRuntime::new().with_module("hang", move |_ctx| {
        let disconnects = Arc::clone(&disconnects);
        Ok(NativeModule::new().with_async("app", move |scope: Scope, mut channel: GuestChannel| {
            let disconnects = Arc::clone(&disconnects);
            async move {
                let hang = matches!(&scope, Scope::Http(http) if http.path == "/hang");
                while let Some(message) = channel.receive().await {
                    match message {
                        AsgiMessage::HttpRequest { more_body: false, .. } if !hang => break,
                        AsgiMessage::HttpDisconnect => {
                            disconnects.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                channel
                    .send(AsgiMessage::HttpResponseStart {
                        status: 200,
                        headers: vec![],
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                channel
                    .send(AsgiMessage::HttpResponseBody {
                        body: Bytes::from_static(b"answered"),
                        more_body: false,
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
        }))
    })
}

#[tokio::test]
async fn dropped_async_request_disconnects_the_guest_and_keeps_the_worker() {
    let metrics = Arc::new(ManagerMetrics::new());
    let disconnects = Arc::new(AtomicUsize::new(0));
    let spec = ApplicationSpec::new(EntryPoint::parse("hang:app").unwrap(), CallingConvention::Async)
        .with_lifespan(false)
        .with_workers(1);
    let spawner = Arc::new(DuplexSpawner::new(hanging_runtime(Arc::clone(&disconnects)), spec));
    let app = instance(Arc::clone(&spawner), 1, Arc::clone(&metrics));

    let dropped = tokio::time::timeout(Duration::from_millis(50), serve(&app, HostRequest::new("GET", "/hang"))).await;
    assert!(dropped.is_err());
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);

    let (result, response) = serve(&app, HostRequest::new("GET", "/")).await;
    result.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "answered");
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot().worker_restarts, 0);
    app.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn replacement_worker_runs_lifespan_startup_again() {
    let counters = Arc::new(Counters::default());
    let metrics = Arc::new(ManagerMetrics::new());
    let spec = ApplicationSpec::new(EntryPoint::parse("chunks:app").unwrap(), CallingConvention::Async)
        .with_lifespan(true)
        .with_workers(1);
    let spawner = Arc::new(DuplexSpawner::new(chunk_runtime(Arc::clone(&counters)), spec));
    let app = instance(Arc::clone(&spawner), 1, Arc::clone(&metrics));

    let (result, _) = serve(&app, HostRequest::new("POST", "/").with_body("one")).await;
    result.unwrap();
    assert_eq!(counters.startups.load(Ordering::SeqCst), 1);

    spawner.crash_all();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (result, response) = serve(&app, HostRequest::new("POST", "/").with_body("two")).await;
        if result.is_ok() {
            assert_eq!(response.text(), "3 bytes in 1 messages");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker was never replaced");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(metrics.snapshot().worker_restarts, 1);
    assert_eq!(counters.startups.load(Ordering::SeqCst), 2);

    app.shutdown(Duration::from_secs(1)).await;
    // The crashed process never got to shut down.
    assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
}
