//! The child side of the process worker protocol.
//!
//! `hatch worker` runs [`serve_worker`] over its stdin and stdout; tests run
//! it over in-memory pipes.

use std::collections::VecDeque;
use std::sync::Arc;

use hatch_core::{ApplicationSpec, AsgiMessage, Scope};
use hatch_runtime::{GuestCall, GuestCallable, GuestChannel, GuestOutcome, GuestRuntime, HostChannel};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ManagerError;
use crate::lifespan::LifespanSession;
use crate::worker::WorkerSettings;
use crate::worker::protocol::{Frame, FrameReader, FrameWriter};

const CHANNEL_CAPACITY: usize = 8;

/// Load the application, handshake, then serve requests until shutdown or EOF.
pub async fn serve_worker<R, W>(
    runtime: Arc<dyn GuestRuntime>,
    spec: ApplicationSpec,
    settings: WorkerSettings,
    reader: R,
    writer: W,
) -> Result<(), ManagerError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut frames = FrameReader::new(reader);
    let mut out = FrameWriter::new(writer);
    let label = spec.entry.to_string();

    let callable = match runtime.load_module(&spec).await {
        Ok(callable) => callable,
        Err(e) => {
            tracing::error!(app = %label, "Failed to load application: {e}");
            out.send(&Frame::StartupFailed {
                message: e.to_string(),
            })
            .await?;
            return Err(ManagerError::StartupFailure {
                app: label,
                reason: e.to_string(),
            });
        }
    };

    let mut lifespan = None;
    if settings.lifespan {
        let guest_runtime = Arc::clone(&runtime);
        let guest = callable.clone();
        let mut session = LifespanSession::begin(label.clone(), move |call| async move {
            guest_runtime
                .invoke(&guest, call)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        if let Err(e) = session.startup(settings.startup_timeout).await {
            out.send(&Frame::StartupFailed {
                message: e.to_string(),
            })
            .await?;
            return Err(e);
        }
        lifespan = Some(session);
    }

    out.send(&Frame::Ready).await?;
    tracing::info!(app = %label, runtime = runtime.kind(), "Worker ready");

    loop {
        let frame = match frames.next().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(app = %label, "Host closed the channel");
                break;
            }
            Err(e) => {
                tracing::warn!(app = %label, "Unreadable frame from host: {e}");
                break;
            }
        };
        match frame {
            Frame::Sync { request } => {
                let reply = match runtime.invoke(&callable, GuestCall::Sync(request)).await {
                    Ok(GuestOutcome::Sync(response)) => Frame::SyncResponse { response },
                    Ok(GuestOutcome::AsyncDone) => Frame::Error {
                        message: "sync call finished without a response".into(),
                    },
                    Err(e) => Frame::Error {
                        message: e.to_string(),
                    },
                };
                out.send(&reply).await?;
            }
            Frame::AsyncStart { scope } => {
                let keep_serving =
                    serve_connection(&runtime, &callable, scope, &mut frames, &mut out).await?;
                if !keep_serving {
                    break;
                }
            }
            Frame::Shutdown => break,
            // Leftovers from a connection that already finished.
            Frame::Message { .. } | Frame::Close => {}
            other => {
                tracing::warn!(app = %label, frame = other.name(), "Unexpected frame from host");
            }
        }
    }

    if let Some(session) = lifespan {
        session.shutdown(settings.shutdown_timeout).await;
    }
    // The host may already be gone.
    let _ = out.send(&Frame::Exited).await;
    tracing::info!(app = %label, "Worker exited");
    Ok(())
}

/// Serve one async connection. `false` means the host asked to stop.
async fn serve_connection<R, W>(
    runtime: &Arc<dyn GuestRuntime>,
    callable: &GuestCallable,
    scope: Scope,
    frames: &mut FrameReader<R>,
    out: &mut FrameWriter<W>,
) -> Result<bool, ManagerError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let (channel, host) = GuestChannel::pair(CHANNEL_CAPACITY);
    let HostChannel {
        to_guest,
        mut from_guest,
    } = host;
    let mut to_guest = Some(to_guest);

    let guest_runtime = Arc::clone(runtime);
    let guest = callable.clone();
    let mut invocation = tokio::spawn(async move {
        guest_runtime
            .invoke(&guest, GuestCall::Async { scope, channel })
            .await
    });

    let mut backlog: VecDeque<AsgiMessage> = VecDeque::new();
    let mut host_open = true;
    let mut guest_open = true;
    let mut keep_serving = true;

    let finished = loop {
        let mut close_to_guest = false;
        tokio::select! {
            result = &mut invocation => break result,
            message = from_guest.recv(), if guest_open => match message {
                Some(message) => out.send(&Frame::Message { message }).await?,
                None => guest_open = false,
            },
            frame = frames.next(), if host_open => match frame {
                Ok(Some(Frame::Message { message })) => backlog.push_back(message),
                Ok(Some(Frame::Close)) => {
                    host_open = false;
                    if backlog.is_empty() {
                        close_to_guest = true;
                    }
                }
                Ok(Some(Frame::Shutdown)) => {
                    keep_serving = false;
                    host_open = false;
                    backlog.clear();
                    close_to_guest = true;
                }
                Ok(Some(other)) => {
                    tracing::warn!(frame = other.name(), "Unexpected frame during a connection");
                }
                Ok(None) | Err(_) => {
                    keep_serving = false;
                    host_open = false;
                    backlog.clear();
                    close_to_guest = true;
                }
            },
            permit = reserve(to_guest.as_ref()), if !backlog.is_empty() => match permit {
                Some(permit) => {
                    match backlog.pop_front() {
                        Some(message) => permit.send(message),
                        None => drop(permit),
                    }
                    if backlog.is_empty() && !host_open {
                        close_to_guest = true;
                    }
                }
                None => {
                    backlog.clear();
                    close_to_guest = true;
                }
            },
        }
        if close_to_guest {
            to_guest = None;
        }
    };
    drop(to_guest);

    // The guest is done; forward whatever it sent last.
    while let Ok(message) = from_guest.try_recv() {
        out.send(&Frame::Message { message }).await?;
    }

    let reply = match finished {
        Ok(Ok(_)) => Frame::Done,
        Ok(Err(e)) => Frame::Error {
            message: e.to_string(),
        },
        Err(join) => Frame::Error {
            message: format!("application task failed: {join}"),
        },
    };
    if keep_serving {
        out.send(&reply).await?;
    }
    Ok(keep_serving)
}

/// A send permit on `sender`, or `None` once it is gone or its receiver closed.
pub(crate) async fn reserve(
    sender: Option<&tokio::sync::mpsc::Sender<AsgiMessage>>,
) -> Option<tokio::sync::mpsc::Permit<'_, AsgiMessage>> {
    match sender {
        Some(sender) => sender.reserve().await.ok(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use hatch_core::{CallingConvention, EntryPoint, HttpScope};
    use hatch_runtime::{NativeModule, NativeRuntime, SyncRequest, SyncResponse};
    use std::time::Duration;

    use super::*;

    fn settings(lifespan: bool) -> WorkerSettings {
        WorkerSettings {
            lifespan,
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn runtime() -> Arc<dyn GuestRuntime> {
        Arc::new(
            NativeRuntime::new()
                .with_module("echo", |_| {
                    Ok(NativeModule::new()
                        .with_sync("app", |req: SyncRequest| async move {
                            Ok(SyncResponse::new(200).with_chunk(req.input))
                        })
                        .with_async("stream", |_scope, mut channel| async move {
                            let mut body = Vec::new();
                            while let Some(message) = channel.receive().await {
                                if let AsgiMessage::HttpRequest { body: chunk, more_body } = message {
                                    body.extend_from_slice(&chunk);
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
                            channel
                                .send(AsgiMessage::HttpResponseBody {
                                    body: Bytes::from(body),
                                    more_body: false,
                                })
                                .await
                                .map_err(|e| e.to_string())
                        }))
                })
                .with_module("lifespan", |_| {
                    Ok(NativeModule::new().with_async("app", |scope, mut channel| async move {
                        if !scope.is_lifespan() {
                            return Err("only lifespan".into());
                        }
                        while let Some(message) = channel.receive().await {
                            let reply = match message {
                                AsgiMessage::LifespanStartup => AsgiMessage::LifespanStartupFailed {
                                    message: "no database".into(),
                                },
                                _ => continue,
                            };
                            channel.send(reply).await.map_err(|e| e.to_string())?;
                        }
                        Ok(())
                    }))
                }),
        )
    }

    fn spec(entry: &str, convention: CallingConvention) -> ApplicationSpec {
        ApplicationSpec::new(EntryPoint::parse(entry).unwrap(), convention)
    }

    struct Host {
        frames: FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        out: FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        worker: tokio::task::JoinHandle<Result<(), ManagerError>>,
    }

    fn start(spec: ApplicationSpec, lifespan: bool) -> Host {
        let (host, child) = tokio::io::duplex(256 * 1024);
        let (child_read, child_write) = tokio::io::split(child);
        let (host_read, host_write) = tokio::io::split(host);
        let worker = tokio::spawn(serve_worker(runtime(), spec, settings(lifespan), child_read, child_write));
        Host {
            frames: FrameReader::new(host_read),
            out: FrameWriter::new(host_write),
            worker,
        }
    }

    #[tokio::test]
    async fn sync_requests_then_shutdown() {
        let mut host = start(spec("echo:app", CallingConvention::Sync), false);
        assert_eq!(host.frames.next().await.unwrap(), Some(Frame::Ready));

        host.out
            .send(&Frame::Sync {
                request: SyncRequest {
                    environ: Default::default(),
                    input: Bytes::from_static(b"payload"),
                },
            })
            .await
            .unwrap();
        match host.frames.next().await.unwrap() {
            Some(Frame::SyncResponse { response }) => {
                assert_eq!(response.chunks.concat(), b"payload");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        host.out.send(&Frame::Shutdown).await.unwrap();
        assert_eq!(host.frames.next().await.unwrap(), Some(Frame::Exited));
        host.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn async_connection_relays_messages() {
        let mut host = start(spec("echo:stream", CallingConvention::Async), false);
        assert_eq!(host.frames.next().await.unwrap(), Some(Frame::Ready));

        host.out
            .send(&Frame::AsyncStart {
                scope: Scope::Http(HttpScope::new("POST", "/")),
            })
            .await
            .unwrap();
        for (chunk, more_body) in [("ab", true), ("cd", false)] {
            host.out
                .send(&Frame::Message {
                    message: AsgiMessage::HttpRequest {
                        body: Bytes::from(chunk),
                        more_body,
                    },
                })
                .await
                .unwrap();
        }

        let mut replies = Vec::new();
        loop {
            match host.frames.next().await.unwrap() {
                Some(Frame::Message { message }) => replies.push(message),
                Some(Frame::Done) => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(replies.len(), 2);
        assert_eq!(
            replies[1],
            AsgiMessage::HttpResponseBody {
                body: Bytes::from_static(b"abcd"),
                more_body: false,
            }
        );

        drop(host.out);
        host.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_module_reports_startup_failure() {
        let mut host = start(spec("nope:app", CallingConvention::Sync), false);
        assert!(matches!(
            host.frames.next().await.unwrap(),
            Some(Frame::StartupFailed { .. })
        ));
        assert!(host.worker.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn failed_lifespan_never_reports_ready() {
        let spec = spec("lifespan:app", CallingConvention::Async).with_lifespan(true);
        let mut host = start(spec, true);
        match host.frames.next().await.unwrap() {
            Some(Frame::StartupFailed { message }) => assert!(message.contains("no database")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(matches!(
            host.worker.await.unwrap(),
            Err(ManagerError::StartupFailure { .. })
        ));
    }
}
