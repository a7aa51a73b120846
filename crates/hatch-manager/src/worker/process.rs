use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use hatch_core::{ApplicationSpec, AsgiMessage, WorkerConfig};
use hatch_runtime::{GuestCall, GuestChannel, GuestOutcome, SyncRequest};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::protocol::{BoxedReader, BoxedWriter, Frame, FrameReader, FrameWriter};
use super::{RuntimeWorker, StateCell, WorkerKind, WorkerSettings, WorkerSpawner, WorkerState};
use crate::error::ManagerError;

/// How long a worker may take to finish an abandoned request before the
/// next one gives up on it.
const RESYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// The kind of exchange in flight on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Sync,
    Async,
}

struct Link {
    reader: FrameReader<BoxedReader>,
    writer: FrameWriter<BoxedWriter>,
    /// Set while a request is in flight, cleared once its last frame is read.
    in_flight: Option<Exchange>,
    /// A frame write was cut off partway, so the child's input is garbled.
    torn: bool,
}

impl Link {
    async fn send(&mut self, frame: &Frame) -> Result<(), ManagerError> {
        self.torn = true;
        self.writer.send(frame).await?;
        self.torn = false;
        Ok(())
    }
}

/// A worker running in its own process, one request at a time.
///
/// The host end of the frame protocol. Any I/O failure on the link, or the
/// child closing it mid-request, kills the worker. A request dropped by its
/// caller does not: the next request first tells the child the client is
/// gone and reads off what is left of the old exchange.
pub struct ProcessWorker {
    id: String,
    state: StateCell,
    link: Mutex<Link>,
    child: Mutex<Option<Child>>,
}

impl ProcessWorker {
    /// Wait for the child's handshake and wrap the link.
    pub async fn connect(
        id: String,
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
        startup_timeout: Duration,
    ) -> Result<Self, ManagerError> {
        let mut link = Link {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            in_flight: None,
            torn: false,
        };

        match tokio::time::timeout(startup_timeout, link.reader.next()).await {
            Ok(Ok(Some(Frame::Ready))) => {}
            Ok(Ok(Some(Frame::StartupFailed { message }))) => {
                return Err(ManagerError::StartupFailure {
                    app: id,
                    reason: message,
                });
            }
            Ok(Ok(Some(other))) => {
                return Err(ManagerError::Protocol(format!(
                    "worker {id} sent {} before ready",
                    other.name()
                )));
            }
            Ok(Ok(None)) => {
                return Err(ManagerError::WorkerFailure {
                    worker: id,
                    reason: "exited before ready".into(),
                });
            }
            Ok(Err(e)) => {
                return Err(ManagerError::WorkerFailure {
                    worker: id,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(ManagerError::StartupFailure {
                    app: id,
                    reason: format!(
                        "worker not ready after {}ms",
                        startup_timeout.as_millis()
                    ),
                });
            }
        }

        tracing::debug!(worker = %id, "Process worker ready");
        Ok(Self {
            id,
            state: StateCell::new(WorkerState::Ready),
            link: Mutex::new(link),
            child: Mutex::new(child),
        })
    }

    fn broken(&self, reason: impl ToString) -> ManagerError {
        self.state.set(WorkerState::Dead);
        let reason = reason.to_string();
        tracing::warn!(worker = %self.id, reason = %reason, "Worker link broken");
        ManagerError::WorkerFailure {
            worker: self.id.clone(),
            reason,
        }
    }

    async fn run(&self, call: GuestCall) -> Result<GuestOutcome, ManagerError> {
        let mut link = self.link.lock().await;
        if self.state.get() == WorkerState::Dead {
            return Err(ManagerError::WorkerFailure {
                worker: self.id.clone(),
                reason: "worker is dead".into(),
            });
        }
        if let Some(abandoned) = link.in_flight {
            self.resync(&mut link, abandoned).await?;
        }
        match call {
            GuestCall::Sync(request) => {
                link.in_flight = Some(Exchange::Sync);
                let outcome = self.run_sync(&mut link, request).await;
                link.in_flight = None;
                outcome
            }
            GuestCall::Async { scope, channel } => {
                link.in_flight = Some(Exchange::Async);
                link.send(&Frame::AsyncStart { scope })
                    .await
                    .map_err(|e| self.broken(e))?;
                let outcome = self.run_async(&mut link, channel).await;
                link.in_flight = None;
                outcome
            }
        }
    }

    /// Bring the link back in step after a request was dropped mid-flight.
    ///
    /// An async connection gets a disconnect and a close, which the child
    /// ignores if the connection already ended. Frames up to the end of the
    /// old exchange are discarded.
    async fn resync(&self, link: &mut Link, abandoned: Exchange) -> Result<(), ManagerError> {
        if link.torn {
            return Err(self.broken("a frame write was interrupted"));
        }
        tracing::debug!(worker = %self.id, ?abandoned, "Resyncing after an abandoned request");
        let drained = tokio::time::timeout(RESYNC_TIMEOUT, Self::drain(link, abandoned)).await;
        match drained {
            Ok(Ok(())) => {
                link.in_flight = None;
                Ok(())
            }
            Ok(Err(e)) => Err(self.broken(e)),
            Err(_) => Err(self.broken(format!(
                "abandoned request still running after {}ms",
                RESYNC_TIMEOUT.as_millis()
            ))),
        }
    }

    async fn drain(link: &mut Link, abandoned: Exchange) -> Result<(), ManagerError> {
        if abandoned == Exchange::Async {
            link.send(&Frame::Message {
                message: AsgiMessage::HttpDisconnect,
            })
            .await?;
            link.send(&Frame::Close).await?;
        }
        loop {
            match (abandoned, link.reader.next().await?) {
                (Exchange::Sync, Some(Frame::SyncResponse { .. }))
                | (Exchange::Async, Some(Frame::Done))
                | (_, Some(Frame::Error { .. })) => return Ok(()),
                (Exchange::Async, Some(Frame::Message { .. })) => {}
                (_, Some(other)) => {
                    return Err(ManagerError::Protocol(format!(
                        "unexpected {} frame while resyncing",
                        other.name()
                    )));
                }
                (_, None) => return Err(ManagerError::Protocol("channel closed while resyncing".into())),
            }
        }
    }

    async fn run_sync(&self, link: &mut Link, request: SyncRequest) -> Result<GuestOutcome, ManagerError> {
        link.send(&Frame::Sync { request })
            .await
            .map_err(|e| self.broken(e))?;
        match link.reader.next().await.map_err(|e| self.broken(e))? {
            Some(Frame::SyncResponse { response }) => Ok(GuestOutcome::Sync(response)),
            Some(Frame::Error { message }) => Err(ManagerError::GuestExecution(message)),
            Some(other) => Err(self.broken(format!("unexpected {} frame", other.name()))),
            None => Err(self.broken("channel closed mid-request")),
        }
    }

    /// Relay one async connection between the bridge and the child.
    async fn run_async(&self, link: &mut Link, mut channel: GuestChannel) -> Result<GuestOutcome, ManagerError> {
        let mut host_open = true;
        loop {
            tokio::select! {
                incoming = channel.receive(), if host_open => match incoming {
                    Some(message) => link
                        .send(&Frame::Message { message })
                        .await
                        .map_err(|e| self.broken(e))?,
                    None => {
                        host_open = false;
                        link.send(&Frame::Close).await.map_err(|e| self.broken(e))?;
                    }
                },
                frame = link.reader.next() => match frame.map_err(|e| self.broken(e))? {
                    Some(Frame::Message { message }) => {
                        // The bridge may already have stopped listening.
                        let _ = channel.send(message).await;
                    }
                    Some(Frame::Done) => return Ok(GuestOutcome::AsyncDone),
                    Some(Frame::Error { message }) => return Err(ManagerError::GuestExecution(message)),
                    Some(other) => return Err(self.broken(format!("unexpected {} frame", other.name()))),
                    None => return Err(self.broken("channel closed mid-request")),
                },
            }
        }
    }
}

impl RuntimeWorker for ProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Process
    }

    fn state(&self) -> WorkerState {
        self.state.get()
    }

    fn try_reserve(&self) -> bool {
        self.state.transition(WorkerState::Ready, WorkerState::Busy)
    }

    fn release(&self) {
        self.state.transition(WorkerState::Busy, WorkerState::Ready);
    }

    fn dispatch<'a>(
        &'a self,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, ManagerError>> + Send + 'a>> {
        Box::pin(self.run(call))
    }

    fn shutdown<'a>(&'a self, timeout: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            let was_alive = self.state.get() != WorkerState::Dead;
            if was_alive {
                self.state.set(WorkerState::Draining);
                match tokio::time::timeout_at(deadline, self.link.lock()).await {
                    Ok(mut link) => {
                        if link.send(&Frame::Shutdown).await.is_ok() {
                            loop {
                                match tokio::time::timeout_at(deadline, link.reader.next()).await {
                                    Ok(Ok(Some(Frame::Exited))) | Ok(Ok(None)) | Ok(Err(_)) => break,
                                    Ok(Ok(Some(_))) => continue,
                                    Err(_) => {
                                        tracing::warn!(worker = %self.id, "Worker did not acknowledge shutdown in time");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(_) => {
                        tracing::warn!(worker = %self.id, "Worker still busy at shutdown deadline");
                    }
                }
            }
            self.state.set(WorkerState::Dead);

            if let Some(mut child) = self.child.lock().await.take() {
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(worker = %self.id, %status, "Worker process exited");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(worker = %self.id, "Failed to reap worker process: {e}");
                    }
                    Err(_) => {
                        tracing::warn!(worker = %self.id, "Killing worker process after shutdown timeout");
                        if let Err(e) = child.kill().await {
                            tracing::warn!(worker = %self.id, "Failed to kill worker process: {e}");
                        }
                    }
                }
            }
        })
    }
}

/// Launches `hatch worker` child processes.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The configured program, or the running executable.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, ManagerError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(program, config.args.clone()))
    }

    pub fn command_args(&self, spec: &ApplicationSpec, settings: &WorkerSettings) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--app".into());
        args.push(spec.entry.to_string());
        args.push("--convention".into());
        args.push(spec.convention.to_string());
        if settings.lifespan {
            args.push("--lifespan".into());
        }
        if let Some(dir) = &spec.working_directory {
            args.push("--working-dir".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        for path in &spec.search_paths {
            args.push("--search-path".into());
            args.push(path.to_string_lossy().into_owned());
        }
        args.push("--startup-timeout-ms".into());
        args.push(settings.startup_timeout.as_millis().to_string());
        args.push("--shutdown-timeout-ms".into());
        args.push(settings.shutdown_timeout.as_millis().to_string());
        args
    }

    pub async fn launch(
        &self,
        id: String,
        spec: &ApplicationSpec,
        settings: &WorkerSettings,
    ) -> Result<ProcessWorker, ManagerError> {
        let mut child = Command::new(&self.program)
            .args(self.command_args(spec, settings))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ManagerError::WorkerFailure {
                worker: id,
                reason: "worker stdio not captured".into(),
            });
        };
        tracing::info!(
            worker = %id,
            pid = child.id(),
            program = %self.program.display(),
            "Spawned worker process"
        );
        ProcessWorker::connect(
            id,
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            settings.startup_timeout,
        )
        .await
    }
}

pub struct ProcessSpawner {
    launcher: Arc<WorkerLauncher>,
    spec: ApplicationSpec,
    settings: WorkerSettings,
}

impl ProcessSpawner {
    pub fn new(launcher: Arc<WorkerLauncher>, spec: ApplicationSpec, settings: WorkerSettings) -> Self {
        Self {
            launcher,
            spec,
            settings,
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn<'a>(
        &'a self,
        id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RuntimeWorker>, ManagerError>> + Send + 'a>> {
        Box::pin(async move {
            let worker = self.launcher.launch(id, &self.spec, &self.settings).await?;
            Ok(Arc::new(worker) as Arc<dyn RuntimeWorker>)
        })
    }
}
