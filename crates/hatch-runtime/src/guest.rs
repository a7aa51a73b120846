use std::any::Any;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use hatch_core::message::{b64, b64_seq};
use hatch_core::{ApplicationSpec, AsgiMessage, CallingConvention, EntryPoint, Environ, Scope};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RuntimeError;

/// The only boundary between the manager and guest code.
///
/// Implementations own their module table. Callers that share one runtime
/// between several applications are responsible for serializing
/// [`load_module`](GuestRuntime::load_module) and
/// [`evict_modules`](GuestRuntime::evict_modules) against dispatches.
pub trait GuestRuntime: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Import the entry module (reusing an already-registered one) and look up
    /// the entry attribute.
    fn load_module<'a>(
        &'a self,
        spec: &'a ApplicationSpec,
    ) -> Pin<Box<dyn Future<Output = Result<GuestCallable, RuntimeError>> + Send + 'a>>;

    /// Run one sync call or one async connection to completion.
    fn invoke<'a>(
        &'a self,
        callable: &'a GuestCallable,
        call: GuestCall,
    ) -> Pin<Box<dyn Future<Output = Result<GuestOutcome, RuntimeError>> + Send + 'a>>;

    /// Drop every registered module loaded from under `dir`. Returns how many.
    fn evict_modules<'a>(&'a self, dir: &'a Path)
    -> Pin<Box<dyn Future<Output = usize> + Send + 'a>>;
}

/// A loaded entry attribute, ready to invoke.
///
/// Holds the runtime-specific handle directly, so a callable keeps working
/// with the code it was loaded from even after its module is purged.
#[derive(Clone)]
pub struct GuestCallable {
    pub entry: EntryPoint,
    pub convention: CallingConvention,
    pub source: PathBuf,
    handle: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for GuestCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCallable")
            .field("entry", &self.entry)
            .field("convention", &self.convention)
            .field("source", &self.source)
            .finish()
    }
}

impl GuestCallable {
    pub fn new<H: Any + Send + Sync>(
        entry: EntryPoint,
        convention: CallingConvention,
        source: PathBuf,
        handle: H,
    ) -> Self {
        Self {
            entry,
            convention,
            source,
            handle: Arc::new(handle),
        }
    }

    pub fn handle<H: Any>(&self) -> Result<&H, RuntimeError> {
        self.handle
            .downcast_ref::<H>()
            .ok_or_else(|| RuntimeError::ForeignCallable(self.entry.to_string()))
    }
}

/// Input to a sync-convention callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub environ: Environ,
    #[serde(with = "b64")]
    pub input: Bytes,
}

/// What a sync-convention callable produced.
///
/// `status` is `None` when the guest never signalled status and headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(with = "b64_seq", default)]
    pub chunks: Vec<Bytes>,
}

impl SyncResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }
}

/// Guest end of an async connection.
#[derive(Debug)]
pub struct GuestChannel {
    receive: mpsc::Receiver<AsgiMessage>,
    send: mpsc::Sender<AsgiMessage>,
}

/// Host end of an async connection.
#[derive(Debug)]
pub struct HostChannel {
    pub to_guest: mpsc::Sender<AsgiMessage>,
    pub from_guest: mpsc::Receiver<AsgiMessage>,
}

impl GuestChannel {
    pub fn pair(capacity: usize) -> (GuestChannel, HostChannel) {
        let (to_guest, receive) = mpsc::channel(capacity.max(1));
        let (send, from_guest) = mpsc::channel(capacity.max(1));
        (
            GuestChannel { receive, send },
            HostChannel {
                to_guest,
                from_guest,
            },
        )
    }

    /// Next host message. `None` once the host closed the connection.
    pub async fn receive(&mut self) -> Option<AsgiMessage> {
        self.receive.recv().await
    }

    pub async fn send(&self, message: AsgiMessage) -> Result<(), RuntimeError> {
        self.send
            .send(message)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}

#[derive(Debug)]
pub enum GuestCall {
    Sync(SyncRequest),
    Async { scope: Scope, channel: GuestChannel },
}

impl GuestCall {
    pub fn convention(&self) -> CallingConvention {
        match self {
            GuestCall::Sync(_) => CallingConvention::Sync,
            GuestCall::Async { .. } => CallingConvention::Async,
        }
    }
}

#[derive(Debug)]
pub enum GuestOutcome {
    Sync(SyncResponse),
    /// The async connection ran to completion; output went through the channel.
    AsyncDone,
}

pub(crate) fn convention_mismatch(callable: &GuestCallable, call: &GuestCall) -> RuntimeError {
    RuntimeError::ConventionMismatch {
        entry: callable.entry.to_string(),
        expected: call.convention().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_response_without_status_deserializes() {
        let resp: SyncResponse = serde_json::from_str(r#"{"chunks":["aGk="]}"#).unwrap();
        assert_eq!(resp.status, None);
        assert_eq!(resp.chunks, vec![Bytes::from_static(b"hi")]);
    }

    #[test]
    fn callable_handle_downcasts_to_its_own_type() {
        let entry = EntryPoint::parse("m:app").unwrap();
        let callable = GuestCallable::new(entry, CallingConvention::Sync, PathBuf::new(), 7u32);
        assert_eq!(*callable.handle::<u32>().unwrap(), 7);
        assert!(matches!(
            callable.handle::<String>(),
            Err(RuntimeError::ForeignCallable(_))
        ));
    }

    #[tokio::test]
    async fn channel_pair_connects_both_ends() {
        let (mut guest, mut host) = GuestChannel::pair(4);
        host.to_guest
            .send(AsgiMessage::LifespanStartup)
            .await
            .unwrap();
        assert_eq!(guest.receive().await, Some(AsgiMessage::LifespanStartup));
        guest
            .send(AsgiMessage::LifespanStartupComplete)
            .await
            .unwrap();
        assert_eq!(
            host.from_guest.recv().await,
            Some(AsgiMessage::LifespanStartupComplete)
        );
        drop(host);
        assert_eq!(guest.receive().await, None);
        assert!(guest.send(AsgiMessage::HttpDisconnect).await.is_err());
    }
}
