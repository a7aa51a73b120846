use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest body chunk handed to a guest in one message.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

/// An HTTP request as received from the host server, already routed.
#[derive(Debug)]
pub struct HostRequest {
    pub method: String,
    /// Raw (still percent-encoded) request path.
    pub path: String,
    pub query_string: String,
    pub http_version: String,
    pub scheme: String,
    pub headers: Vec<(String, String)>,
    pub server: (String, u16),
    pub client: Option<(String, u16)>,
    pub body: RequestBody,
}

impl HostRequest {
    /// Build a request from a method and a request target such as `/path?x=1`.
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        Self {
            method: method.into(),
            path: if path.is_empty() { "/".into() } else { path.into() },
            query_string: query.into(),
            http_version: "1.1".into(),
            scheme: "http".into(),
            headers: Vec::new(),
            server: ("localhost".into(), 80),
            client: None,
            body: RequestBody::empty(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::full(body);
        self
    }

    pub fn with_body_stream(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server = (host.into(), port);
        self
    }

    pub fn with_client(mut self, host: impl Into<String>, port: u16) -> Self {
        self.client = Some((host.into(), port));
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Readable request body: buffered bytes, optionally followed by a stream.
pub struct RequestBody {
    pending: Bytes,
    source: Option<mpsc::Receiver<io::Result<Bytes>>>,
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("pending", &self.pending.len())
            .field("streaming", &self.source.is_some())
            .finish()
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            pending: Bytes::new(),
            source: None,
        }
    }

    pub fn full(body: impl Into<Bytes>) -> Self {
        Self {
            pending: body.into(),
            source: None,
        }
    }

    /// A body fed chunk by chunk by the host. Dropping the sender ends the body.
    pub fn channel(capacity: usize) -> (mpsc::Sender<io::Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                pending: Bytes::new(),
                source: Some(rx),
            },
        )
    }

    /// Next chunk of at most [`BODY_CHUNK_SIZE`] bytes, or `None` at the end.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if !self.pending.is_empty() {
                let take = self.pending.len().min(BODY_CHUNK_SIZE);
                return Ok(Some(self.pending.split_to(take)));
            }
            let Some(source) = self.source.as_mut() else {
                return Ok(None);
            };
            match source.recv().await {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => {
                    self.source = None;
                    return Err(e);
                }
                None => {
                    self.source = None;
                    return Ok(None);
                }
            }
        }
    }

    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// One event written to the host's response writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Chunk(Bytes),
}

/// The host stopped reading the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client disconnected")]
pub struct ClientDisconnected;

/// Write side of a response. The head must be sent before any chunk.
#[derive(Debug)]
pub struct ResponseSink {
    tx: mpsc::Sender<ResponseEvent>,
    head_sent: bool,
}

impl ResponseSink {
    pub fn channel(capacity: usize) -> (ResponseSink, ResponseStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ResponseSink {
                tx,
                head_sent: false,
            },
            ResponseStream { rx },
        )
    }

    pub async fn send_head(
        &mut self,
        status: u16,
        headers: Vec<(String, String)>,
    ) -> Result<(), ClientDisconnected> {
        self.tx
            .send(ResponseEvent::Head { status, headers })
            .await
            .map_err(|_| ClientDisconnected)?;
        self.head_sent = true;
        Ok(())
    }

    pub async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), ClientDisconnected> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(ResponseEvent::Chunk(chunk))
            .await
            .map_err(|_| ClientDisconnected)
    }

    /// Write a generic 500 if nothing has been written yet.
    ///
    /// Once a head has gone out the response can only be cut short.
    pub async fn send_error(&mut self) {
        if self.head_sent {
            return;
        }
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        if self.send_head(500, headers).await.is_ok() {
            let _ = self
                .send_chunk(Bytes::from_static(b"Internal Server Error"))
                .await;
        }
    }

    pub fn head_sent(&self) -> bool {
        self.head_sent
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the host drops its [`ResponseStream`].
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Read side of a response, held by the host.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::Receiver<ResponseEvent>,
}

impl ResponseStream {
    pub async fn next_event(&mut self) -> Option<ResponseEvent> {
        self.rx.recv().await
    }

    /// Buffer the whole response. `None` if the writer closed without a head.
    pub async fn collect(mut self) -> Option<HostResponse> {
        let (status, headers) = match self.rx.recv().await? {
            ResponseEvent::Head { status, headers } => (status, headers),
            ResponseEvent::Chunk(_) => return None,
        };
        let mut body = BytesMut::new();
        while let Some(event) = self.rx.recv().await {
            if let ResponseEvent::Chunk(chunk) = event {
                body.extend_from_slice(&chunk);
            }
        }
        Some(HostResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HostResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
