//! Line-delimited JSON frames between the host and a process worker.
//!
//! Every frame is one JSON object on its own line, tagged by `frame`.
//! Binary payloads inside requests, responses and messages are base64.

use hatch_core::{AsgiMessage, Scope};
use hatch_runtime::{SyncRequest, SyncResponse};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::error::ManagerError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    // host -> worker
    Sync { request: SyncRequest },
    AsyncStart { scope: Scope },
    Message { message: AsgiMessage },
    /// The host will send nothing more on the current connection.
    Close,
    Shutdown,

    // worker -> host
    Ready,
    StartupFailed { message: String },
    SyncResponse { response: SyncResponse },
    Done,
    Error { message: String },
    Exited,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Sync { .. } => "sync",
            Frame::AsyncStart { .. } => "async_start",
            Frame::Message { .. } => "message",
            Frame::Close => "close",
            Frame::Shutdown => "shutdown",
            Frame::Ready => "ready",
            Frame::StartupFailed { .. } => "startup_failed",
            Frame::SyncResponse { .. } => "sync_response",
            Frame::Done => "done",
            Frame::Error { .. } => "error",
            Frame::Exited => "exited",
        }
    }
}

pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next frame, or `None` at end of stream. Cancel safe.
    pub async fn next(&mut self) -> Result<Option<Frame>, ManagerError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ManagerError::Protocol(format!("malformed frame: {e}")));
        }
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ManagerError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn frames_are_tagged_snake_case() {
        let json = serde_json::to_value(Frame::AsyncStart {
            scope: Scope::lifespan(),
        })
        .unwrap();
        assert_eq!(json["frame"], "async_start");
        assert_eq!(json["scope"]["type"], "lifespan");

        let frame: Frame = serde_json::from_str(r#"{"frame":"startup_failed","message":"nope"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::StartupFailed {
                message: "nope".into()
            }
        );
    }

    #[test]
    fn nested_message_keeps_its_own_tag() {
        let frame = Frame::Message {
            message: AsgiMessage::HttpResponseBody {
                body: Bytes::from_static(b"ok"),
                more_body: false,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "message");
        assert_eq!(json["message"]["type"], "http.response.body");
        assert_eq!(serde_json::from_value::<Frame>(json).unwrap(), frame);
    }

    #[tokio::test]
    async fn frames_cross_a_pipe_one_per_line() {
        let (host, worker) = tokio::io::duplex(1024);

        let mut writer = FrameWriter::new(host);
        writer.send(&Frame::Ready).await.unwrap();
        writer.send(&Frame::Done).await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(worker);
        assert_eq!(reader.next().await.unwrap(), Some(Frame::Ready));
        assert_eq!(reader.next().await.unwrap(), Some(Frame::Done));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_is_a_protocol_error() {
        let mut reader = FrameReader::new(&b"\nnot json\n"[..]);
        assert!(matches!(reader.next().await, Err(ManagerError::Protocol(_))));
    }
}
