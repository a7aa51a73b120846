use std::future::Future;
use std::time::Duration;

use hatch_core::{AsgiMessage, Scope};
use hatch_runtime::{GuestCall, GuestChannel};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::ManagerError;

const LIFESPAN_CHANNEL_CAPACITY: usize = 4;

/// How a lifespan startup ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanStart {
    Started,
    /// The application returned without answering the startup message.
    Unsupported,
}

/// One long-lived lifespan connection to an async application.
///
/// The connection is opened by [`begin`](LifespanSession::begin) and stays
/// open for the whole life of the application instance. Dropping the
/// session aborts the guest task.
pub struct LifespanSession {
    label: String,
    to_guest: Option<mpsc::Sender<AsgiMessage>>,
    from_guest: mpsc::Receiver<AsgiMessage>,
    task: Option<JoinHandle<Result<(), String>>>,
    supported: bool,
}

impl LifespanSession {
    /// Start the guest's lifespan connection. `launch` runs the call.
    pub fn begin<F, Fut>(label: impl Into<String>, launch: F) -> Self
    where
        F: FnOnce(GuestCall) -> Fut,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let (channel, host) = GuestChannel::pair(LIFESPAN_CHANNEL_CAPACITY);
        let task = tokio::spawn(launch(GuestCall::Async {
            scope: Scope::lifespan(),
            channel,
        }));
        Self {
            label: label.into(),
            to_guest: Some(host.to_guest),
            from_guest: host.from_guest,
            task: Some(task),
            supported: true,
        }
    }

    pub async fn startup(&mut self, timeout: Duration) -> Result<LifespanStart, ManagerError> {
        let deadline = Instant::now() + timeout;
        let delivered = match &self.to_guest {
            Some(tx) => tx.send(AsgiMessage::LifespanStartup).await.is_ok(),
            None => false,
        };

        let reply = if delivered {
            tokio::time::timeout_at(deadline, self.from_guest.recv()).await
        } else {
            Ok(None)
        };

        match reply {
            Ok(Some(AsgiMessage::LifespanStartupComplete)) => {
                tracing::info!(app = %self.label, "Lifespan startup complete");
                Ok(LifespanStart::Started)
            }
            Ok(Some(AsgiMessage::LifespanStartupFailed { message })) => {
                Err(self.startup_failure(if message.is_empty() {
                    "lifespan startup failed".to_string()
                } else {
                    message
                }))
            }
            Ok(Some(other)) => Err(self.startup_failure(format!(
                "unexpected {} during lifespan startup",
                other.kind()
            ))),
            Ok(None) => self.ended_without_reply(deadline).await,
            Err(_) => Err(self.startup_failure(format!(
                "lifespan startup timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// The guest closed the connection before answering. A clean return
    /// means it does not speak lifespan; an error is a failed startup.
    async fn ended_without_reply(&mut self, deadline: Instant) -> Result<LifespanStart, ManagerError> {
        self.supported = false;
        self.to_guest = None;
        let Some(task) = self.task.as_mut() else {
            return Ok(LifespanStart::Unsupported);
        };
        let finished = tokio::time::timeout_at(deadline, task).await;
        if finished.is_ok() {
            self.task = None;
        }
        match finished {
            Ok(Ok(Ok(()))) => {
                tracing::warn!(
                    app = %self.label,
                    "Application returned without answering lifespan startup; continuing without lifespan"
                );
                Ok(LifespanStart::Unsupported)
            }
            Ok(Ok(Err(reason))) => Err(self.startup_failure(reason)),
            Ok(Err(join)) => Err(self.startup_failure(join.to_string())),
            Err(_) => Err(self.startup_failure(
                "lifespan connection closed without a startup reply".to_string(),
            )),
        }
    }

    fn startup_failure(&self, reason: String) -> ManagerError {
        ManagerError::StartupFailure {
            app: self.label.clone(),
            reason,
        }
    }

    /// Best-effort shutdown bounded by `timeout`. Never fails.
    pub async fn shutdown(mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        if let Some(tx) = self.to_guest.take()
            && self.supported
            && tx.send(AsgiMessage::LifespanShutdown).await.is_ok()
        {
            match tokio::time::timeout_at(deadline, self.from_guest.recv()).await {
                Ok(Some(AsgiMessage::LifespanShutdownComplete)) => {
                    tracing::info!(app = %self.label, "Lifespan shutdown complete");
                }
                Ok(Some(AsgiMessage::LifespanShutdownFailed { message })) => {
                    tracing::warn!(app = %self.label, reason = %message, "Lifespan shutdown failed");
                }
                Ok(Some(other)) => {
                    tracing::warn!(app = %self.label, kind = other.kind(), "Unexpected message during lifespan shutdown");
                }
                Ok(None) => {
                    tracing::debug!(app = %self.label, "Lifespan connection closed during shutdown");
                }
                Err(_) => {
                    tracing::warn!(
                        app = %self.label,
                        timeout_ms = timeout.as_millis() as u64,
                        "Lifespan shutdown timed out"
                    );
                }
            }
        }

        if let Some(task) = self.task.as_mut()
            && tokio::time::timeout_at(deadline, task).await.is_err()
        {
            tracing::warn!(app = %self.label, "Lifespan task still running after shutdown; aborting");
            return;
        }
        self.task = None;
    }
}

impl Drop for LifespanSession {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn session<F, Fut>(guest: F) -> LifespanSession
    where
        F: FnOnce(GuestChannel) -> Fut,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        LifespanSession::begin("test", move |call| match call {
            GuestCall::Async { channel, .. } => guest(channel),
            GuestCall::Sync(_) => unreachable!("lifespan is always async"),
        })
    }

    #[tokio::test]
    async fn complete_startup_and_shutdown() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let seen = shutdowns.clone();
        let mut lifespan = session(move |mut channel| async move {
            while let Some(message) = channel.receive().await {
                match message {
                    AsgiMessage::LifespanStartup => {
                        channel.send(AsgiMessage::LifespanStartupComplete).await.map_err(|e| e.to_string())?
                    }
                    AsgiMessage::LifespanShutdown => {
                        seen.fetch_add(1, Ordering::SeqCst);
                        channel.send(AsgiMessage::LifespanShutdownComplete).await.map_err(|e| e.to_string())?;
                        return Ok(());
                    }
                    _ => {}
                }
            }
            Ok(())
        });

        assert_eq!(
            lifespan.startup(Duration::from_secs(1)).await.unwrap(),
            LifespanStart::Started
        );
        lifespan.shutdown(Duration::from_secs(1)).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_startup_carries_guest_message() {
        let mut lifespan = session(|mut channel| async move {
            channel.receive().await;
            let _ = channel
                .send(AsgiMessage::LifespanStartupFailed {
                    message: "database unreachable".into(),
                })
                .await;
            Ok(())
        });
        let err = lifespan.startup(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::StartupFailure { ref reason, .. } if reason == "database unreachable"));
    }

    #[tokio::test]
    async fn returning_without_reply_is_unsupported() {
        let mut lifespan = session(|_channel| async { Ok(()) });
        assert_eq!(
            lifespan.startup(Duration::from_secs(1)).await.unwrap(),
            LifespanStart::Unsupported
        );
        // Shutdown does not message a guest that never spoke lifespan.
        lifespan.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn raising_before_reply_is_a_failure() {
        let mut lifespan = session(|_channel| async { Err("import error".to_string()) });
        let err = lifespan.startup(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ManagerError::StartupFailure { ref reason, .. } if reason == "import error"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_guest_times_out() {
        let mut lifespan = session(|mut channel| async move {
            while channel.receive().await.is_some() {}
            Ok(())
        });
        let err = lifespan.startup(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ManagerError::StartupFailure { ref reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_timeout_is_not_fatal() {
        let mut lifespan = session(|mut channel| async move {
            channel.receive().await;
            channel.send(AsgiMessage::LifespanStartupComplete).await.map_err(|e| e.to_string())?;
            // Never answers shutdown and never returns.
            std::future::pending::<()>().await;
            Ok(())
        });
        lifespan.startup(Duration::from_secs(1)).await.unwrap();
        let started = Instant::now();
        lifespan.shutdown(Duration::from_secs(3)).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
