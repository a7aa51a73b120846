//! The calling-convention bridge.
//!
//! Turns one [`HostRequest`] into a guest call in the application's calling
//! convention and writes what the guest produced to the host's
//! [`ResponseSink`]. Anything that fails before a response head went out is
//! answered with a bare 500; guest error detail never reaches the client.

use std::collections::VecDeque;

use bytes::Bytes;
use hatch_core::{
    ApplicationSpec, AsgiMessage, CallingConvention, ConcurrencyModel, Environ, HostRequest,
    HttpScope, RequestBody, ResponseSink, Scope,
};
use hatch_runtime::{GuestCall, GuestChannel, GuestOutcome, HostChannel, SyncRequest};

use crate::error::ManagerError;
use crate::instance::AppInstance;
use crate::serve::reserve;

const ASYNC_CHANNEL_CAPACITY: usize = 8;

/// Serve one request against `instance`, writing the response to `sink`.
pub async fn handle(
    instance: &AppInstance,
    request: HostRequest,
    sink: &mut ResponseSink,
) -> Result<(), ManagerError> {
    let result = match instance.spec().convention {
        CallingConvention::Sync => handle_sync(instance, request, sink).await,
        CallingConvention::Async => handle_async(instance, request, sink).await,
    };
    if let Err(e) = &result {
        tracing::warn!(app = instance.label(), head_sent = sink.head_sent(), "Request failed: {e}");
        sink.send_error().await;
    }
    result
}

async fn handle_sync(
    instance: &AppInstance,
    mut request: HostRequest,
    sink: &mut ResponseSink,
) -> Result<(), ManagerError> {
    let environ = build_environ(&request, instance.spec());
    let input = request.body.read_to_end().await?;

    let response = match instance.dispatch(GuestCall::Sync(SyncRequest { environ, input })).await? {
        GuestOutcome::Sync(response) => response,
        GuestOutcome::AsyncDone => {
            return Err(ManagerError::GuestExecution(
                "sync call finished without a response".into(),
            ));
        }
    };
    let Some(status) = response.status else {
        return Err(ManagerError::GuestExecution(
            "application returned a body without starting the response".into(),
        ));
    };

    if sink.send_head(status, response.headers).await.is_err() {
        tracing::debug!(app = instance.label(), "Client disconnected before the response head");
        return Ok(());
    }
    for chunk in response.chunks {
        if sink.send_chunk(chunk).await.is_err() {
            tracing::debug!(app = instance.label(), "Client disconnected mid-response");
            return Ok(());
        }
    }
    Ok(())
}

/// How the message exchange of one async request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    /// The final body chunk reached the host.
    Completed,
    /// The host went away; the application was told.
    Disconnected,
    /// The application closed its side before finishing the response.
    Incomplete,
}

async fn handle_async(
    instance: &AppInstance,
    mut request: HostRequest,
    sink: &mut ResponseSink,
) -> Result<(), ManagerError> {
    let scope = Scope::Http(build_scope(&request));
    let (channel, host) = GuestChannel::pair(ASYNC_CHANNEL_CAPACITY);

    let (dispatched, exchanged) = tokio::join!(
        instance.dispatch(GuestCall::Async { scope, channel }),
        exchange(host, &mut request.body, sink),
    );

    match (dispatched, exchanged) {
        (Err(e), Exchange::Completed) => {
            tracing::warn!(app = instance.label(), "Application failed after completing its response: {e}");
            Ok(())
        }
        (Err(e), Exchange::Disconnected) => {
            tracing::debug!(app = instance.label(), "Application ended after client disconnect: {e}");
            Ok(())
        }
        (Err(e), Exchange::Incomplete) => Err(e),
        (Ok(_), Exchange::Completed | Exchange::Disconnected) => Ok(()),
        (Ok(_), Exchange::Incomplete) if sink.head_sent() => {
            tracing::warn!(app = instance.label(), "Application returned before finishing its response");
            Ok(())
        }
        (Ok(_), Exchange::Incomplete) => Err(ManagerError::GuestExecution(
            "application returned without sending a response".into(),
        )),
    }
}

/// Relay messages between the host request/response and the guest channel.
async fn exchange(host: HostChannel, body: &mut RequestBody, sink: &mut ResponseSink) -> Exchange {
    let HostChannel {
        to_guest,
        mut from_guest,
    } = host;
    let mut to_guest = Some(to_guest);
    let mut outgoing: VecDeque<AsgiMessage> = VecDeque::new();
    // One chunk of lookahead, so the last request message carries more_body = false.
    let mut held: Option<Bytes> = None;
    let mut body_done = false;
    let mut started = false;
    let mut disconnected = false;

    loop {
        let mut lost_client = false;
        let mut close_to_guest = false;
        tokio::select! {
            message = from_guest.recv() => match message {
                None => {
                    return if disconnected {
                        Exchange::Disconnected
                    } else {
                        Exchange::Incomplete
                    };
                }
                Some(AsgiMessage::HttpResponseStart { status, headers }) => {
                    if started {
                        tracing::warn!("Ignoring a second http.response.start");
                    } else if !disconnected {
                        started = true;
                        lost_client = sink.send_head(status, headers).await.is_err();
                    }
                }
                Some(AsgiMessage::HttpResponseBody { body, more_body }) => {
                    if !started {
                        tracing::warn!("http.response.body before http.response.start");
                        return Exchange::Incomplete;
                    }
                    if !disconnected {
                        lost_client = sink.send_chunk(body).await.is_err();
                    }
                    if !more_body && !lost_client {
                        return Exchange::Completed;
                    }
                }
                Some(other) => {
                    tracing::warn!(kind = other.kind(), "Unexpected message from application");
                }
            },
            _ = sink.closed(), if !disconnected => lost_client = true,
            chunk = body.next_chunk(), if !body_done && outgoing.len() < 2 => match chunk {
                Ok(Some(chunk)) => {
                    if let Some(previous) = held.replace(chunk) {
                        outgoing.push_back(AsgiMessage::HttpRequest {
                            body: previous,
                            more_body: true,
                        });
                    }
                }
                Ok(None) => {
                    body_done = true;
                    outgoing.push_back(AsgiMessage::HttpRequest {
                        body: held.take().unwrap_or_default(),
                        more_body: false,
                    });
                }
                Err(e) => {
                    tracing::debug!("Request body failed: {e}");
                    lost_client = true;
                }
            },
            permit = reserve(to_guest.as_ref()), if !outgoing.is_empty() => match permit {
                Some(permit) => {
                    match outgoing.pop_front() {
                        Some(message) => permit.send(message),
                        None => drop(permit),
                    }
                    if disconnected && outgoing.is_empty() {
                        return Exchange::Disconnected;
                    }
                }
                None => {
                    // The application stopped listening.
                    outgoing.clear();
                    close_to_guest = true;
                    if disconnected {
                        return Exchange::Disconnected;
                    }
                }
            },
        }
        if close_to_guest {
            to_guest = None;
        }

        if lost_client && !disconnected {
            tracing::debug!("Client disconnected; notifying application");
            disconnected = true;
            body_done = true;
            held = None;
            outgoing.clear();
            if to_guest.is_none() {
                return Exchange::Disconnected;
            }
            outgoing.push_back(AsgiMessage::HttpDisconnect);
        }
    }
}

/// The sync-convention environment for `request`.
pub fn build_environ(request: &HostRequest, spec: &ApplicationSpec) -> Environ {
    let mut environ = Environ::new();
    let mut set = |key: &str, value: String| {
        environ.insert(key.to_string(), value);
    };

    set("REQUEST_METHOD", request.method.to_ascii_uppercase());
    set("SCRIPT_NAME", String::new());
    set("PATH_INFO", decode_path(&request.path));
    set("QUERY_STRING", request.query_string.clone());
    set("SERVER_NAME", request.server.0.clone());
    set("SERVER_PORT", request.server.1.to_string());
    set("SERVER_PROTOCOL", format!("HTTP/{}", request.http_version));
    match &request.client {
        Some((addr, port)) => {
            set("REMOTE_ADDR", addr.clone());
            set("REMOTE_PORT", port.to_string());
        }
        None => set("REMOTE_ADDR", String::new()),
    }

    set("wsgi.version", "1.0".into());
    set("wsgi.url_scheme", request.scheme.clone());
    let threaded = spec.concurrency == ConcurrencyModel::SingleThreaded;
    set("wsgi.multithread", threaded.to_string());
    set(
        "wsgi.multiprocess",
        (!threaded && spec.workers > 1).to_string(),
    );
    set("wsgi.run_once", "false".into());

    for (name, value) in &request.headers {
        let key = if name.eq_ignore_ascii_case("content-type") {
            "CONTENT_TYPE".to_string()
        } else if name.eq_ignore_ascii_case("content-length") {
            "CONTENT_LENGTH".to_string()
        } else if name.eq_ignore_ascii_case("proxy") {
            // Never let a client set HTTP_PROXY for the application.
            continue;
        } else {
            format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"))
        };
        let separator = if key == "HTTP_COOKIE" { "; " } else { ", " };
        environ
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    environ
}

/// The async-convention HTTP scope for `request`.
pub fn build_scope(request: &HostRequest) -> HttpScope {
    HttpScope {
        http_version: request.http_version.clone(),
        method: request.method.to_ascii_uppercase(),
        scheme: request.scheme.clone(),
        path: decode_path(&request.path),
        raw_path: request.path.clone(),
        query_string: request.query_string.clone(),
        headers: request
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect(),
        client: request.client.clone(),
        server: Some(request.server.clone()),
        ..HttpScope::new("GET", "/")
    }
}

fn decode_path(raw: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned()
}
