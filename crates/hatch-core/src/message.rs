use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Environment map handed to a sync-convention callable.
pub type Environ = BTreeMap<String, String>;

/// Serde helper: `Bytes` as a base64 string.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Serde helper: `Vec<Bytes>` as a list of base64 strings.
pub mod b64_seq {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(chunks: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(chunks.iter().map(|c| STANDARD.encode(c)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Bytes>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|s| {
                STANDARD
                    .decode(s.as_bytes())
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Version block carried by every async scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsgiVersion {
    pub version: String,
    pub spec_version: String,
}

impl Default for AsgiVersion {
    fn default() -> Self {
        Self {
            version: "3.0".into(),
            spec_version: "2.3".into(),
        }
    }
}

/// Connection scope for the async convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scope {
    Http(HttpScope),
    Lifespan {
        #[serde(default)]
        asgi: AsgiVersion,
    },
}

impl Scope {
    pub fn lifespan() -> Self {
        Scope::Lifespan {
            asgi: AsgiVersion::default(),
        }
    }

    pub fn is_lifespan(&self) -> bool {
        matches!(self, Scope::Lifespan { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpScope {
    #[serde(default)]
    pub asgi: AsgiVersion,
    pub http_version: String,
    pub method: String,
    pub scheme: String,
    /// Percent-decoded path.
    pub path: String,
    pub raw_path: String,
    pub query_string: String,
    #[serde(default)]
    pub root_path: String,
    /// Header names are lower-cased.
    pub headers: Vec<(String, String)>,
    pub client: Option<(String, u16)>,
    pub server: Option<(String, u16)>,
}

impl HttpScope {
    /// A plain HTTP/1.1 scope with no headers or addresses.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            asgi: AsgiVersion::default(),
            http_version: "1.1".into(),
            method: method.into(),
            scheme: "http".into(),
            raw_path: path.clone(),
            path,
            query_string: String::new(),
            root_path: String::new(),
            headers: Vec::new(),
            client: None,
            server: None,
        }
    }
}

/// A typed message exchanged with an async-convention application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AsgiMessage {
    #[serde(rename = "http.request")]
    HttpRequest {
        #[serde(with = "b64", default)]
        body: Bytes,
        #[serde(default)]
        more_body: bool,
    },
    #[serde(rename = "http.disconnect")]
    HttpDisconnect,
    #[serde(rename = "http.response.start")]
    HttpResponseStart {
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    #[serde(rename = "http.response.body")]
    HttpResponseBody {
        #[serde(with = "b64", default)]
        body: Bytes,
        #[serde(default)]
        more_body: bool,
    },
    #[serde(rename = "lifespan.startup")]
    LifespanStartup,
    #[serde(rename = "lifespan.startup.complete")]
    LifespanStartupComplete,
    #[serde(rename = "lifespan.startup.failed")]
    LifespanStartupFailed {
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "lifespan.shutdown")]
    LifespanShutdown,
    #[serde(rename = "lifespan.shutdown.complete")]
    LifespanShutdownComplete,
    #[serde(rename = "lifespan.shutdown.failed")]
    LifespanShutdownFailed {
        #[serde(default)]
        message: String,
    },
}

impl AsgiMessage {
    /// The `type` string this message is tagged with on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            AsgiMessage::HttpRequest { .. } => "http.request",
            AsgiMessage::HttpDisconnect => "http.disconnect",
            AsgiMessage::HttpResponseStart { .. } => "http.response.start",
            AsgiMessage::HttpResponseBody { .. } => "http.response.body",
            AsgiMessage::LifespanStartup => "lifespan.startup",
            AsgiMessage::LifespanStartupComplete => "lifespan.startup.complete",
            AsgiMessage::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            AsgiMessage::LifespanShutdown => "lifespan.shutdown",
            AsgiMessage::LifespanShutdownComplete => "lifespan.shutdown.complete",
            AsgiMessage::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }

    /// Host-originated messages after which the guest is expected to act.
    ///
    /// Runtimes that cannot suspend mid-call batch incoming messages up to a
    /// dispatch point and hand the whole batch to the guest at once.
    pub fn is_dispatch_point(&self) -> bool {
        matches!(
            self,
            AsgiMessage::HttpRequest {
                more_body: false,
                ..
            } | AsgiMessage::HttpDisconnect
                | AsgiMessage::LifespanStartup
                | AsgiMessage::LifespanShutdown
        )
    }
}
