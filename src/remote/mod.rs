//! Remote deployment transport.
//!
//! A [`CallDescriptor`] fully describes one call (credential and body already
//! resolved). A [`Transport`] issues it once and reports what came back; all
//! retry and concurrency handling lives in the engine.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use reqwest::Method;
use thiserror::Error;

use crate::config::secrets::SecretString;
/// One fully resolved remote call.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub method: Method,
    /// Path relative to the deployment URL, e.g. `api/webtask/acme`.
    pub path: String,
    pub credential: Option<SecretString>,
    pub body: Option<serde_json::Value>,
}

impl CallDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            credential: None,
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn credential(mut self, credential: SecretString) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// What the remote side answered.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Decoded JSON body. Non-JSON text is kept as a JSON string; an empty
    /// body is `None`.
    pub body: Option<serde_json::Value>,
}

impl Response {
    /// The `message` field of an error body, if present.
    pub fn message(&self) -> Option<String> {
        self.body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    }
}

/// The call produced no response at all.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportFailure(pub String);

/// Issues a single remote call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn issue(&self, call: &CallDescriptor) -> Result<Response, TransportFailure>;
}
