//! reqwest-backed transport.

use async_trait::async_trait;
use tracing::debug;

use super::{CallDescriptor, Response, Transport, TransportFailure};
use crate::config::secrets::ExposeSecret;
use crate::error::{Error, Result};

/// Issues calls against a deployment base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    deployment_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(deployment_url: &str) -> Result<Self> {
        let deployment_url = deployment_url.trim_end_matches('/');
        if deployment_url.is_empty() {
            return Err(Error::Validation("deployment url required".to_string()));
        }

        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            deployment_url: deployment_url.to_string(),
            client,
        })
    }

    pub fn deployment_url(&self) -> &str {
        &self.deployment_url
    }

    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.deployment_url.clone()
        } else {
            format!("{}/{path}", self.deployment_url)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn issue(&self, call: &CallDescriptor) -> std::result::Result<Response, TransportFailure> {
        let url = self.url_for(&call.path);
        let mut request = self.client.request(call.method.clone(), &url);

        if let Some(credential) = &call.credential {
            request = request.bearer_auth(credential.expose_secret());
        }
        request = match &call.body {
            Some(serde_json::Value::String(text)) => request.body(text.clone()),
            Some(body) => request.json(body),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| TransportFailure(e.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportFailure(e.to_string()))?;

        debug!(method = %call.method, %url, status, len = bytes.len(), "remote call answered");

        let body = if bytes.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }))
        };

        Ok(Response { status, body })
    }
}
