use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// HTTP methods used by the server API.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "DELETE")]
    Delete,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A fully resolved request, ready to be sent by an [`HttpBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub json: Option<Value>,
}

impl HttpRequest {
    /// The value of the first header called `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

/// A response whose body has been read.
///
/// Empty bodies are [`Value::Null`], bodies that aren't JSON are kept as
/// [`Value::String`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Error returned by an [`HttpBackend`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server could not be reached or did not answer in time. Requests
    /// failing this way are retried.
    #[error("failed to reach the server: {0}")]
    Connection(String),
    #[error("HTTP request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Connection(format!("{}", e))
        } else {
            Self::Other(format!("{}", e))
        }
    }
}

/// A basic HTTP interface that [`Client`] backends must implement.
///
/// [`Client`]: crate::Client
#[async_trait]
pub trait HttpBackend: Send + Sync + 'static {
    /// Sends the request and reads the whole response body.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl HttpBackend for reqwest::Client {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            json,
        } = request;
        let mut builder = self.request(method.into(), url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(json) = json {
            builder = builder.json(&json);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(HttpResponse { status, body })
    }
}

/// Builds the reqwest backend. `timeout` is the deadline of a whole request.
pub fn reqwest_backend(timeout: Option<Duration>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::ClientBuilder::new();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}
