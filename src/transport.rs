// src/transport.rs

//! The boundary between the cache and whatever actually moves bytes.
//!
//! The cache only needs "start one transfer and hand me the status line and a
//! body stream". Redirects, TLS and connection reuse belong to the
//! implementation; [`HttpTransport`] is the reqwest-backed one.

use crate::config::CacheConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{header, redirect, Client, ClientBuilder, Url};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Which request a transfer performs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferBody {
    #[default]
    Get,
    /// Form-encoded POST body.
    Post(Vec<u8>),
    /// JSON upload.
    Put(Vec<u8>),
}

impl TransferBody {
    /// Picks the method from the bodies present. A PUT body wins over a POST body.
    pub fn select(post: Option<Vec<u8>>, put: Option<Vec<u8>>) -> Self {
        match (post, put) {
            (_, Some(put)) => TransferBody::Put(put),
            (Some(post), None) => TransferBody::Post(post),
            (None, None) => TransferBody::Get,
        }
    }
}

/// Parameters of one transfer, fixed for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub cert: Option<PathBuf>,
    pub body: TransferBody,
}

impl TransferRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cert: None,
            body: TransferBody::Get,
        }
    }

    pub fn with_cert(mut self, cert: Option<PathBuf>) -> Self {
        self.cert = cert;
        self
    }

    pub fn with_body(mut self, body: TransferBody) -> Self {
        self.body = body;
        self
    }
}

/// Transport-level failure categories. The numeric value is what a worker
/// reports as its error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TransportErrorKind {
    InvalidRequest = 1,
    ResolveProxy = 2,
    ResolveHost = 3,
    Connect = 4,
    TimedOut = 5,
    PartialTransfer = 6,
    EmptyResponse = 7,
    Certificate = 8,
    Other = 9,
}

impl TransportErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Failures that usually mean the local network is broken rather than
    /// the server refusing us.
    pub fn is_network_failure(self) -> bool {
        matches!(
            self,
            TransportErrorKind::TimedOut
                | TransportErrorKind::PartialTransfer
                | TransportErrorKind::EmptyResponse
                | TransportErrorKind::ResolveProxy
                | TransportErrorKind::ResolveHost
                | TransportErrorKind::Connect
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportErrorKind::InvalidRequest => "malformed request",
            TransportErrorKind::ResolveProxy => "couldn't resolve proxy name",
            TransportErrorKind::ResolveHost => "couldn't resolve host name",
            TransportErrorKind::Connect => "couldn't connect to server",
            TransportErrorKind::TimedOut => "timeout was reached",
            TransportErrorKind::PartialTransfer => "transferred a partial file",
            TransportErrorKind::EmptyResponse => "server returned nothing",
            TransportErrorKind::Certificate => "problem with the certificate bundle",
            TransportErrorKind::Other => "transfer failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} ({message})")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::new(TransportErrorKind::TimedOut, "no data received")
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_builder() {
            TransportErrorKind::InvalidRequest
        } else if e.is_timeout() {
            TransportErrorKind::TimedOut
        } else if e.is_connect() {
            if mentions_dns(&e) {
                TransportErrorKind::ResolveHost
            } else {
                TransportErrorKind::Connect
            }
        } else if e.is_body() || e.is_decode() {
            TransportErrorKind::PartialTransfer
        } else if e.is_request() {
            TransportErrorKind::EmptyResponse
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, e.to_string())
    }
}

fn mentions_dns(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = e.source();
    while let Some(err) = source {
        let text = err.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

/// Status line and body of a started transfer.
pub struct TransportResponse {
    pub status: u16,
    /// Total body size when the remote announced it.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Starts transfers. Implementations must not retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, request: &TransferRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport. Clients are reused, one per certificate bundle.
pub struct HttpTransport {
    client: Client,
    user_agent: String,
    connect_timeout: Duration,
    cert_clients: Mutex<HashMap<PathBuf, Client>>,
}

impl HttpTransport {
    pub fn new(config: &CacheConfig) -> Result<Self, TransportError> {
        let client = Self::builder(&config.user_agent, config.connect_timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            cert_clients: Mutex::new(HashMap::new()),
        })
    }

    fn builder(user_agent: &str, connect_timeout: Duration) -> ClientBuilder {
        Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .redirect(redirect::Policy::limited(10))
    }

    async fn client_for(&self, cert: Option<&Path>) -> Result<Client, TransportError> {
        let Some(cert) = cert else {
            return Ok(self.client.clone());
        };

        let mut clients = self.cert_clients.lock().await;
        if let Some(client) = clients.get(cert) {
            return Ok(client.clone());
        }

        let pem = tokio::fs::read(cert).await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Certificate,
                format!("{}: {}", cert.display(), e),
            )
        })?;
        let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Certificate,
                format!("{}: {}", cert.display(), e),
            )
        })?;
        let client = Self::builder(&self.user_agent, self.connect_timeout)
            .add_root_certificate(certificate)
            .build()
            .map_err(TransportError::from)?;

        debug!(cert = %cert.display(), "Built client for certificate bundle");
        clients.insert(cert.to_path_buf(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&self, request: &TransferRequest) -> Result<TransportResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::new(TransportErrorKind::InvalidRequest, e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::new(
                TransportErrorKind::InvalidRequest,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        let client = self.client_for(request.cert.as_deref()).await?;
        let builder = match &request.body {
            TransferBody::Get => client.get(url),
            TransferBody::Post(body) => client
                .post(url)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body.clone()),
            TransferBody::Put(body) => client
                .put(url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
        };

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let body = resp.bytes_stream().map_err(TransportError::from).boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}
