// src/test_support.rs

//! In-process transport used by the unit tests. Nothing here touches the network.

use crate::transport::{
    Transport, TransferBody, TransportError, TransportErrorKind, TransportResponse, TransferRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// How the fake remote answers one URL.
#[derive(Clone)]
pub enum Script {
    Respond { status: u16, body: Vec<u8> },
    /// The transfer fails before any response arrives.
    Fail(TransportErrorKind),
    /// Headers arrive, the body never does.
    Stall,
    /// The body is released once `gate` is notified.
    Gated {
        status: u16,
        body: Vec<u8>,
        gate: Arc<Notify>,
    },
    /// Announces `declared` bytes but closes the stream after `body`.
    Truncated { declared: u64, body: Vec<u8> },
}

impl Script {
    pub fn ok(body: &str) -> Self {
        Script::Respond {
            status: 200,
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Script::Respond {
            status,
            body: body.as_bytes().to_vec(),
        }
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    bodies: Mutex<HashMap<String, TransferBody>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    /// Body of the most recent transfer started for `url`.
    pub fn last_body(&self, url: &str) -> Option<TransferBody> {
        self.bodies.lock().unwrap().get(url).cloned()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

fn chunked(body: Vec<u8>) -> Vec<Result<Bytes, TransportError>> {
    let mid = body.len() / 2;
    let (head, tail) = body.split_at(mid);
    [head, tail]
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn start(&self, request: &TransferRequest) -> Result<TransportResponse, TransportError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_insert(0) += 1;
        self.bodies
            .lock()
            .unwrap()
            .insert(request.url.clone(), request.body.clone());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Script::status(404, "not found"));

        match script {
            Script::Respond { status, body } => Ok(TransportResponse {
                status,
                content_length: Some(body.len() as u64),
                body: stream::iter(chunked(body)).boxed(),
            }),
            Script::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
            Script::Stall => Ok(TransportResponse {
                status: 200,
                content_length: None,
                body: stream::pending().boxed(),
            }),
            Script::Gated { status, body, gate } => Ok(TransportResponse {
                status,
                content_length: Some(body.len() as u64),
                body: stream::once(async move {
                    gate.notified().await;
                    Ok(Bytes::from(body))
                })
                .boxed(),
            }),
            Script::Truncated { declared, body } => Ok(TransportResponse {
                status: 200,
                content_length: Some(declared),
                body: stream::iter(chunked(body)).boxed(),
            }),
        }
    }
}
