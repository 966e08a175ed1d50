use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::TransferStatus;
use crate::transport::{Transport, TransportError, TransportErrorKind, TransferRequest};

/// Upper bound on what an announced content length may pre-reserve.
const MAX_UPFRONT_RESERVE: u64 = 64 * 1024 * 1024;

/// How a finished transfer failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("server answered with status {status}")]
    Http { status: u16, body: Vec<u8> },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl TransferError {
    /// HTTP status, or the transport kind's code.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Http { status, .. } => i32::from(*status),
            TransferError::Transport(e) => e.kind.code(),
        }
    }

    pub fn is_network_failure(&self) -> bool {
        match self {
            TransferError::Http { .. } => false,
            TransferError::Transport(e) => e.kind.is_network_failure(),
        }
    }
}

/// Per-transfer knobs.
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    /// Abort when no bytes arrive for this long.
    pub inactivity_timeout: Duration,
    /// Initial buffer capacity.
    pub buffer_hint: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30),
            buffer_hint: 0,
        }
    }
}

enum Outcome {
    Done(Vec<u8>),
    Failed(TransferError),
}

/// State shared between the worker's task and whoever polls it. The scalar
/// fields are written by the task and read concurrently; `outcome` is set
/// exactly once, before `status` turns terminal.
struct Shared {
    progress: AtomicI32,
    status: AtomicU8,
    error_code: AtomicI32,
    outcome: OnceLock<Outcome>,
}

impl Shared {
    fn new() -> Self {
        Self {
            progress: AtomicI32::new(-1),
            status: AtomicU8::new(TransferStatus::InProgress as u8),
            error_code: AtomicI32::new(0),
            outcome: OnceLock::new(),
        }
    }

    fn finish(&self, outcome: Outcome) {
        let status = match &outcome {
            Outcome::Done(_) => {
                self.progress.store(100, Ordering::Relaxed);
                TransferStatus::DoneOk
            }
            Outcome::Failed(e) => {
                self.error_code.store(e.code(), Ordering::Relaxed);
                TransferStatus::DoneError
            }
        };
        if self.outcome.set(outcome).is_err() {
            return;
        }
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Runs exactly one transfer on its own tokio task.
///
/// Everything about the transfer is fixed at [`TransferWorker::start`]. Callers
/// poll [`progress`](Self::progress) and [`is_done`](Self::is_done); the
/// received bytes become readable only once the worker is done.
pub struct TransferWorker {
    url: String,
    shared: Arc<Shared>,
    halt: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TransferWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferWorker")
            .field("url", &self.url)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

impl TransferWorker {
    /// Spawn the transfer. Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        request: TransferRequest,
        settings: TransferSettings,
    ) -> Self {
        let shared = Arc::new(Shared::new());
        let halt = CancellationToken::new();
        let url = request.url.clone();

        let task = {
            let shared = shared.clone();
            let halt = halt.clone();
            tokio::spawn(async move {
                let outcome = match perform(transport.as_ref(), &request, settings, &shared, &halt).await
                {
                    Ok(buffer) => {
                        debug!(url = %request.url, bytes = buffer.len(), "Transfer finished");
                        Outcome::Done(buffer)
                    }
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Transfer failed");
                        Outcome::Failed(e)
                    }
                };
                shared.finish(outcome);
            })
        };

        Self {
            url,
            shared,
            halt,
            task: Some(task),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Percent complete, or -1 until the remote has announced a size.
    pub fn progress(&self) -> i32 {
        self.shared.progress.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_u8(self.shared.status.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_ok(&self) -> bool {
        self.status() == TransferStatus::DoneOk
    }

    /// Whether cancellation has been requested.
    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// The failure, once the worker is done with an error.
    pub fn error(&self) -> Option<&TransferError> {
        if self.status() != TransferStatus::DoneError {
            return None;
        }
        match self.shared.outcome.get() {
            Some(Outcome::Failed(e)) => Some(e),
            _ => None,
        }
    }

    /// HTTP status or transport code of the failure; 0 while not failed.
    pub fn error_code(&self) -> i32 {
        if self.status() != TransferStatus::DoneError {
            return 0;
        }
        self.shared.error_code.load(Ordering::Relaxed)
    }

    pub fn is_network_failure(&self) -> bool {
        self.error().is_some_and(TransferError::is_network_failure)
    }

    /// Whatever the server sent along with a non-success status.
    pub fn error_body(&self) -> Option<&[u8]> {
        match self.error() {
            Some(TransferError::Http { body, .. }) => Some(body),
            _ => None,
        }
    }

    /// The received bytes, once the worker finished successfully.
    pub fn buffer(&self) -> Option<&[u8]> {
        if self.status() != TransferStatus::DoneOk {
            return None;
        }
        match self.shared.outcome.get() {
            Some(Outcome::Done(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// Ask the transfer to stop at its next progress tick.
    pub fn halt(&self) {
        self.halt.cancel();
    }

    /// Halt the transfer and wait until its task has exited.
    pub async fn stop(mut self) {
        self.halt.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(url = %self.url, "Transfer task panicked");
                }
            }
        }
    }
}

impl Drop for TransferWorker {
    /// Without an async context we can't wait for the task, so it is halted
    /// and aborted instead. Prefer [`TransferWorker::stop`].
    fn drop(&mut self) {
        self.halt.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn timed_out() -> TransferError {
    TransferError::Transport(TransportError::timed_out())
}

/// One attempt. Every await is raced against the halt token and the
/// inactivity watchdog; both end the transfer with a timeout.
async fn perform(
    transport: &dyn Transport,
    request: &TransferRequest,
    settings: TransferSettings,
    shared: &Shared,
    halt: &CancellationToken,
) -> Result<Vec<u8>, TransferError> {
    let started = tokio::select! {
        biased;
        _ = halt.cancelled() => return Err(timed_out()),
        started = tokio::time::timeout(settings.inactivity_timeout, transport.start(request)) => started,
    };
    let response = started.map_err(|_| timed_out())??;

    let mut buffer = Vec::with_capacity(settings.buffer_hint);
    let total = response.content_length.filter(|len| *len > 0);
    if let Some(total) = total {
        let wanted = total.min(MAX_UPFRONT_RESERVE) as usize;
        buffer.reserve(wanted.saturating_sub(buffer.len()));
        shared.progress.store(0, Ordering::Relaxed);
    }

    let mut body = response.body;
    let mut received: u64 = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = halt.cancelled() => return Err(timed_out()),
            next = tokio::time::timeout(settings.inactivity_timeout, body.next()) => next,
        };
        let chunk = match next {
            Err(_) => return Err(timed_out()),
            Ok(None) => break,
            Ok(Some(chunk)) => chunk?,
        };

        buffer.extend_from_slice(&chunk);
        received += chunk.len() as u64;
        if let Some(total) = total {
            let percent = (received.saturating_mul(100) / total).min(100);
            shared.progress.store(percent as i32, Ordering::Relaxed);
        }
    }

    if !(200..300).contains(&response.status) {
        return Err(TransferError::Http {
            status: response.status,
            body: buffer,
        });
    }
    if let Some(total) = total {
        if received < total {
            return Err(TransferError::Transport(TransportError::new(
                TransportErrorKind::PartialTransfer,
                format!("received {} of {} bytes", received, total),
            )));
        }
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{init_tracing, Script, ScriptedTransport};
    use crate::transport::TransferBody;
    use tokio::sync::Notify;

    const URL: &str = "http://example.com/a.txt";

    async fn wait_until_done(worker: &TransferWorker) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !worker.is_done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never finished");
    }

    fn start(transport: &Arc<ScriptedTransport>, settings: TransferSettings) -> TransferWorker {
        TransferWorker::start(transport.clone(), TransferRequest::get(URL), settings)
    }

    #[tokio::test]
    async fn successful_transfer_fills_the_buffer() {
        init_tracing();
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::ok("hello"));

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;

        assert!(worker.is_ok());
        assert_eq!(worker.progress(), 100);
        assert_eq!(worker.buffer(), Some(&b"hello"[..]));
        assert_eq!(worker.error_code(), 0);
        assert!(worker.error().is_none());
    }

    #[tokio::test]
    async fn progress_is_unknown_until_a_size_arrives() {
        let transport = ScriptedTransport::new();
        let gate = Arc::new(Notify::new());
        transport.script(
            URL,
            Script::Gated {
                status: 200,
                body: b"0123456789".to_vec(),
                gate: gate.clone(),
            },
        );

        let worker = start(&transport, TransferSettings::default());
        assert!(!worker.is_done());
        assert!(worker.buffer().is_none());
        assert!(worker.progress() == -1 || worker.progress() == 0);

        gate.notify_one();
        wait_until_done(&worker).await;
        assert_eq!(worker.buffer(), Some(&b"0123456789"[..]));
    }

    #[tokio::test]
    async fn http_error_keeps_status_and_body() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::status(404, "no such airport"));

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;

        assert!(!worker.is_ok());
        assert_eq!(worker.error_code(), 404);
        assert!(!worker.is_network_failure());
        assert_eq!(worker.error_body(), Some(&b"no such airport"[..]));
        assert!(worker.buffer().is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_flagged_as_network() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::Fail(TransportErrorKind::ResolveHost));

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;

        assert_eq!(worker.error_code(), TransportErrorKind::ResolveHost.code());
        assert!(worker.is_network_failure());
        assert!(worker.error_body().is_none());
    }

    #[tokio::test]
    async fn silent_remote_trips_the_watchdog() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::Stall);

        let settings = TransferSettings {
            inactivity_timeout: Duration::from_millis(50),
            buffer_hint: 0,
        };
        let worker = start(&transport, settings);
        wait_until_done(&worker).await;

        assert_eq!(worker.error_code(), TransportErrorKind::TimedOut.code());
        assert!(worker.is_network_failure());
    }

    #[tokio::test]
    async fn short_body_is_a_partial_transfer() {
        let transport = ScriptedTransport::new();
        transport.script(
            URL,
            Script::Truncated {
                declared: 100,
                body: b"abc".to_vec(),
            },
        );

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;
        assert_eq!(worker.error_code(), TransportErrorKind::PartialTransfer.code());
    }

    #[tokio::test]
    async fn halt_reports_a_timeout() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::Stall);

        let worker = start(&transport, TransferSettings::default());
        worker.halt();
        assert!(worker.is_halted());
        wait_until_done(&worker).await;

        assert_eq!(worker.error_code(), TransportErrorKind::TimedOut.code());
    }

    #[tokio::test]
    async fn stop_returns_for_a_hung_transfer() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::Stall);

        let worker = start(&transport, TransferSettings::default());
        tokio::time::timeout(Duration::from_secs(5), worker.stop())
            .await
            .expect("stop deadlocked");
    }

    #[tokio::test]
    async fn post_body_reaches_the_transport() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::ok("created"));

        let request =
            TransferRequest::get(URL).with_body(TransferBody::select(Some(b"a=1".to_vec()), None));
        let worker = TransferWorker::start(transport.clone(), request, TransferSettings::default());
        wait_until_done(&worker).await;

        assert!(worker.is_ok());
        assert_eq!(transport.last_body(URL), Some(TransferBody::Post(b"a=1".to_vec())));
    }

    #[tokio::test]
    async fn finished_buffer_survives_a_halt() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::ok("hello"));

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;
        assert_eq!(worker.status(), TransferStatus::DoneOk);

        worker.halt();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.status(), TransferStatus::DoneOk);
        assert!(worker.is_ok());
        assert_eq!(worker.progress(), 100);
        assert_eq!(worker.error_code(), 0);
        assert_eq!(worker.buffer(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn terminal_state_does_not_change() {
        let transport = ScriptedTransport::new();
        transport.script(URL, Script::status(500, "boom"));

        let worker = start(&transport, TransferSettings::default());
        wait_until_done(&worker).await;
        let first = (worker.status(), worker.error_code(), worker.error().cloned());

        worker.halt();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            (worker.status(), worker.error_code(), worker.error().cloned()),
            first
        );
    }
}
