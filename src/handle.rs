use std::sync::Arc;

use tracing::debug;

use crate::downloader::{TransferSettings, TransferWorker};
use crate::transport::{Transport, TransferRequest};

/// Owns at most one [`TransferWorker`].
///
/// Opening a new transfer stops the previous one first, and closing waits for
/// the worker's task to exit, so no transfer outlives its handle.
pub struct ScopedTransferHandle {
    transport: Arc<dyn Transport>,
    worker: Option<TransferWorker>,
}

impl std::fmt::Debug for ScopedTransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedTransferHandle")
            .field("worker", &self.worker)
            .finish()
    }
}

impl ScopedTransferHandle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            worker: None,
        }
    }

    /// Stop whatever is running and start `request`.
    pub async fn open(&mut self, request: TransferRequest, settings: TransferSettings) {
        self.close().await;
        debug!(url = %request.url, "Starting transfer");
        self.worker = Some(TransferWorker::start(
            self.transport.clone(),
            request,
            settings,
        ));
    }

    pub fn get(&self) -> Option<&TransferWorker> {
        self.worker.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    /// Read-only view of the received bytes once the transfer succeeded.
    pub fn dest_buffer(&self) -> Option<&[u8]> {
        self.worker.as_ref().and_then(TransferWorker::buffer)
    }

    /// Stop and release the owned worker. A no-op when nothing is owned.
    pub async fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(url = %worker.url(), done = worker.is_done(), "Closing transfer");
            worker.stop().await;
        }
    }
}

// Dropping the handle drops the worker, which halts and aborts its task.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Script, ScriptedTransport};
    use std::time::Duration;

    #[tokio::test]
    async fn close_on_an_empty_handle_is_harmless() {
        let mut handle = ScopedTransferHandle::new(ScriptedTransport::new());
        handle.close().await;
        handle.close().await;
        assert!(handle.get().is_none());
        assert!(handle.dest_buffer().is_none());
    }

    #[tokio::test]
    async fn reopening_replaces_the_running_worker() {
        let transport = ScriptedTransport::new();
        transport.script("http://x/slow", Script::Stall);
        transport.script("http://x/fast", Script::ok("fast"));

        let mut handle = ScopedTransferHandle::new(transport.clone());
        handle
            .open(TransferRequest::get("http://x/slow"), TransferSettings::default())
            .await;
        assert_eq!(handle.get().map(TransferWorker::url), Some("http://x/slow"));

        tokio::time::timeout(
            Duration::from_secs(5),
            handle.open(TransferRequest::get("http://x/fast"), TransferSettings::default()),
        )
        .await
        .expect("replacing a hung transfer must not block forever");
        assert_eq!(handle.get().map(TransferWorker::url), Some("http://x/fast"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.dest_buffer().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.dest_buffer(), Some(&b"fast"[..]));
    }

    #[tokio::test]
    async fn close_releases_an_in_flight_worker() {
        let transport = ScriptedTransport::new();
        transport.script("http://x/slow", Script::Stall);

        let mut handle = ScopedTransferHandle::new(transport);
        handle
            .open(TransferRequest::get("http://x/slow"), TransferSettings::default())
            .await;
        assert!(handle.is_open());

        tokio::time::timeout(Duration::from_secs(5), handle.close())
            .await
            .expect("close deadlocked");
        assert!(!handle.is_open());
    }
}
