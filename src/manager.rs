// src/manager.rs

use crate::config::CacheConfig;
use crate::downloader::{TransferError, TransferSettings, TransferWorker};
use crate::entry::{unix_now, CacheEntry};
use crate::models::{CacheRequest, CacheResponse, ErrorClass, IndexRecord};
use crate::naming::{cache_path, is_partial, partial_path};
use crate::policy::{ContentDomain, DomainPolicy};
use crate::state_manager::{CacheIndex, IndexError, INDEX_FILE_NAME};
use crate::transport::{
    HttpTransport, TransferBody, Transport, TransportError, TransportErrorKind, TransferRequest,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not find or create the cache folder {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Files found on disk at startup that no index row claims.
    orphans: HashSet<PathBuf>,
    shut_down: bool,
}

/// The public face of the cache.
///
/// [`request`](Self::request) is meant to be polled: it answers from disk,
/// reports on the running transfer, or starts one, and never waits on the
/// network. Each URL has at most one transfer in flight and its own cooldown
/// after failures.
pub struct CacheOrchestrator {
    cache_dir: PathBuf,
    config: CacheConfig,
    transport: Arc<dyn Transport>,
    index: CacheIndex,
    state: Mutex<CacheState>,
}

impl CacheOrchestrator {
    /// Create the cache directory if needed and load what is already in it.
    pub async fn init(config: CacheConfig, transport: Arc<dyn Transport>) -> Result<Self, CacheError> {
        let cache_dir = config.resolved_cache_dir();
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|source| CacheError::CacheDir {
                path: cache_dir.clone(),
                source,
            })?;

        let index = CacheIndex::open(&cache_dir.join(INDEX_FILE_NAME)).await?;
        let mut files = scan_files(&cache_dir).await?;

        let mut entries = HashMap::new();
        for record in index.load_all().await? {
            if files.remove(&record.path) {
                entries.insert(
                    record.url.clone(),
                    CacheEntry::from_record(&record, transport.clone()),
                );
            } else {
                debug!(url = %record.url, path = %record.path.display(), "Indexed file is gone");
                index.delete_record(&record.url).await?;
            }
        }

        info!(
            dir = %cache_dir.display(),
            resident = entries.len(),
            unindexed = files.len(),
            "File cache initialized"
        );

        Ok(Self {
            cache_dir,
            config,
            transport,
            index,
            state: Mutex::new(CacheState {
                entries,
                orphans: files,
                shut_down: false,
            }),
        })
    }

    /// [`init`](Self::init) with the reqwest-backed transport.
    pub async fn init_with_http(config: CacheConfig) -> Result<Self, CacheError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::init(config, transport).await
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn policy(&self, domain: ContentDomain) -> DomainPolicy {
        self.config.policies.get(domain)
    }

    /// Where `req` is (or would be) stored.
    pub fn url_to_cache_path(&self, req: &CacheRequest) -> PathBuf {
        cache_path(&self.cache_dir, req.folder_prefix.as_deref(), &req.url)
    }

    /// Number of transfers currently owned by the cache.
    pub async fn in_flight(&self) -> usize {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|entry| entry.transfer().is_open())
            .count()
    }

    /// Poll for `req.url`. Call again until the status is terminal.
    pub async fn request(&self, req: &CacheRequest) -> CacheResponse {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.shut_down {
            warn!(url = %req.url, "Request after shutdown");
            return CacheResponse::not_started();
        }

        self.adopt_orphan(state, req).await;

        let entry = state
            .entries
            .entry(req.url.clone())
            .or_insert_with(|| CacheEntry::new(req.url.clone(), req.domain, self.transport.clone()));
        let policy = self.config.policies.get(entry.domain());

        if entry.is_resident() {
            if let Some(path) = self.usable_disk_location(entry, &policy).await {
                return CacheResponse::available(path);
            }
            self.evict(entry).await;
            return self.start_transfer(entry, req).await;
        }

        let transfer = entry
            .transfer()
            .get()
            .map(|worker| (worker.is_done(), worker.is_ok(), worker.progress()));
        match transfer {
            Some((false, _, progress)) => return CacheResponse::downloading(progress),
            Some((true, true, _)) => {
                let response = self.materialize(entry, req).await;
                if let Some(path) = &response.disk_path {
                    let displaced = displace(&mut state.entries, &mut state.orphans, &req.url, path);
                    for url in displaced {
                        if let Err(e) = self.index.delete_record(&url).await {
                            warn!(url = %url, error = %e, "Could not drop displaced index row");
                        }
                    }
                }
                return response;
            }
            Some((true, false, _)) => return self.fail(entry).await,
            None => {}
        }

        let seconds_left = entry.cooldown_seconds_remaining(&policy);
        if seconds_left > 0 {
            return CacheResponse::cooling(
                entry.last_error_class(),
                entry.last_error_human(),
                seconds_left,
            );
        }

        self.start_transfer(entry, req).await
    }

    /// Stop every transfer and forget all entries. Files stay on disk.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }

        for worker in state.entries.values().filter_map(|e| e.transfer().get()) {
            worker.halt();
        }
        let mut stopped = 0;
        for entry in state.entries.values_mut() {
            if entry.transfer().is_open() {
                entry.transfer_mut().close().await;
                stopped += 1;
            }
        }

        state.entries.clear();
        state.orphans.clear();
        state.shut_down = true;
        info!(stopped, "File cache shut down");
    }

    /// Bind an unindexed file to the first URL whose cache path is exactly it.
    async fn adopt_orphan(&self, state: &mut CacheState, req: &CacheRequest) {
        if state.entries.contains_key(&req.url) {
            return;
        }
        let path = self.url_to_cache_path(req);
        if !state.orphans.remove(&path) {
            return;
        }

        let record = IndexRecord {
            url: req.url.clone(),
            last_modified: file_mtime(&path).await.unwrap_or_else(unix_now),
            path,
            domain: req.domain,
        };
        if let Err(e) = self.index.save_record(&record).await {
            warn!(url = %req.url, error = %e, "Could not index existing file");
        }
        debug!(url = %req.url, path = %record.path.display(), "Adopted existing file");
        state.entries.insert(
            req.url.clone(),
            CacheEntry::from_record(&record, self.transport.clone()),
        );
    }

    async fn usable_disk_location(&self, entry: &CacheEntry, policy: &DomainPolicy) -> Option<PathBuf> {
        let path = entry.disk_location()?.to_path_buf();
        if !fs::try_exists(&path).await.unwrap_or(false) {
            debug!(url = %entry.url(), path = %path.display(), "Cached file vanished");
            return None;
        }
        if entry.needs_refresh(policy) {
            debug!(url = %entry.url(), path = %path.display(), "Cached file is stale");
            return None;
        }
        Some(path)
    }

    async fn evict(&self, entry: &mut CacheEntry) {
        if let Some(path) = entry.disk_location().map(Path::to_path_buf) {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Could not remove cached file");
                }
            }
        }
        if let Err(e) = self.index.delete_record(entry.url()).await {
            warn!(url = %entry.url(), error = %e, "Could not drop index row");
        }
        entry.clear_resident();
    }

    async fn start_transfer(&self, entry: &mut CacheEntry, req: &CacheRequest) -> CacheResponse {
        if entry.is_cooldown_armed() {
            entry.reset_cooldown();
        }
        entry.set_domain(req.domain);

        let policy = self.config.policies.get(req.domain);
        let settings = TransferSettings {
            inactivity_timeout: self.config.inactivity_timeout,
            buffer_hint: policy.buffer_reserve_bytes,
        };
        let request = TransferRequest::get(req.url.clone())
            .with_cert(req.cert.clone())
            .with_body(TransferBody::select(req.post_body.clone(), req.put_body.clone()));
        entry.transfer_mut().open(request, settings).await;

        let progress = entry.transfer().get().map_or(-1, TransferWorker::progress);
        CacheResponse::downloading(progress)
    }

    /// Write the finished transfer to disk and index it, all or nothing.
    async fn materialize(&self, entry: &mut CacheEntry, req: &CacheRequest) -> CacheResponse {
        let path = self.url_to_cache_path(req);
        let written = match entry.transfer().dest_buffer() {
            Some(buffer) => write_atomically(&path, buffer).await.map_err(CacheError::from),
            None => Err(CacheError::Io(io::Error::new(
                io::ErrorKind::Other,
                "transfer finished without a buffer",
            ))),
        };
        entry.transfer_mut().close().await;

        let last_modified = unix_now();
        let indexed = match written {
            Ok(()) => {
                let record = IndexRecord {
                    url: req.url.clone(),
                    path: path.clone(),
                    domain: req.domain,
                    last_modified,
                };
                let saved = self.index.save_record(&record).await.map_err(CacheError::from);
                if saved.is_err() {
                    // Renamed into place by this transfer.
                    let _ = fs::remove_file(&path).await;
                }
                saved
            }
            Err(e) => Err(e),
        };

        match indexed {
            Ok(()) => {
                entry.reset_cooldown();
                entry.set_domain(req.domain);
                entry.set_resident(path.clone(), last_modified);
                info!(url = %req.url, path = %path.display(), "Cached file");
                CacheResponse::available(path)
            }
            Err(e) => {
                if let Err(e) = self.index.delete_record(&req.url).await {
                    warn!(url = %req.url, error = %e, "Could not drop index row");
                }
                let human = format!(
                    "{} could not be saved, check if the folder or file is in use or if you have sufficient privileges ({})",
                    path.display(),
                    e
                );
                warn!(url = %req.url, error = %e, "Could not write cached file");
                arm_cooldown(entry, ErrorClass::DiskWrite, human.clone());
                CacheResponse::error(ErrorClass::DiskWrite, human)
            }
        }
    }

    async fn fail(&self, entry: &mut CacheEntry) -> CacheResponse {
        let (class, human) = match entry.transfer().get().and_then(TransferWorker::error) {
            Some(e) => classify(e),
            None => (
                ErrorClass::Unknown,
                "Download failed due to unknown error.".to_string(),
            ),
        };
        entry.transfer_mut().close().await;

        warn!(url = %entry.url(), class = ?class, error = %human, "Download failed");
        arm_cooldown(entry, class, human.clone());
        CacheResponse::error(class, human)
    }
}

fn arm_cooldown(entry: &mut CacheEntry, class: ErrorClass, human: String) {
    if entry.is_cooldown_armed() {
        entry.reset_cooldown();
    }
    entry.record_error(class, human);
    entry.trigger_cooldown();
}

/// Error class and user-facing text for a failed transfer.
pub fn classify(error: &TransferError) -> (ErrorClass, String) {
    match error {
        TransferError::Http { status, body } => {
            let human = match printable_text(body) {
                Some(text) => format!("Error Code {}: {}", status, text),
                None => format!("Download failed with HTTP status {}.", status),
            };
            (ErrorClass::ServerSide, human)
        }
        TransferError::Transport(e) if e.kind.is_network_failure() => (
            ErrorClass::ClientSide,
            format!(
                "Download failed: {}. ({}) Please check your internet connectivity.",
                e.kind,
                e.kind.code()
            ),
        ),
        TransferError::Transport(e)
            if matches!(
                e.kind,
                TransportErrorKind::InvalidRequest | TransportErrorKind::Certificate
            ) =>
        {
            (
                ErrorClass::ClientSide,
                format!("Download failed: {}. ({})", e.kind, e.kind.code()),
            )
        }
        TransferError::Transport(e) => (
            ErrorClass::Unknown,
            format!("Download failed due to unknown error: {}.", e.message),
        ),
    }
}

fn printable_text(body: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(body).ok()?.trim();
    if text.is_empty() || text.chars().any(|c| c.is_control() && !c.is_whitespace()) {
        return None;
    }
    Some(text)
}

/// Other entries that pointed at `path` lost their file to `owner`.
fn displace(
    entries: &mut HashMap<String, CacheEntry>,
    orphans: &mut HashSet<PathBuf>,
    owner: &str,
    path: &Path,
) -> Vec<String> {
    orphans.remove(path);
    let mut displaced = Vec::new();
    for (url, entry) in entries.iter_mut() {
        if url != owner && entry.disk_location() == Some(path) {
            entry.clear_resident();
            displaced.push(url.clone());
        }
    }
    displaced
}

async fn write_atomically(path: &Path, buffer: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(path);
    let result = async {
        let mut file = fs::File::create(&partial).await?;
        file.write_all(buffer).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, path).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&partial).await;
    }
    result
}

async fn file_mtime(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs())
}

/// Every regular file under `dir`, skipping dot-files. Leftover partial
/// writes are deleted on the way.
async fn scan_files(dir: &Path) -> io::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut listing = fs::read_dir(&current).await?;
        while let Some(item) = listing.next_entry().await? {
            let hidden = item.file_name().to_str().is_some_and(|n| n.starts_with('.'));
            if hidden {
                continue;
            }
            let path = item.path();
            let file_type = item.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if is_partial(&path) {
                    debug!(path = %path.display(), "Removing partial download");
                    let _ = fs::remove_file(&path).await;
                } else {
                    files.insert(path);
                }
            }
        }
    }
    Ok(files)
}
