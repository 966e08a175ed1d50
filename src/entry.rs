use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::handle::ScopedTransferHandle;
use crate::models::{ErrorClass, IndexRecord};
use crate::policy::{ContentDomain, DomainPolicy};
use crate::transport::Transport;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bookkeeping for one URL: where its file lives, why it last failed, and the
/// transfer fetching it.
///
/// A resident entry never has an open transfer.
#[derive(Debug)]
pub struct CacheEntry {
    url: String,
    domain: ContentDomain,
    disk_location: Option<PathBuf>,
    /// Unix seconds at which the resident file was written.
    last_modified: Option<u64>,
    last_error_class: ErrorClass,
    last_error_human: String,
    cooldown_started: Option<Instant>,
    transfer: ScopedTransferHandle,
}

impl CacheEntry {
    pub fn new(url: impl Into<String>, domain: ContentDomain, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: url.into(),
            domain,
            disk_location: None,
            last_modified: None,
            last_error_class: ErrorClass::None,
            last_error_human: String::new(),
            cooldown_started: None,
            transfer: ScopedTransferHandle::new(transport),
        }
    }

    /// An entry for a file that is already on disk.
    pub fn from_record(record: &IndexRecord, transport: Arc<dyn Transport>) -> Self {
        let mut entry = Self::new(record.url.clone(), record.domain, transport);
        entry.disk_location = Some(record.path.clone());
        entry.last_modified = Some(record.last_modified);
        entry
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn domain(&self) -> ContentDomain {
        self.domain
    }

    pub fn set_domain(&mut self, domain: ContentDomain) {
        self.domain = domain;
    }

    pub fn is_resident(&self) -> bool {
        self.disk_location.is_some()
    }

    pub fn disk_location(&self) -> Option<&Path> {
        self.disk_location.as_deref()
    }

    pub fn last_modified(&self) -> Option<u64> {
        self.last_modified
    }

    pub fn set_resident(&mut self, path: PathBuf, last_modified: u64) {
        debug_assert!(
            !self.transfer.is_open(),
            "resident entry with an open transfer: {}",
            self.url
        );
        self.disk_location = Some(path);
        self.last_modified = Some(last_modified);
    }

    /// Forget the file, e.g. after it went stale or vanished.
    pub fn clear_resident(&mut self) {
        self.disk_location = None;
        self.last_modified = None;
    }

    pub fn needs_refresh(&self, policy: &DomainPolicy) -> bool {
        self.needs_refresh_at(policy, unix_now())
    }

    pub fn needs_refresh_at(&self, policy: &DomainPolicy, now_unix: u64) -> bool {
        match (self.is_resident(), self.last_modified) {
            (true, Some(modified)) => {
                Duration::from_secs(now_unix.saturating_sub(modified)) > policy.max_residency()
            }
            _ => true,
        }
    }

    pub fn last_error_class(&self) -> ErrorClass {
        self.last_error_class
    }

    pub fn last_error_human(&self) -> &str {
        &self.last_error_human
    }

    pub fn record_error(&mut self, class: ErrorClass, human: String) {
        self.last_error_class = class;
        self.last_error_human = human;
    }

    pub fn is_cooldown_armed(&self) -> bool {
        self.cooldown_started.is_some()
    }

    /// Start the cooldown window now. Arming twice without a reset is a bug.
    pub fn trigger_cooldown(&mut self) {
        self.trigger_cooldown_at(Instant::now());
    }

    pub fn trigger_cooldown_at(&mut self, now: Instant) {
        debug_assert!(
            self.cooldown_started.is_none(),
            "cooldown re-armed without reset for {}",
            self.url
        );
        self.cooldown_started = Some(now);
    }

    pub fn reset_cooldown(&mut self) {
        self.cooldown_started = None;
        self.last_error_class = ErrorClass::None;
        self.last_error_human.clear();
    }

    fn cooldown_window(&self, policy: &DomainPolicy) -> Duration {
        match self.last_error_class {
            ErrorClass::None => Duration::ZERO,
            ErrorClass::ClientSide => policy.min_client_cooldown(),
            ErrorClass::ServerSide | ErrorClass::DiskWrite | ErrorClass::Unknown => {
                policy.min_server_cooldown()
            }
        }
    }

    pub fn cooldown_remaining_at(&self, policy: &DomainPolicy, now: Instant) -> Duration {
        match self.cooldown_started {
            Some(started) => self
                .cooldown_window(policy)
                .saturating_sub(now.saturating_duration_since(started)),
            None => Duration::ZERO,
        }
    }

    /// Whole seconds left, rounded up so it only reaches 0 once the window is over.
    pub fn cooldown_seconds_remaining(&self, policy: &DomainPolicy) -> u64 {
        let remaining = self.cooldown_remaining_at(policy, Instant::now());
        let secs = remaining.as_secs();
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    pub fn transfer(&self) -> &ScopedTransferHandle {
        &self.transfer
    }

    pub fn transfer_mut(&mut self) -> &mut ScopedTransferHandle {
        &mut self.transfer
    }
}
