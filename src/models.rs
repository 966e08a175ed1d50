// src/models.rs

use crate::policy::ContentDomain;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a single transfer. Terminal once `DoneOk` or `DoneError`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    InProgress = 0,
    DoneOk = 1,
    DoneError = 2,
}

impl TransferStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TransferStatus::DoneOk,
            2 => TransferStatus::DoneError,
            _ => TransferStatus::InProgress,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::InProgress)
    }
}

/// Why the last attempt for a URL failed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorClass {
    #[default]
    None,
    /// Our side is at fault: no connectivity, malformed request, bad certificate.
    ClientSide,
    /// The remote answered with a non-success status.
    ServerSide,
    /// The download succeeded but could not be written to the cache directory.
    DiskWrite,
    Unknown,
}

/// What a `request` call reports back to the poller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheStatus {
    Available,
    Downloading,
    Error,
    Cooling,
    #[default]
    NotStarted,
}

impl CacheStatus {
    /// Whether polling can stop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CacheStatus::Available | CacheStatus::Error | CacheStatus::Cooling
        )
    }
}

/// A single cache lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRequest {
    pub url: String,
    /// PEM bundle with extra root certificates for this transfer.
    pub cert: Option<PathBuf>,
    pub domain: ContentDomain,
    /// Sub-folder of the cache directory the file is stored under.
    pub folder_prefix: Option<String>,
    /// Form data; the fetch becomes a POST.
    #[serde(default)]
    pub post_body: Option<Vec<u8>>,
    /// JSON payload; the fetch becomes a PUT, even if `post_body` is set.
    #[serde(default)]
    pub put_body: Option<Vec<u8>>,
}

impl CacheRequest {
    pub fn new(url: impl Into<String>, domain: ContentDomain) -> Self {
        Self {
            url: url.into(),
            cert: None,
            domain,
            folder_prefix: None,
            post_body: None,
            put_body: None,
        }
    }

    pub fn with_cert(mut self, cert: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self
    }

    pub fn with_folder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.folder_prefix = Some(prefix.into());
        self
    }

    pub fn with_post_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.post_body = Some(body.into());
        self
    }

    pub fn with_put_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.put_body = Some(body.into());
        self
    }
}

/// The answer to one `request` poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheResponse {
    pub status: CacheStatus,
    /// 0-100, or -1 while the total size is unknown.
    pub progress: i32,
    /// Set only when `status == Available`.
    pub disk_path: Option<PathBuf>,
    pub error_class: ErrorClass,
    /// Empty unless `status` is `Error` or `Cooling`.
    pub human_error: String,
}

impl CacheResponse {
    pub fn available(path: PathBuf) -> Self {
        Self {
            status: CacheStatus::Available,
            progress: 100,
            disk_path: Some(path),
            ..Self::default()
        }
    }

    pub fn downloading(progress: i32) -> Self {
        Self {
            status: CacheStatus::Downloading,
            progress,
            ..Self::default()
        }
    }

    pub fn error(error_class: ErrorClass, human_error: String) -> Self {
        Self {
            status: CacheStatus::Error,
            progress: -1,
            error_class,
            human_error,
            ..Self::default()
        }
    }

    /// `last_error` is the text of the failure that armed the cooldown.
    pub fn cooling(error_class: ErrorClass, last_error: &str, seconds_left: u64) -> Self {
        let mut human_error = format!(
            "Cache cooling after failed network attempt, please wait: {} seconds...",
            seconds_left
        );
        if !last_error.is_empty() {
            human_error.push_str(" Last error: ");
            human_error.push_str(last_error);
        }
        Self {
            status: CacheStatus::Cooling,
            progress: -1,
            error_class,
            human_error,
            ..Self::default()
        }
    }

    pub fn not_started() -> Self {
        Self {
            progress: -1,
            ..Self::default()
        }
    }
}

/// One row of the persisted URL index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    pub url: String,
    pub path: PathBuf,
    pub domain: ContentDomain,
    /// Seconds since the Unix epoch at which the file was materialized.
    pub last_modified: u64,
}
