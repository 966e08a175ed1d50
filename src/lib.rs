pub mod config;
pub mod downloader;
pub mod entry;
pub mod handle;
pub mod manager;
pub mod models;
pub mod naming;
pub mod policy;
pub mod state_manager;
pub mod transport;

#[cfg(test)]
mod test_support;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::CacheConfig;
    pub use crate::downloader::{TransferError, TransferSettings, TransferWorker};
    pub use crate::handle::ScopedTransferHandle;
    pub use crate::manager::{CacheError, CacheOrchestrator};
    pub use crate::models::{CacheRequest, CacheResponse, CacheStatus, ErrorClass, TransferStatus};
    pub use crate::policy::{ContentDomain, DomainPolicy, DomainPolicyTable};
    pub use crate::transport::{HttpTransport, Transport, TransferBody, TransferRequest};
}
