// src/policy.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Classification of cached content. Selects how long a file may stay on
/// disk and how long a failing URL is left alone.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContentDomain {
    #[default]
    None,
    /// Small tabular metadata refreshed about daily.
    MetadataDocument,
    /// A listing of everything available remotely.
    ListingDocument,
    /// Version list of a single item; changes often.
    VersionedManifest,
    /// Large immutable download.
    LargeArchive,
    MapTile,
}

impl ContentDomain {
    pub const ALL: [ContentDomain; 6] = [
        ContentDomain::None,
        ContentDomain::MetadataDocument,
        ContentDomain::ListingDocument,
        ContentDomain::VersionedManifest,
        ContentDomain::LargeArchive,
        ContentDomain::MapTile,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainPolicy {
    pub max_residency_secs: u64,
    pub min_client_cooldown_secs: u64,
    pub min_server_cooldown_secs: u64,
    /// Initial capacity of the transfer buffer.
    pub buffer_reserve_bytes: usize,
}

impl DomainPolicy {
    pub const fn new(
        max_residency_secs: u64,
        min_client_cooldown_secs: u64,
        min_server_cooldown_secs: u64,
        buffer_reserve_bytes: usize,
    ) -> Self {
        Self {
            max_residency_secs,
            min_client_cooldown_secs,
            min_server_cooldown_secs,
            buffer_reserve_bytes,
        }
    }

    /// Built-in values for each domain.
    pub const fn reference(domain: ContentDomain) -> Self {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        const DAY: u64 = 24 * HOUR;
        const KIB: usize = 1024;

        match domain {
            ContentDomain::None => Self::new(HOUR, 5, 15, 0),
            ContentDomain::MetadataDocument => Self::new(DAY, 10, 30, 64 * KIB),
            ContentDomain::ListingDocument => Self::new(6 * HOUR, 10, 30, 1024 * KIB),
            ContentDomain::VersionedManifest => Self::new(10 * MINUTE, 5, 30, 16 * KIB),
            ContentDomain::LargeArchive => Self::new(7 * DAY, 10, 60, 4 * 1024 * KIB),
            ContentDomain::MapTile => Self::new(30 * DAY, 2, 10, 32 * KIB),
        }
    }

    pub fn max_residency(&self) -> Duration {
        Duration::from_secs(self.max_residency_secs)
    }

    pub fn min_client_cooldown(&self) -> Duration {
        Duration::from_secs(self.min_client_cooldown_secs)
    }

    pub fn min_server_cooldown(&self) -> Duration {
        Duration::from_secs(self.min_server_cooldown_secs)
    }
}

/// Domain -> policy lookup. Domains without an override fall back to
/// [`DomainPolicy::reference`], so lookup never fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainPolicyTable {
    #[serde(default)]
    overrides: HashMap<ContentDomain, DomainPolicy>,
}

impl DomainPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the policy for one domain.
    pub fn with(mut self, domain: ContentDomain, policy: DomainPolicy) -> Self {
        self.overrides.insert(domain, policy);
        self
    }

    /// Use `policy` for every domain.
    pub fn uniform(policy: DomainPolicy) -> Self {
        ContentDomain::ALL
            .iter()
            .fold(Self::new(), |table, domain| table.with(*domain, policy))
    }

    pub fn get(&self, domain: ContentDomain) -> DomainPolicy {
        self.overrides
            .get(&domain)
            .copied()
            .unwrap_or_else(|| DomainPolicy::reference(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_domain_has_a_policy() {
        let table = DomainPolicyTable::new();
        for domain in ContentDomain::ALL {
            let policy = table.get(domain);
            assert!(policy.max_residency_secs > 0, "{domain:?}");
            assert!(policy.min_server_cooldown_secs >= policy.min_client_cooldown_secs);
        }
    }

    #[test]
    fn metadata_documents_live_for_a_day() {
        let policy = DomainPolicyTable::new().get(ContentDomain::MetadataDocument);
        assert_eq!(policy.max_residency(), Duration::from_secs(86_400));
    }

    #[test]
    fn overrides_only_touch_their_domain() {
        let custom = DomainPolicy::new(1, 2, 3, 4);
        let table = DomainPolicyTable::new().with(ContentDomain::MapTile, custom);

        assert_eq!(table.get(ContentDomain::MapTile), custom);
        assert_eq!(
            table.get(ContentDomain::LargeArchive),
            DomainPolicy::reference(ContentDomain::LargeArchive)
        );
    }

    #[test]
    fn table_survives_json() {
        let table = DomainPolicyTable::uniform(DomainPolicy::new(10, 0, 0, 0));
        let json = serde_json::to_string(&table).unwrap();
        let back: DomainPolicyTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);

        let empty: DomainPolicyTable = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, DomainPolicyTable::new());
    }
}
