//! Human-name resolution against an upstream directory, with caching.
//!
//! The directory itself is an external collaborator behind [`NameDirectory`];
//! [`NameService`] fronts it with a TTL cache in both directions. Reverse
//! lookups that the directory reports as absent surface as
//! [`NameError::NotExists`], which callers treat as "use the default tier".

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::NameEntry;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const CACHE_CAPACITY: usize = 8192;

/// A resolved human name and the identity that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRecord {
    pub name: String,
    pub owner_identity: String,
}

#[derive(Debug, Error)]
pub enum NameError {
    #[error("name does not exist")]
    NotExists,
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
}

/// The upstream directory: forward and reverse lookups.
#[async_trait]
pub trait NameDirectory: Send + Sync + 'static {
    async fn name_record(&self, name: &str) -> anyhow::Result<Option<NameRecord>>;
    async fn identity_name(&self, identity: &str) -> anyhow::Result<Option<String>>;
}

struct Cached<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Cached<T> {
    fn fresh(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cached resolver over a [`NameDirectory`].
pub struct NameService {
    directory: Arc<dyn NameDirectory>,
    ttl: Duration,
    names: Mutex<LruCache<String, Cached<NameRecord>>>,
    identities: Mutex<LruCache<String, Cached<Option<String>>>>,
}

impl NameService {
    pub fn new(directory: Arc<dyn NameDirectory>) -> Self {
        Self::with_ttl(directory, DEFAULT_TTL)
    }

    pub fn with_ttl(directory: Arc<dyn NameDirectory>, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero capacity");
        Self {
            directory,
            ttl,
            names: Mutex::new(LruCache::new(capacity)),
            identities: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Forward lookup, used by the gateway to translate `/name/{name}` paths.
    pub async fn resolve_name(&self, name: &str) -> Result<NameRecord, NameError> {
        if let Some(entry) = self.names.lock().get(name) {
            if !entry.expired() {
                return Ok(entry.value.clone());
            }
        }
        let record = self
            .directory
            .name_record(name)
            .await?
            .ok_or(NameError::NotExists)?;
        self.names
            .lock()
            .put(name.to_string(), Cached::fresh(record.clone(), self.ttl));
        Ok(record)
    }

    /// Reverse lookup, used for upload-size tiering. Absent mappings are
    /// cached and keep reporting [`NameError::NotExists`] until they expire.
    pub async fn resolve_identity(&self, identity: &str) -> Result<String, NameError> {
        if let Some(entry) = self.identities.lock().get(identity) {
            if !entry.expired() {
                return entry.value.clone().ok_or(NameError::NotExists);
            }
        }
        let name = self.directory.identity_name(identity).await?;
        self.identities.lock().put(
            identity.to_string(),
            Cached::fresh(name.clone(), self.ttl),
        );
        name.ok_or(NameError::NotExists)
    }

    /// Drops expired entries; run periodically by the server assembly.
    pub fn evict_expired(&self) {
        let mut names = self.names.lock();
        let expired: Vec<String> = names
            .iter()
            .filter(|(_, entry)| entry.expired())
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            names.pop(&name);
        }
        drop(names);

        let mut identities = self.identities.lock();
        let expired: Vec<String> = identities
            .iter()
            .filter(|(_, entry)| entry.expired())
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in expired {
            identities.pop(&identity);
        }
    }
}

impl std::fmt::Debug for NameService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameService").field("ttl", &self.ttl).finish()
    }
}

/// Directory backed by a fixed table from configuration; the development and
/// test stand-in for the real upstream.
#[derive(Debug, Default)]
pub struct StaticNameDirectory {
    by_name: HashMap<String, String>,
    by_identity: HashMap<String, String>,
}

impl StaticNameDirectory {
    pub fn new(entries: &[NameEntry]) -> Self {
        let mut by_name = HashMap::new();
        let mut by_identity = HashMap::new();
        for entry in entries {
            by_name.insert(entry.name.clone(), entry.identity.clone());
            by_identity.insert(entry.identity.clone(), entry.name.clone());
        }
        Self {
            by_name,
            by_identity,
        }
    }
}

#[async_trait]
impl NameDirectory for StaticNameDirectory {
    async fn name_record(&self, name: &str) -> anyhow::Result<Option<NameRecord>> {
        Ok(self.by_name.get(name).map(|identity| NameRecord {
            name: name.to_string(),
            owner_identity: identity.clone(),
        }))
    }

    async fn identity_name(&self, identity: &str) -> anyhow::Result<Option<String>> {
        Ok(self.by_identity.get(identity).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDirectory {
        calls: AtomicUsize,
        entries: Vec<NameEntry>,
    }

    impl CountingDirectory {
        fn with_entry(name: &str, identity: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                entries: vec![NameEntry {
                    name: name.to_string(),
                    identity: identity.to_string(),
                }],
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NameDirectory for CountingDirectory {
        async fn name_record(&self, name: &str) -> anyhow::Result<Option<NameRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StaticNameDirectory::new(&self.entries).name_record(name).await
        }

        async fn identity_name(&self, identity: &str) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            StaticNameDirectory::new(&self.entries)
                .identity_name(identity)
                .await
        }
    }

    #[tokio::test]
    async fn forward_lookup_is_cached() {
        let dir = Arc::new(CountingDirectory::with_entry("alice", "id-a"));
        let service = NameService::new(dir.clone());

        let record = service.resolve_name("alice").await.unwrap();
        assert_eq!(record.owner_identity, "id-a");
        service.resolve_name("alice").await.unwrap();
        assert_eq!(dir.calls(), 1);

        assert!(matches!(
            service.resolve_name("nobody").await.unwrap_err(),
            NameError::NotExists
        ));
    }

    #[tokio::test]
    async fn reverse_lookup_caches_absence() {
        let dir = Arc::new(CountingDirectory::with_entry("alice", "id-a"));
        let service = NameService::new(dir.clone());

        assert_eq!(service.resolve_identity("id-a").await.unwrap(), "alice");
        assert_eq!(service.resolve_identity("id-a").await.unwrap(), "alice");
        assert_eq!(dir.calls(), 1);

        for _ in 0..2 {
            assert!(matches!(
                service.resolve_identity("id-unknown").await.unwrap_err(),
                NameError::NotExists
            ));
        }
        assert_eq!(dir.calls(), 2);
    }

    #[tokio::test]
    async fn expired_entries_hit_upstream_again() {
        let dir = Arc::new(CountingDirectory::with_entry("alice", "id-a"));
        let service = NameService::with_ttl(dir.clone(), Duration::ZERO);

        service.resolve_name("alice").await.unwrap();
        service.resolve_name("alice").await.unwrap();
        assert_eq!(dir.calls(), 2);

        service.evict_expired();
        assert!(service.names.lock().is_empty());
    }
}
