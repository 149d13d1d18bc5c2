//! Read-through cache for rendered pages.
//!
//! Bodies are versioned by the renderer build identity, gzip-compressed, and
//! expire on a sliding one-hour TTL. Not-found results are cached too, so a
//! hot missing page does not hammer the repository. Builds are single-flight
//! per key: concurrent misses wait for the first render and re-read.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::Metrics;

pub const CACHE_TTL: Duration = Duration::from_secs(3600);

const KEY_SEP: char = '\0';

/// Structured cache key; serialized with a byte-0 separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identity: String,
    pub uri: String,
    pub with_name: bool,
    pub renderer_version: String,
}

impl CacheKey {
    pub fn new(identity: &str, uri: &str, with_name: bool, renderer_version: &str) -> Self {
        Self {
            identity: identity.to_string(),
            uri: uri.to_string(),
            with_name,
            renderer_version: renderer_version.to_string(),
        }
    }

    /// Both name variants of one page, for invalidation.
    pub fn variants(identity: &str, uri: &str, renderer_version: &str) -> [Self; 2] {
        [
            Self::new(identity, uri, false, renderer_version),
            Self::new(identity, uri, true, renderer_version),
        ]
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.identity.len() + self.uri.len() + self.renderer_version.len() + 4,
        );
        out.push_str(&self.identity);
        out.push(KEY_SEP);
        out.push_str(&self.uri);
        out.push(KEY_SEP);
        out.push(if self.with_name { '1' } else { '0' });
        out.push(KEY_SEP);
        out.push_str(&self.renderer_version);
        out
    }
}

/// One cached page body (or a cached not-found).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub renderer_version: String,
    pub not_found: bool,
    pub body: String,
}

impl PageEntry {
    pub fn not_found(renderer_version: &str) -> Self {
        Self {
            renderer_version: renderer_version.to_string(),
            not_found: true,
            body: String::new(),
        }
    }

    pub fn page(renderer_version: &str, body: String) -> Self {
        Self {
            renderer_version: renderer_version.to_string(),
            not_found: false,
            body,
        }
    }
}

fn encode_entry(entry: &PageEntry) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(entry)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

fn decode_entry(raw: &[u8]) -> anyhow::Result<PageEntry> {
    let mut json = Vec::new();
    GzDecoder::new(raw).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Backend keyed-bytes storage with per-read TTL refresh.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Reads the value and pushes its expiration out by `ttl` (sliding TTL).
    async fn get(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;
    async fn remove(&self, keys: &[String]) -> anyhow::Result<()>;
}

/// Redis-backed store shared between gateway replicas.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GETEX")
            .arg(key)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> anyhow::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Single-process store for tests and redis-less deployments.
#[derive(Debug, Default)]
pub struct MemCacheStore {
    entries: Mutex<HashMap<String, (Instant, Vec<u8>)>>,
}

impl MemCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemCacheStore {
    async fn get(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((expires_at, _)) => *expires_at <= Instant::now(),
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        let (expires_at, value) = entries.get_mut(key).expect("present, checked above");
        *expires_at = Instant::now() + ttl;
        Ok(Some(value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (Instant::now() + ttl, value));
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// The read-through page cache.
pub struct PageCache {
    store: Box<dyn CacheStore>,
    ttl: Duration,
    inflight: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
    metrics: Metrics,
}

impl PageCache {
    pub fn new(store: Box<dyn CacheStore>, metrics: Metrics) -> Self {
        Self::with_ttl(store, metrics, CACHE_TTL)
    }

    pub fn with_ttl(store: Box<dyn CacheStore>, metrics: Metrics, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inflight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Returns the cached entry, or builds it with `render` under a per-key
    /// lock. Render failures are returned without being cached.
    pub async fn get_or_render<F, Fut>(&self, key: &CacheKey, render: F) -> anyhow::Result<PageEntry>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<PageEntry>>,
    {
        if let Some(entry) = self.lookup(key).await {
            self.metrics.cache_hits.inc();
            return Ok(entry);
        }

        let lock = self.build_lock(key.encode());
        let _guard = lock.lock().await;

        // someone else may have filled the key while we waited
        if let Some(entry) = self.lookup(key).await {
            self.metrics.cache_hits.inc();
            return Ok(entry);
        }
        self.metrics.cache_misses.inc();

        let entry = render().await?;
        match encode_entry(&entry) {
            Ok(raw) => {
                if let Err(err) = self.store.set(&key.encode(), raw, self.ttl).await {
                    warn!("cache set error: {err:#}");
                }
            }
            Err(err) => warn!("cache encode error: {err:#}"),
        }
        Ok(entry)
    }

    /// Drops both name variants of the page. Errors are logged; invalidation
    /// never blocks the mutation that triggered it.
    pub async fn invalidate(&self, identity: &str, uri: &str, renderer_version: &str) {
        let keys: Vec<String> = CacheKey::variants(identity, uri, renderer_version)
            .iter()
            .map(CacheKey::encode)
            .collect();
        self.metrics.cache_invalidations.inc();
        if let Err(err) = self.store.remove(&keys).await {
            warn!(identity, uri, "cache invalidate error: {err:#}");
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<PageEntry> {
        let raw = match self.store.get(&key.encode(), self.ttl).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("cache miss");
                return None;
            }
            Err(err) => {
                warn!("cache get error: {err:#}");
                return None;
            }
        };
        match decode_entry(&raw) {
            // a body from another renderer build is as good as absent
            Ok(entry) if entry.renderer_version == key.renderer_version => Some(entry),
            Ok(_) => None,
            Err(err) => {
                warn!("cache decode error: {err:#}");
                None
            }
        }
    }

    fn build_lock(&self, key: String) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock();
        if let Some(lock) = inflight.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        if inflight.len() > 64 {
            inflight.retain(|_, weak| weak.strong_count() > 0);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        inflight.insert(key, Arc::downgrade(&lock));
        lock
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache").field("ttl", &self.ttl).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> PageCache {
        PageCache::new(Box::new(MemCacheStore::new()), Metrics::default())
    }

    fn key(uri: &str, with_name: bool) -> CacheKey {
        CacheKey::new("A", uri, with_name, "rv1")
    }

    #[test]
    fn key_encoding_uses_byte_zero() {
        let encoded = key("hello", true).encode();
        assert_eq!(encoded, "A\0hello\x001\0rv1");
        assert_ne!(encoded, key("hello", false).encode());
    }

    #[test]
    fn entry_envelope_roundtrip() {
        let entry = PageEntry::page("rv1", "<html>hi</html>".into());
        let raw = encode_entry(&entry).unwrap();
        assert_eq!(decode_entry(&raw).unwrap(), entry);
        // the envelope is compressed, not plain json
        assert_ne!(raw.first(), Some(&b'{'));
    }

    #[tokio::test]
    async fn second_read_is_a_hit() {
        let cache = cache();
        let renders = AtomicUsize::new(0);
        for _ in 0..3 {
            let entry = cache
                .get_or_render(&key("hello", false), || async {
                    renders.fetch_add(1, Ordering::SeqCst);
                    Ok(PageEntry::page("rv1", "body".into()))
                })
                .await
                .unwrap();
            assert_eq!(entry.body, "body");
        }
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_cached() {
        let cache = cache();
        let renders = AtomicUsize::new(0);
        for _ in 0..2 {
            let entry = cache
                .get_or_render(&key("missing", false), || async {
                    renders.fetch_add(1, Ordering::SeqCst);
                    Ok(PageEntry::not_found("rv1"))
                })
                .await
                .unwrap();
            assert!(entry.not_found);
        }
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn render_errors_are_not_cached() {
        let cache = cache();
        let err = cache
            .get_or_render(&key("boom", false), || async { anyhow::bail!("renderer down") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("renderer down"));

        let entry = cache
            .get_or_render(&key("boom", false), || async {
                Ok(PageEntry::page("rv1", "recovered".into()))
            })
            .await
            .unwrap();
        assert_eq!(entry.body, "recovered");
    }

    #[tokio::test]
    async fn invalidate_drops_both_variants() {
        let cache = cache();
        for with_name in [false, true] {
            cache
                .get_or_render(&key("hello", with_name), || async {
                    Ok(PageEntry::page("rv1", "old".into()))
                })
                .await
                .unwrap();
        }

        cache.invalidate("A", "hello", "rv1").await;

        for with_name in [false, true] {
            let entry = cache
                .get_or_render(&key("hello", with_name), || async {
                    Ok(PageEntry::page("rv1", "new".into()))
                })
                .await
                .unwrap();
            assert_eq!(entry.body, "new");
        }
    }

    #[tokio::test]
    async fn stale_renderer_version_is_a_miss() {
        let store = MemCacheStore::new();
        // plant an entry produced by an older renderer build under the
        // current key string
        let stale = encode_entry(&PageEntry::page("rv0", "old".into())).unwrap();
        store
            .set(&key("hello", false).encode(), stale, CACHE_TTL)
            .await
            .unwrap();

        let cache = PageCache::new(Box::new(store), Metrics::default());
        let entry = cache
            .get_or_render(&key("hello", false), || async {
                Ok(PageEntry::page("rv1", "fresh".into()))
            })
            .await
            .unwrap();
        assert_eq!(entry.body, "fresh");
    }

    #[tokio::test]
    async fn concurrent_misses_render_once() {
        let cache = Arc::new(cache());
        let renders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let renders = renders.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_render(&key("hot", false), || async {
                        renders.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(PageEntry::page("rv1", "body".into()))
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().body, "body");
        }
        assert_eq!(renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_store_ttl_is_sliding() {
        let store = MemCacheStore::new();
        let ttl = Duration::from_millis(200);
        store.set("k", vec![1], ttl).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("k", ttl).await.unwrap().is_some());
        // the read above refreshed the expiry
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("k", ttl).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.get("k", ttl).await.unwrap().is_none());
    }
}
