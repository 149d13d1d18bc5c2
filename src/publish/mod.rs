//! The publish service: reservation lifecycle, upload ingest and garbage
//! collection.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::StreamExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{GatewayConfig, PublishConfig};
use crate::domain::{ObjectHandle, ObjectWithPublish, Publish, PublishId, PublishStatus};
use crate::metrics::Metrics;
use crate::names::{NameError, NameService};
use crate::repo::{PublishRepo, RepoError};
use crate::store::{BlobFile, BlobStore};

pub mod http;

/// Upload ceiling for identities without a registered name.
pub const DEFAULT_LIMIT: u64 = 10 << 20;
/// Upload ceiling for named identities.
pub const INCREASED_LIMIT: u64 = 100 << 20;
/// Upload ceiling for the allow-listed internal names.
pub const INTERNAL_LIMIT: u64 = 6000 << 20;

/// Comma-separated names granted [`INTERNAL_LIMIT`].
pub const INTERNAL_NAMES_ENV: &str = "INCREASED_LIMIT_NAMES";

const GC_INTERVAL: Duration = Duration::from_secs(300);
/// Reservations untouched for this long are fair game for the reaper.
const STALE_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not found")]
    NotFound,
    #[error("uri is not unique")]
    UriNotUnique,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("upload limit exceeded")]
    LimitExceeded,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<RepoError> for PublishError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => PublishError::NotFound,
            RepoError::UriNotUnique => PublishError::UriNotUnique,
            other => PublishError::Unexpected(other.into()),
        }
    }
}

pub type PublishResult<T> = Result<T, PublishError>;

type InvalidateFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Reads the allow-list of internal names from the environment.
pub fn internal_names_from_env() -> Vec<String> {
    std::env::var(INTERNAL_NAMES_ENV)
        .unwrap_or_default()
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct PublishService {
    repo: PublishRepo,
    store: Arc<dyn BlobStore>,
    names: Arc<NameService>,
    config: PublishConfig,
    gateway: GatewayConfig,
    internal_names: Vec<String>,
    metrics: Metrics,
    invalidate: RwLock<Option<InvalidateFn>>,
}

impl PublishService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: PublishRepo,
        store: Arc<dyn BlobStore>,
        names: Arc<NameService>,
        config: PublishConfig,
        gateway: GatewayConfig,
        internal_names: Vec<String>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            store,
            names,
            config,
            gateway,
            internal_names,
            metrics,
            invalidate: RwLock::new(None),
        })
    }

    /// Registers the gateway's cache-invalidation hook. Fired after commits;
    /// failures inside the hook must never block the mutation.
    pub fn set_invalidate_callback(&self, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        *self.invalidate.write() = Some(Arc::new(f));
    }

    fn invalidate_cache(&self, identity: &str, uri: &str) {
        let callback = self.invalidate.read().clone();
        if let Some(callback) = callback {
            callback(identity, uri);
        }
    }

    /// Resolves a URI for its owner, with the active publish hydrated.
    pub async fn resolve_uri(&self, identity: &str, uri: &str) -> PublishResult<ObjectWithPublish> {
        Ok(self.repo.resolve_by_derived_id(identity, uri, true).await?)
    }

    /// Unauthenticated resolve used by the gateway render path.
    pub async fn resolve_uri_with_identity(
        &self,
        identity: &str,
        uri: &str,
    ) -> PublishResult<crate::domain::Object> {
        let owp = self.repo.resolve_by_derived_id(identity, uri, false).await?;
        Ok(owp.object)
    }

    pub async fn get_publish_status(
        &self,
        identity: &str,
        space_id: &str,
        object_id: &str,
    ) -> PublishResult<ObjectWithPublish> {
        Ok(self.repo.publish_status(identity, space_id, object_id).await?)
    }

    /// Stakes (or re-stakes) a URI and hands back the one-shot upload URL.
    pub async fn publish(
        &self,
        identity: &str,
        space_id: &str,
        object_id: &str,
        uri: &str,
        version: &str,
    ) -> PublishResult<String> {
        let handle = ObjectHandle {
            identity: identity.to_string(),
            space_id: space_id.to_string(),
            object_id: object_id.to_string(),
            uri: uri.to_string(),
        };
        let (owp, prev_uri) = self.repo.reserve_or_update(&handle, version).await?;
        if let Some(prev_uri) = prev_uri {
            self.invalidate_cache(identity, &prev_uri);
        }
        let publish = owp
            .publish
            .as_ref()
            .expect("reserve_or_update always attaches a publish");
        Ok(format!(
            "{}/{}/{}",
            self.config.upload_url_prefix.trim_end_matches('/'),
            publish.id,
            publish.upload_key
        ))
    }

    pub async fn unpublish(
        &self,
        identity: &str,
        space_id: &str,
        object_id: &str,
    ) -> PublishResult<()> {
        let uri = self.repo.delete_object(identity, space_id, object_id).await?;
        self.invalidate_cache(identity, &uri);
        Ok(())
    }

    pub async fn list_publishes(
        &self,
        identity: &str,
        space_id: Option<&str>,
    ) -> PublishResult<Vec<ObjectWithPublish>> {
        Ok(self.repo.list(identity, space_id).await?)
    }

    /// Ingests a TAR archive for the given reservation and finalizes it.
    /// Returns the public URL of the published page.
    pub async fn upload_tar<R>(
        &self,
        publish_id: &str,
        upload_key: &str,
        reader: R,
    ) -> PublishResult<String>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let id: PublishId = publish_id
            .parse()
            .map_err(|_| PublishError::InvalidUpload(format!("bad publish id {publish_id}")))?;
        let owp = match self.repo.get_publish(id).await {
            Ok(owp) => owp,
            Err(RepoError::NotFound) => {
                return Err(PublishError::InvalidUpload("unknown publish id".into()))
            }
            Err(err) => return Err(err.into()),
        };
        let publish = owp.publish.as_ref().expect("get_publish hydrates");
        if publish.upload_key != upload_key {
            return Err(PublishError::InvalidUpload("invalid upload key".into()));
        }
        if publish.status != PublishStatus::Created {
            return Err(PublishError::InvalidUpload(
                "publish is not in created state".into(),
            ));
        }

        let limit = self.limit_for_identity(&owp.object.identity).await;
        let result = self.finalize_upload(&owp, publish_id, reader, limit).await;
        match result {
            Ok(url) => {
                self.metrics.uploads.inc();
                self.invalidate_cache(&owp.object.identity, &owp.object.uri);
                Ok(url)
            }
            Err(err) => {
                self.metrics.upload_errors.inc();
                self.cleanup_blobs_detached(publish_id.to_string());
                Err(err)
            }
        }
    }

    async fn finalize_upload<R>(
        &self,
        owp: &ObjectWithPublish,
        publish_id: &str,
        reader: R,
        limit: u64,
    ) -> PublishResult<String>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let size = self.ingest_tar(publish_id, reader, limit).await?;
        self.metrics.upload_bytes.inc_by(size);

        let finalized = ObjectWithPublish {
            object: owp.object.clone(),
            publish: Some(Publish {
                status: PublishStatus::Published,
                size: size as i64,
                upload_key: String::new(),
                ..owp.publish.clone().expect("get_publish hydrates")
            }),
        };
        // committed on a detached task: an uploader hanging up mid-response
        // must not cancel the commit halfway
        let repo = self.repo.clone();
        tokio::spawn(async move { repo.finalize_publish(&finalized).await })
            .await
            .map_err(|err| PublishError::Unexpected(err.into()))??;

        Ok(format!("https://{}/{}", self.gateway.domain, owp.object.id))
    }

    /// Streams the archive into blob storage under `{publish_id}/`, one
    /// entry at a time. Directory entries are skipped. The running
    /// uncompressed total is checked against the limit before every write.
    async fn ingest_tar<R>(&self, publish_id: &str, reader: R, limit: u64) -> PublishResult<u64>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let mut entries = tokio_tar::Archive::new(reader)
            .entries()
            .map_err(|err| PublishError::InvalidUpload(format!("bad archive: {err}")))?;

        let mut size: u64 = 0;
        while let Some(entry) = entries.next().await {
            let entry =
                entry.map_err(|err| PublishError::InvalidUpload(format!("bad archive: {err}")))?;
            let header = entry.header();
            if header.entry_type().is_dir() {
                continue;
            }
            let entry_size = header
                .size()
                .map_err(|err| PublishError::InvalidUpload(format!("bad entry size: {err}")))?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let key = format!("{}/{}", publish_id, name.trim_start_matches('/'));

            size = size.saturating_add(entry_size);
            if size > limit {
                return Err(PublishError::LimitExceeded);
            }

            let file = BlobFile::new(key, entry_size, Box::new(entry));
            self.store
                .put(file)
                .await
                .map_err(|err| PublishError::Unexpected(err.into()))?;
        }
        Ok(size)
    }

    /// Best-effort removal of the publish's blob prefix, detached from the
    /// caller: the uploader's connection may already be gone.
    fn cleanup_blobs_detached(&self, publish_id: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.delete_path(&publish_id).await {
                warn!(%publish_id, "failed to clean up blobs: {err:#}");
            }
        });
    }

    /// Per-identity upload ceiling: default for unnamed identities (or when
    /// resolution fails), internal for allow-listed names, increased for
    /// everyone else with a name.
    pub async fn limit_for_identity(&self, identity: &str) -> u64 {
        match self.names.resolve_identity(identity).await {
            Err(NameError::NotExists) => DEFAULT_LIMIT,
            Err(err) => {
                warn!(identity, "can't resolve name: {err:#}");
                DEFAULT_LIMIT
            }
            Ok(name) if self.internal_names.contains(&name) => INTERNAL_LIMIT,
            Ok(_) => INCREASED_LIMIT,
        }
    }

    /// One garbage-collection pass. Per-item failures are logged and left
    /// for the next tick.
    pub async fn gc(&self) {
        self.metrics.gc_runs.inc();
        let before = SystemTime::now() - STALE_AGE;

        let started = Instant::now();
        match self.repo.delete_outdated_publishes(before).await {
            Ok(count) => {
                self.metrics.gc_deleted_publishes.inc_by(count);
                info!(count, elapsed = ?started.elapsed(), "deleted outdated publishes");
            }
            Err(err) => warn!("delete outdated publishes: {err:#}"),
        }

        let started = Instant::now();
        match self.repo.delete_outdated_objects(before).await {
            Ok(count) => {
                self.metrics.gc_deleted_objects.inc_by(count);
                info!(count, elapsed = ?started.elapsed(), "deleted outdated objects");
            }
            Err(err) => warn!("delete outdated objects: {err:#}"),
        }

        let started = Instant::now();
        let drained = std::sync::atomic::AtomicU64::new(0);
        let res = self
            .repo
            .iterate_ready_to_delete(|id| {
                let store = self.store.clone();
                let repo = self.repo.clone();
                let drained = &drained;
                async move {
                    // blobs go first: a crash in between leaves only blob
                    // orphans, never a dangling metadata pointer
                    let path = id.to_string();
                    if let Err(err) = store.delete_path(&path).await {
                        warn!(%path, "can't delete blob path: {err:#}");
                        return Ok(());
                    }
                    if let Err(err) = repo.delete_publish(id).await {
                        warn!(%path, "can't delete publish: {err:#}");
                        return Ok(());
                    }
                    drained.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Ok(())
                }
            })
            .await;
        let drained = drained.into_inner();
        if let Err(err) = res {
            warn!("iterate ready-to-delete publishes: {err:#}");
        } else {
            self.metrics.gc_deleted_publishes.inc_by(drained);
            info!(count = drained, elapsed = ?started.elapsed(), "deleted tombstoned publishes");
        }
    }

    /// Runs [`Self::gc`] every five minutes. Ticks never overlap; a slow
    /// pass simply delays the next one.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                service.gc().await;
            }
        })
    }
}

impl std::fmt::Debug for PublishService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishService").finish_non_exhaustive()
    }
}
