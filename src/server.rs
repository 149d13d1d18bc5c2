//! The main server, combining every component with explicit startup order
//! and shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::gateway::cache::{CacheStore, MemCacheStore, PageCache, RedisCacheStore};
use crate::gateway::GatewayServer;
use crate::metrics::{start_metrics_server, Metrics};
use crate::names::{NameService, StaticNameDirectory};
use crate::publish::http::UploadServer;
use crate::publish::{internal_names_from_env, PublishService};
use crate::render::{HtmlRenderer, Renderer};
use crate::repo::PublishRepo;
use crate::rpc::auth::Ed25519Verifier;
use crate::rpc::server::RpcServer;
use crate::store::{BlobStore, MemBlobStore, S3BlobStore};

const NAME_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the server and run until the `Ctrl-C` signal is received, then
/// shut down.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let server = Server::spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown();
    Ok(())
}

/// All running parts of the service.
///
/// Components are built leaves-first: database, repository, blob store, name
/// service, renderer, publish service, page cache; then the listeners and
/// background tasks on top of them.
#[derive(Debug)]
pub struct Server {
    rpc: RpcServer,
    upload: UploadServer,
    gateway: GatewayServer,
    gc_task: Option<JoinHandle<()>>,
    name_sweep_task: JoinHandle<()>,
    metrics_task: Option<JoinHandle<Result<()>>>,
}

impl Server {
    pub async fn spawn(config: Config) -> Result<Self> {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        let pool = db::connect(&config.db.url).await?;
        let repo = PublishRepo::new(pool);

        let store: Arc<dyn BlobStore> = if config.store.bucket.is_empty() {
            warn!("no s3 bucket configured; blobs are held in memory");
            Arc::new(MemBlobStore::new())
        } else {
            Arc::new(S3BlobStore::new(&config.store)?)
        };

        let names = Arc::new(NameService::new(Arc::new(StaticNameDirectory::new(
            &config.names.entries,
        ))));
        let renderer: Arc<dyn Renderer> = Arc::new(HtmlRenderer::from_build_info());

        let service = PublishService::new(
            repo,
            store,
            names.clone(),
            config.publish.clone(),
            config.gateway.clone(),
            internal_names_from_env(),
            metrics.clone(),
        );

        let cache_store: Box<dyn CacheStore> = match &config.cache.redis_url {
            Some(url) => Box::new(RedisCacheStore::connect(url).await?),
            None => Box::new(MemCacheStore::new()),
        };
        let cache = Arc::new(PageCache::new(cache_store, metrics.clone()));

        let rpc = RpcServer::spawn(
            config.rpc.addr,
            service.clone(),
            Arc::new(Ed25519Verifier::new()),
            metrics.clone(),
        )
        .await?;
        let upload = UploadServer::spawn(config.publish.http_api_addr, service.clone()).await?;
        let gateway = GatewayServer::spawn(
            config.gateway.clone(),
            service.clone(),
            names.clone(),
            cache,
            renderer,
            metrics.clone(),
        )
        .await?;

        let gc_task = config.publish.cleanup_on.then(|| service.spawn_gc());
        let name_sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(NAME_CACHE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                names.evict_expired();
            }
        });
        let metrics_task = config
            .metrics
            .addr
            .map(|addr| tokio::spawn(start_metrics_server(addr, Arc::new(registry))));

        Ok(Self {
            rpc,
            upload,
            gateway,
            gc_task,
            name_sweep_task,
            metrics_task,
        })
    }

    /// Stops every listener and background task.
    pub fn shutdown(self) {
        self.rpc.shutdown();
        self.upload.shutdown();
        self.gateway.shutdown();
        if let Some(task) = self.gc_task {
            task.abort();
        }
        self.name_sweep_task.abort();
        if let Some(task) = self.metrics_task {
            task.abort();
        }
    }

    pub fn rpc_addr(&self) -> std::net::SocketAddr {
        self.rpc.addr()
    }

    pub fn upload_addr(&self) -> std::net::SocketAddr {
        self.upload.addr()
    }

    pub fn gateway_addr(&self) -> std::net::SocketAddr {
        self.gateway.addr()
    }

    /// A full server on ephemeral ports with an on-disk database under
    /// `dir`, in-memory blobs and an in-process page cache.
    #[cfg(test)]
    pub(crate) async fn spawn_for_tests(dir: &std::path::Path) -> Result<Self> {
        let mut config = Config::default();
        config.db.url = format!("sqlite://{}", dir.join("webpub.db").display());
        config.rpc.addr = "127.0.0.1:0".parse().unwrap();
        config.publish.http_api_addr = "127.0.0.1:0".parse().unwrap();
        config.gateway.addr = "127.0.0.1:0".parse().unwrap();
        config.publish.cleanup_on = false;
        Self::spawn(config).await
    }
}
