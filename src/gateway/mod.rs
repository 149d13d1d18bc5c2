//! Public HTTP gateway serving rendered pages through the page cache.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::names::{NameError, NameService};
use crate::publish::{PublishError, PublishService};
use crate::render::{RenderConfig, Renderer, PRISM_CDN_URL, STATIC_CDN_URL};

pub mod cache;

use cache::{CacheKey, PageCache, PageEntry};

#[derive(Clone)]
struct AppState {
    publish: Arc<PublishService>,
    names: Arc<NameService>,
    cache: Arc<PageCache>,
    renderer: Arc<dyn Renderer>,
    config: Arc<GatewayConfig>,
    renderer_version: Arc<str>,
    metrics: Metrics,
}

/// The gateway HTTP server.
#[derive(Debug)]
pub struct GatewayServer {
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
}

impl GatewayServer {
    /// Spawns the gateway and registers the cache-invalidation hook on the
    /// publish service. Fails when the renderer reports no build identity:
    /// cache entries would be unversioned.
    pub async fn spawn(
        config: GatewayConfig,
        publish: Arc<PublishService>,
        names: Arc<NameService>,
        cache: Arc<PageCache>,
        renderer: Arc<dyn Renderer>,
        metrics: Metrics,
    ) -> Result<Self> {
        let renderer_version = renderer.version().to_string();
        ensure!(!renderer_version.is_empty(), "render version not set");
        info!(version = %renderer_version, "render version");

        {
            // invalidations run detached so a slow cache backend never
            // blocks the publishing mutation that fired them
            let cache = cache.clone();
            let version = renderer_version.clone();
            publish.set_invalidate_callback(move |identity, uri| {
                let cache = cache.clone();
                let version = version.clone();
                let identity = identity.to_string();
                let uri = uri.to_string();
                tokio::spawn(async move {
                    cache.invalidate(&identity, &uri, &version).await;
                });
            });
        }

        let serve_static = config.serve_static;
        let addr = config.addr;
        let state = AppState {
            publish,
            names,
            cache,
            renderer,
            config: Arc::new(config),
            renderer_version: renderer_version.into(),
            metrics,
        };

        let mut router = Router::new()
            .route("/name/{name}", get(page_with_name_handler))
            .route("/name/{name}/{*uri}", get(page_with_name_handler))
            .route("/{identity}", get(page_handler))
            .route("/{identity}/{*uri}", get(page_handler));
        if serve_static {
            router = router.nest_service("/static", ServeDir::new("./static"));
        }
        let app = router.with_state(state).layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway on {addr}"))?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(axum::serve(listener, app).into_future());
        info!("gateway server listening on {addr}");
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn page_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Response {
    let identity = params.get("identity").cloned().unwrap_or_default();
    let uri = params.get("uri").cloned().unwrap_or_default();
    serve_page(&state, &identity, &uri, false).await
}

async fn page_with_name_handler(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
) -> Response {
    let name = params.get("name").cloned().unwrap_or_default();
    let uri = params.get("uri").cloned().unwrap_or_default();
    let identity = match state.names.resolve_name(&name).await {
        Ok(record) => record.owner_identity,
        Err(NameError::NotExists) => {
            state.metrics.gateway_not_found.inc();
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        Err(err) => {
            state.metrics.gateway_errors.inc();
            error!("name resolution error: {err:#}");
            return internal_error();
        }
    };
    serve_page(&state, &identity, &uri, true).await
}

async fn serve_page(state: &AppState, identity: &str, uri: &str, with_name: bool) -> Response {
    state.metrics.gateway_requests.inc();
    let key = CacheKey::new(identity, uri, with_name, &state.renderer_version);

    let result = state
        .cache
        .get_or_render(&key, || render_page(state.clone(), key.clone()))
        .await;
    match result {
        Ok(entry) if entry.not_found => {
            state.metrics.gateway_not_found.inc();
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
        Ok(entry) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            entry.body,
        )
            .into_response(),
        Err(err) => {
            state.metrics.gateway_errors.inc();
            error!(identity, uri, "page render error: {err:#}");
            internal_error()
        }
    }
}

/// The cache-miss path: resolve the active snapshot, compose the renderer
/// config, render.
async fn render_page(state: AppState, key: CacheKey) -> anyhow::Result<PageEntry> {
    let object = match state
        .publish
        .resolve_uri_with_identity(&key.identity, &key.uri)
        .await
    {
        Ok(object) => object,
        Err(PublishError::NotFound) => {
            return Ok(PageEntry::not_found(&key.renderer_version));
        }
        Err(err) => return Err(err.into()),
    };
    let Some(active_publish_id) = object.active_publish_id else {
        return Ok(PageEntry::not_found(&key.renderer_version));
    };

    let publish_files_url = format!(
        "{}/{}",
        state.config.publish_files_url.trim_end_matches('/'),
        active_publish_id
    );
    let analytics_code = if key.with_name {
        state.config.analytics_code_members.clone()
    } else {
        state.config.analytics_code.clone()
    };
    let render_config = RenderConfig {
        static_files_url: state.config.static_files_url.clone(),
        publish_files_url,
        prism_cdn_url: PRISM_CDN_URL.to_string(),
        cdn_url: STATIC_CDN_URL.to_string(),
        analytics_code,
    };

    state.metrics.renders.inc();
    let body = match state.renderer.render(&render_config).await {
        Ok(body) => body,
        Err(err) => {
            state.metrics.render_errors.inc();
            return Err(err);
        }
    };
    Ok(PageEntry::page(
        &key.renderer_version,
        String::from_utf8_lossy(&body).into_owned(),
    ))
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NameEntry, PublishConfig};
    use crate::db::connect_for_tests;
    use crate::names::StaticNameDirectory;
    use crate::render::HtmlRenderer;
    use crate::repo::PublishRepo;
    use crate::store::MemBlobStore;
    use super::cache::MemCacheStore;
    use std::io::Cursor;

    struct TestGateway {
        server: GatewayServer,
        service: Arc<PublishService>,
    }

    async fn spawn_gateway() -> TestGateway {
        let gateway_config = GatewayConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            domain: "pages.test".into(),
            publish_files_url: "https://files.test".into(),
            analytics_code: "<!-- analytics:anon -->".into(),
            analytics_code_members: "<!-- analytics:members -->".into(),
            ..Default::default()
        };
        let names = Arc::new(NameService::new(Arc::new(StaticNameDirectory::new(&[
            NameEntry {
                name: "alice".into(),
                identity: "id-a".into(),
            },
        ]))));
        let service = PublishService::new(
            PublishRepo::new(connect_for_tests().await),
            Arc::new(MemBlobStore::new()),
            names.clone(),
            PublishConfig::default(),
            gateway_config.clone(),
            Vec::new(),
            Metrics::default(),
        );
        let cache = Arc::new(PageCache::new(
            Box::new(MemCacheStore::new()),
            Metrics::default(),
        ));
        let server = GatewayServer::spawn(
            gateway_config,
            service.clone(),
            names,
            cache,
            Arc::new(HtmlRenderer::from_build_info()),
            Metrics::default(),
        )
        .await
        .unwrap();
        TestGateway { server, service }
    }

    fn tar_with_index() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let data = b"<html>".as_slice();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.html", data).unwrap();
        builder.into_inner().unwrap()
    }

    async fn publish_page(service: &PublishService, identity: &str, uri: &str, version: &str) {
        let url = service
            .publish(identity, "s1", "o1", uri, version)
            .await
            .unwrap();
        let mut parts = url.rsplit('/');
        let key = parts.next().unwrap().to_string();
        let id = parts.next().unwrap().to_string();
        service
            .upload_tar(&id, &key, Cursor::new(tar_with_index()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn serves_published_pages() {
        let gw = spawn_gateway().await;
        publish_page(&gw.service, "id-a", "hello", "v1").await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/id-a/hello", gw.server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"],
            "text/html; charset=utf-8"
        );
        let body = response.text().await.unwrap();
        assert!(body.contains("https://files.test/"));
        assert!(body.contains("<!-- analytics:anon -->"));

        let response = client
            .get(format!("http://{}/id-a/missing", gw.server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        gw.server.shutdown();
    }

    #[tokio::test]
    async fn resolves_human_names() {
        let gw = spawn_gateway().await;
        publish_page(&gw.service, "id-a", "hello", "v1").await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/name/alice/hello", gw.server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("<!-- analytics:members -->"));

        let response = client
            .get(format!("http://{}/name/nobody/hello", gw.server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        gw.server.shutdown();
    }

    #[tokio::test]
    async fn republish_invalidates_the_cached_body() {
        let gw = spawn_gateway().await;
        publish_page(&gw.service, "id-a", "hello", "v1").await;

        let client = reqwest::Client::new();
        let url = format!("http://{}/id-a/hello", gw.server.addr());
        let first = client.get(&url).send().await.unwrap().text().await.unwrap();
        // warm cache: same body again
        assert_eq!(
            client.get(&url).send().await.unwrap().text().await.unwrap(),
            first
        );

        publish_page(&gw.service, "id-a", "hello", "v2").await;
        // invalidation runs on a detached task
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let second = client.get(&url).send().await.unwrap().text().await.unwrap();
        // the new snapshot has a new publish id, so the page points at a
        // different blob prefix
        assert_ne!(second, first);
        gw.server.shutdown();
    }

    #[tokio::test]
    async fn unpublished_uri_stops_serving() {
        let gw = spawn_gateway().await;
        publish_page(&gw.service, "id-a", "hello", "v1").await;

        let client = reqwest::Client::new();
        let url = format!("http://{}/id-a/hello", gw.server.addr());
        assert_eq!(client.get(&url).send().await.unwrap().status(), 200);

        gw.service.unpublish("id-a", "s1", "o1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(client.get(&url).send().await.unwrap().status(), 404);
        gw.server.shutdown();
    }

    #[tokio::test]
    async fn refuses_to_start_without_renderer_version() {
        struct VersionlessRenderer;

        #[async_trait::async_trait]
        impl Renderer for VersionlessRenderer {
            fn version(&self) -> &str {
                ""
            }

            async fn render(&self, _config: &RenderConfig) -> anyhow::Result<Vec<u8>> {
                unreachable!("never reached; startup must fail first")
            }
        }

        let names = Arc::new(NameService::new(Arc::new(StaticNameDirectory::new(&[]))));
        let service = PublishService::new(
            PublishRepo::new(connect_for_tests().await),
            Arc::new(MemBlobStore::new()),
            names.clone(),
            PublishConfig::default(),
            GatewayConfig::default(),
            Vec::new(),
            Metrics::default(),
        );
        let cache = Arc::new(PageCache::new(
            Box::new(MemCacheStore::new()),
            Metrics::default(),
        ));
        let err = GatewayServer::spawn(
            GatewayConfig {
                addr: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            service,
            names,
            cache,
            Arc::new(VersionlessRenderer),
            Metrics::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("render version not set"));
    }
}
