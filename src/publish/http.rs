//! HTTP API for snapshot uploads.
//!
//! A single endpoint: `POST /api/upload/{publish_id}/{upload_key}` with the
//! TAR archive as the request body. Success answers
//! `{"uploadUrl": "https://{domain}/{objectId}"}`; failures answer a JSON
//! error body. Everything else on this listener is a JSON 404.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::info;

use super::PublishService;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    upload_url: String,
}

pub(crate) fn router(service: Arc<PublishService>) -> Router {
    Router::new()
        .route("/api/upload/{publish_id}/{upload_key}", post(upload))
        .fallback(not_found)
        .with_state(service)
}

/// The upload API server.
#[derive(Debug)]
pub struct UploadServer {
    addr: SocketAddr,
    task: JoinHandle<io::Result<()>>,
}

impl UploadServer {
    pub async fn spawn(addr: SocketAddr, service: Arc<PublishService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind upload api on {addr}"))?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(axum::serve(listener, router(service)).into_future());
        info!("upload api server listening on {addr}");
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn upload(
    State(service): State<Arc<PublishService>>,
    Path((publish_id, upload_key)): Path<(String, String)>,
    body: Body,
) -> Response {
    let started = Instant::now();

    // Bridge the body through a bounded channel: the TAR reader then owns a
    // plain byte stream, and backpressure still reaches the socket one chunk
    // at a time.
    let mut stream = body.into_data_stream();
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<bytes::Bytes>>(1);
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            if tx.send(chunk.map_err(io::Error::other)).await.is_err() {
                break;
            }
        }
    });
    let reader = StreamReader::new(ReceiverStream::new(rx));

    let result = service.upload_tar(&publish_id, &upload_key, reader).await;
    let error = result.as_ref().err().map(|err| err.to_string());
    info!(
        publish_id = %publish_id,
        elapsed = ?started.elapsed(),
        error = error.as_deref(),
        "upload",
    );
    match result {
        Ok(upload_url) => (StatusCode::OK, Json(UploadResponse { upload_url })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, PublishConfig};
    use crate::db::connect_for_tests;
    use crate::metrics::Metrics;
    use crate::names::{NameService, StaticNameDirectory};
    use crate::repo::PublishRepo;
    use crate::store::MemBlobStore;

    async fn spawn_api() -> (UploadServer, Arc<PublishService>) {
        let service = PublishService::new(
            PublishRepo::new(connect_for_tests().await),
            Arc::new(MemBlobStore::new()),
            Arc::new(NameService::new(Arc::new(StaticNameDirectory::new(&[])))),
            PublishConfig::default(),
            GatewayConfig {
                domain: "pages.test".into(),
                ..Default::default()
            },
            Vec::new(),
            Metrics::default(),
        );
        let server = UploadServer::spawn("127.0.0.1:0".parse().unwrap(), service.clone())
            .await
            .unwrap();
        (server, service)
    }

    fn tiny_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let data = b"<html>".as_slice();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.html", data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn upload_roundtrip_over_http() {
        let (server, service) = spawn_api().await;
        let upload_url = service
            .publish("A", "s1", "o1", "hello", "v1")
            .await
            .unwrap();
        let (id, key) = {
            let mut parts = upload_url.rsplit('/');
            let key = parts.next().unwrap().to_string();
            (parts.next().unwrap().to_string(), key)
        };

        let client = reqwest::Client::new();
        let url = format!("http://{}/api/upload/{}/{}", server.addr(), id, key);
        let response = client
            .post(&url)
            .header("content-type", "application/x-tar")
            .body(tiny_archive())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["uploadUrl"], "https://pages.test/A/hello");

        // wrong method
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 405);

        server.shutdown();
    }

    #[tokio::test]
    async fn errors_carry_json_bodies() {
        let (server, service) = spawn_api().await;
        service
            .publish("A", "s1", "o1", "hello", "v1")
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let url = format!(
            "http://{}/api/upload/{}/wrong-key",
            server.addr(),
            crate::domain::PublishId::new()
        );
        let response = client.post(&url).body(tiny_archive()).send().await.unwrap();
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("invalid upload"));

        let response = client
            .get(format!("http://{}/somewhere/else", server.addr()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "not found");

        server.shutdown();
    }
}
