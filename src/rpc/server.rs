//! RPC server: accept loop and the thin handlers translating wire messages
//! into service calls.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::publish::{PublishError, PublishService};

use super::auth::IdentityVerifier;
use super::wire::{
    read_msg, write_msg, ErrorCode, ErrorResponse, Handshake, HandshakeAck, PublishInfo,
    PublishResponse, Request, Response, VERSION,
};

/// The RPC endpoint.
#[derive(Debug)]
pub struct RpcServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RpcServer {
    pub async fn spawn(
        addr: SocketAddr,
        service: Arc<PublishService>,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: Metrics,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc on {addr}"))?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(listener, service, verifier, metrics));
        info!("rpc server listening on {addr}");
        Ok(Self { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<PublishService>,
    verifier: Arc<dyn IdentityVerifier>,
    metrics: Metrics,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let service = service.clone();
                let verifier = verifier.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, service, verifier, metrics).await
                    {
                        debug!(%peer, "rpc connection closed: {err:#}");
                    }
                });
            }
            Err(err) => warn!("rpc accept error: {err:#}"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<PublishService>,
    verifier: Arc<dyn IdentityVerifier>,
    metrics: Metrics,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let handshake: Handshake = read_msg(&mut reader)
        .await?
        .context("no handshake received")?;
    if handshake.version != VERSION {
        refuse(&mut writer, ErrorCode::Unexpected).await?;
        anyhow::bail!(
            "expected version {VERSION} but got {}",
            handshake.version
        );
    }
    let identity = match verifier.verify(&handshake) {
        Ok(identity) => identity,
        Err(_) => {
            metrics.rpc_errors.inc();
            refuse(&mut writer, ErrorCode::AccessDenied).await?;
            anyhow::bail!("handshake refused for {peer}");
        }
    };
    write_msg(
        &mut writer,
        &HandshakeAck {
            ok: true,
            error_code: None,
        },
    )
    .await?;
    debug!(%peer, identity, "rpc connection authenticated");

    while let Some(request) = read_msg::<_, Request>(&mut reader).await? {
        let response = dispatch(&service, &identity, peer, request, &metrics).await;
        write_msg(&mut writer, &response).await?;
    }
    Ok(())
}

async fn refuse(writer: &mut OwnedWriteHalf, code: ErrorCode) -> Result<()> {
    write_msg(
        writer,
        &HandshakeAck {
            ok: false,
            error_code: Some(code.wire_code()),
        },
    )
    .await
}

/// Pure translation: unpack the request, call the service with the
/// connection's identity, map the domain error onto the code table. Every
/// call leaves a request-log line with duration and peer address.
async fn dispatch(
    service: &PublishService,
    identity: &str,
    peer: SocketAddr,
    request: Request,
    metrics: &Metrics,
) -> Response {
    metrics.rpc_requests.inc();
    let started = Instant::now();
    let (method, space_id, object_id) = request_log_fields(&request);

    let result = match request {
        Request::ResolveUri(req) => service
            .resolve_uri(identity, &req.uri)
            .await
            .map(|owp| Response::ResolveUri(PublishInfo::from(&owp))),
        Request::GetPublishStatus(req) => service
            .get_publish_status(identity, &req.space_id, &req.object_id)
            .await
            .map(|owp| Response::GetPublishStatus(PublishInfo::from(&owp))),
        Request::Publish(req) => service
            .publish(identity, &req.space_id, &req.object_id, &req.uri, &req.version)
            .await
            .map(|upload_url| Response::Publish(PublishResponse { upload_url })),
        Request::UnPublish(req) => service
            .unpublish(identity, &req.space_id, &req.object_id)
            .await
            .map(|()| Response::UnPublish),
        Request::ListPublishes(req) => service
            .list_publishes(identity, req.space_id.as_deref())
            .await
            .map(|list| Response::ListPublishes(list.iter().map(PublishInfo::from).collect())),
    };

    let error = result.as_ref().err().map(PublishError::to_string);
    info!(
        method,
        addr = %peer,
        space_id = space_id.as_deref(),
        object_id = object_id.as_deref(),
        elapsed = ?started.elapsed(),
        error = error.as_deref(),
        "rpc",
    );
    match result {
        Ok(response) => response,
        Err(err) => {
            metrics.rpc_errors.inc();
            Response::Error(ErrorResponse {
                code: ErrorCode::from(&err).wire_code(),
                message: err.to_string(),
            })
        }
    }
}

fn request_log_fields(request: &Request) -> (&'static str, Option<String>, Option<String>) {
    match request {
        Request::ResolveUri(_) => ("publish.resolveUri", None, None),
        Request::GetPublishStatus(req) => (
            "publish.getPublishStatus",
            Some(req.space_id.clone()),
            Some(req.object_id.clone()),
        ),
        Request::Publish(req) => (
            "publish.publish",
            Some(req.space_id.clone()),
            Some(req.object_id.clone()),
        ),
        Request::UnPublish(req) => (
            "publish.unPublish",
            Some(req.space_id.clone()),
            Some(req.object_id.clone()),
        ),
        Request::ListPublishes(req) => ("publish.listPublishes", req.space_id.clone(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, PublishConfig};
    use crate::db::connect_for_tests;
    use crate::domain::PublishStatus;
    use crate::names::{NameService, StaticNameDirectory};
    use crate::repo::PublishRepo;
    use crate::rpc::auth::Ed25519Verifier;
    use crate::rpc::client::{ClientError, PublishClient};
    use crate::store::MemBlobStore;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::io::Cursor;

    async fn spawn_server() -> (RpcServer, Arc<PublishService>, Arc<MemBlobStore>) {
        let store = Arc::new(MemBlobStore::new());
        let service = PublishService::new(
            PublishRepo::new(connect_for_tests().await),
            store.clone(),
            Arc::new(NameService::new(Arc::new(StaticNameDirectory::new(&[])))),
            PublishConfig {
                upload_url_prefix: "http://upload.test/api/upload".into(),
                ..Default::default()
            },
            GatewayConfig {
                domain: "pages.test".into(),
                ..Default::default()
            },
            Vec::new(),
            Metrics::default(),
        );
        let server = RpcServer::spawn(
            "127.0.0.1:0".parse().unwrap(),
            service.clone(),
            Arc::new(Ed25519Verifier::new()),
            Metrics::default(),
        )
        .await
        .unwrap();
        (server, service, store)
    }

    fn tar_with_index() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let data = b"<html>8b".as_slice();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.html", data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn publish_flow_over_rpc() {
        let (server, service, _store) = spawn_server().await;
        let key = SigningKey::generate(&mut OsRng);
        let identity = hex::encode(key.verifying_key().to_bytes());
        let mut client = PublishClient::connect(server.addr(), &key).await.unwrap();

        let err = client.resolve_uri("hello").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound));

        let upload_url = client.publish("s1", "o1", "hello", "v1").await.unwrap();
        let (id, upload_key) = {
            let mut parts = upload_url.rsplit('/');
            let upload_key = parts.next().unwrap().to_string();
            (parts.next().unwrap().to_string(), upload_key)
        };
        service
            .upload_tar(&id, &upload_key, Cursor::new(tar_with_index()))
            .await
            .unwrap();

        let info = client.resolve_uri("hello").await.unwrap();
        assert_eq!(info.status, PublishStatus::Published);
        assert_eq!(info.version, "v1");
        assert_eq!(info.size, 8);
        assert_eq!(info.uri, "hello");
        // the identity really came from the connection key
        assert!(service.resolve_uri(&identity, "hello").await.is_ok());

        let status = client.get_publish_status("s1", "o1").await.unwrap();
        assert_eq!(status.status, PublishStatus::Published);

        let list = client.list_publishes(None).await.unwrap();
        assert_eq!(list.len(), 1);

        client.unpublish("s1", "o1").await.unwrap();
        assert!(matches!(
            client.resolve_uri("hello").await.unwrap_err(),
            ClientError::NotFound
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn uri_collision_maps_to_wire_code() {
        let (server, _service, _store) = spawn_server().await;
        let key = SigningKey::generate(&mut OsRng);
        let mut client = PublishClient::connect(server.addr(), &key).await.unwrap();

        client.publish("s1", "o1", "dup", "v1").await.unwrap();
        let err = client.publish("s1", "o2", "dup", "v1").await.unwrap_err();
        assert!(matches!(err, ClientError::UriNotUnique));
        server.shutdown();
    }

    #[tokio::test]
    async fn identities_are_isolated() {
        let (server, _service, _store) = spawn_server().await;
        let mut alice = PublishClient::connect(server.addr(), &SigningKey::generate(&mut OsRng))
            .await
            .unwrap();
        let mut bob = PublishClient::connect(server.addr(), &SigningKey::generate(&mut OsRng))
            .await
            .unwrap();

        alice.publish("s1", "o1", "shared", "v1").await.unwrap();
        // the same uri is free under a different identity
        bob.publish("s1", "o1", "shared", "v1").await.unwrap();
        assert!(matches!(
            bob.resolve_uri("missing").await.unwrap_err(),
            ClientError::NotFound
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn bad_signature_is_refused() {
        let (server, _service, _store) = spawn_server().await;
        let key = SigningKey::generate(&mut OsRng);
        let mut handshake = crate::rpc::auth::signed_handshake(&key);
        handshake.signature[0] ^= 0xff;
        let err = PublishClient::connect_with(server.addr(), handshake)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AccessDenied));
        server.shutdown();
    }
}
