//! A server that publishes user-owned documents to the public web.
//!
//! Publishers stake a URI under their identity over the framed RPC, stream a
//! TAR snapshot to the upload HTTP API, and the gateway serves the rendered
//! pages at `/{identity}/{uri}` and `/name/{humanName}/{uri}` through a
//! shared versioned cache.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod db;
pub mod domain;
pub mod gateway;
pub mod metrics;
pub mod names;
pub mod publish;
pub mod render;
pub mod repo;
pub mod rpc;
pub mod server;
pub mod store;

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use crate::domain::PublishStatus;
    use crate::rpc::client::PublishClient;
    use crate::server::Server;

    fn setup_logging() {
        use tracing_subscriber::{prelude::*, EnvFilter};
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .try_init()
            .ok();
    }

    fn snapshot_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let data = b"<h1>hello</h1>".as_slice();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "index.html", data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn integration_smoke() -> anyhow::Result<()> {
        setup_logging();
        let dir = tempfile::tempdir()?;
        let server = Server::spawn_for_tests(dir.path()).await?;

        let key = SigningKey::generate(&mut OsRng);
        let identity = hex::encode(key.verifying_key().to_bytes());
        let mut client = PublishClient::connect(server.rpc_addr(), &key).await?;

        // stake the uri
        let upload_url = client.publish("s1", "o1", "hello", "v1").await?;
        let (publish_id, upload_key) = {
            let mut parts = upload_url.rsplit('/');
            let upload_key = parts.next().unwrap().to_string();
            (parts.next().unwrap().to_string(), upload_key)
        };

        // stream the snapshot to the upload api
        let http = reqwest::Client::new();
        let response = http
            .post(format!(
                "http://{}/api/upload/{}/{}",
                server.upload_addr(),
                publish_id,
                upload_key
            ))
            .header("content-type", "application/x-tar")
            .body(snapshot_archive())
            .send()
            .await?;
        assert_eq!(response.status(), 200);

        // the publish is live
        let info = client.resolve_uri("hello").await?;
        assert_eq!(info.status, PublishStatus::Published);
        assert_eq!(info.version, "v1");

        // and the gateway serves it
        let response = http
            .get(format!("http://{}/{}/hello", server.gateway_addr(), identity))
            .send()
            .await?;
        assert_eq!(response.status(), 200);
        let body = response.text().await?;
        assert!(body.contains(&publish_id));

        // a second read comes from the cache
        let response = http
            .get(format!("http://{}/{}/hello", server.gateway_addr(), identity))
            .send()
            .await?;
        assert_eq!(response.status(), 200);

        client.unpublish("s1", "o1").await?;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let response = http
            .get(format!("http://{}/{}/hello", server.gateway_addr(), identity))
            .send()
            .await?;
        assert_eq!(response.status(), 404);

        server.shutdown();
        Ok(())
    }
}
