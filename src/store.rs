//! Blob storage adapter over an S3-compatible object KV.
//!
//! The service only ever needs three operations, so they form a narrow trait
//! with two implementations: [`S3BlobStore`] over the `object_store` SDK for
//! production, and [`MemBlobStore`] for tests and local development.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, MultipartUpload, ObjectStore, PutMultipartOpts, PutOptions, PutPayload,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::config::StoreConfig;

/// Entries at or below this size go up in a single request; larger ones are
/// streamed as a multipart upload in parts of this size.
const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Backend(#[from] object_store::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One blob on its way into storage.
pub struct BlobFile {
    pub name: String,
    /// Declared size in bytes; the content length of the upload.
    pub size: u64,
    pub content_type: String,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl BlobFile {
    /// Content type is guessed from the file name, octet-stream when unknown.
    pub fn new(name: String, size: u64, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        let content_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();
        Self {
            name,
            size,
            content_type,
            reader,
        }
    }
}

impl std::fmt::Debug for BlobFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Streaming upload with an explicit content length.
    async fn put(&self, file: BlobFile) -> StoreResult<()>;

    /// Returns a reader over the blob, [`StoreError::NotFound`] for missing
    /// keys.
    async fn get(&self, key: &str) -> StoreResult<Box<dyn AsyncRead + Send + Unpin>>;

    /// List-then-batch-delete of every key under `prefix`. An empty prefix
    /// listing is a no-op, not an error.
    async fn delete_path(&self, prefix: &str) -> StoreResult<()>;
}

/// Production store backed by an S3-compatible bucket.
#[derive(Debug)]
pub struct S3BlobStore {
    client: AmazonS3,
}

impl S3BlobStore {
    /// Builds the client from configuration. Custom endpoints, self-hosted
    /// or Google-style gateways included, go through `endpoint` +
    /// `allow_http`.
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.bucket.is_empty(), "s3 bucket is empty");
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);
        if let Some(endpoint) = &config.endpoint {
            debug!(%endpoint, "using custom s3 endpoint");
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(config.allow_http);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, mut file: BlobFile) -> StoreResult<()> {
        let location = ObjectPath::from(file.name.as_str());
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, file.content_type.clone().into());

        if file.size as usize <= PART_SIZE {
            let mut buf = Vec::with_capacity(file.size as usize);
            file.reader.read_to_end(&mut buf).await?;
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            self.client
                .put_opts(&location, PutPayload::from(buf), opts)
                .await?;
            return Ok(());
        }

        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };
        let mut upload = self.client.put_multipart_opts(&location, opts).await?;
        let result = copy_multipart(&mut file.reader, upload.as_mut()).await;
        if let Err(err) = result {
            if let Err(abort_err) = upload.abort().await {
                warn!(key = %file.name, "failed to abort multipart upload: {abort_err:#}");
            }
            return Err(err);
        }
        upload.complete().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Box<dyn AsyncRead + Send + Unpin>> {
        let location = ObjectPath::from(key);
        let result = self.client.get(&location).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => StoreError::NotFound,
            other => StoreError::Backend(other),
        })?;
        let stream = result.into_stream().map_err(io::Error::other);
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }

    async fn delete_path(&self, prefix: &str) -> StoreResult<()> {
        let prefix = ObjectPath::from(prefix);
        let locations = self
            .client
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .boxed();
        self.client
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

async fn copy_multipart(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    upload: &mut dyn MultipartUpload,
) -> StoreResult<()> {
    loop {
        let mut chunk = BytesMut::with_capacity(PART_SIZE);
        while chunk.len() < PART_SIZE {
            let read = reader.read_buf(&mut chunk).await?;
            if read == 0 {
                break;
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        upload.put_part(PutPayload::from(chunk.freeze())).await?;
    }
}

/// In-memory store keyed by blob name. Used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemBlobStore {
    blobs: Mutex<BTreeMap<String, (Bytes, String)>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.lock().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.lock().get(key).map(|(_, ct)| ct.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, mut file: BlobFile) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(file.size as usize);
        file.reader.read_to_end(&mut buf).await?;
        self.blobs
            .lock()
            .insert(file.name, (Bytes::from(buf), file.content_type));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Box<dyn AsyncRead + Send + Unpin>> {
        let bytes = self
            .blobs
            .lock()
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or(StoreError::NotFound)?;
        Ok(Box::new(io::Cursor::new(bytes.to_vec())))
    }

    async fn delete_path(&self, prefix: &str) -> StoreResult<()> {
        // prefixes are path segments, as in the S3 listing
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let mut blobs = self.blobs.lock();
        blobs.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
