//! Wire protocol for communication between publishers and the server.
//!
//! Frames are `u64` little-endian length prefixes followed by a
//! postcard-encoded message. A connection starts with a [`Handshake`] and an
//! ack; after that, requests and responses alternate.

use std::io;

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::domain::{ObjectWithPublish, PublishStatus};
use crate::publish::PublishError;

/// Protocol version.
pub const VERSION: u64 = 1;

/// Application-specific offset added to [`ErrorCode`]s on the wire.
pub const ERROR_CODE_OFFSET: u64 = 1100;

/// Frames are metadata only; one MiB is plenty.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Write the given data to the sink, with a length prefix.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        bail!("outgoing message is too large");
    }
    writer.write_u64_le(data.len() as u64).await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Reads a length-prefixed frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let size = match reader.read_u64_le().await {
        Ok(size) => size,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let size = usize::try_from(size)?;
    if size > MAX_MESSAGE_SIZE {
        bail!("incoming message exceeds MAX_MESSAGE_SIZE");
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_msg<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let data = postcard::to_stdvec(msg)?;
    write_frame(writer, &data).await
}

pub async fn read_msg<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>> {
    match read_frame(reader).await? {
        Some(data) => Ok(Some(postcard::from_bytes(&data)?)),
        None => Ok(None),
    }
}

/// Opens a connection: protocol version plus the caller's identity proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u64,
    /// Hex-encoded public key; becomes the authenticated identity.
    pub identity: String,
    /// Unix seconds at signing time, bounds replay.
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub ok: bool,
    pub error_code: Option<u64>,
}

/// Domain error table. The raw discriminants are stable; the wire carries
/// them with [`ERROR_CODE_OFFSET`] added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    Unexpected = 0,
    NotFound = 1,
    AccessDenied = 2,
    UriNotUnique = 3,
}

impl ErrorCode {
    pub fn wire_code(self) -> u64 {
        ERROR_CODE_OFFSET + self as u64
    }

    pub fn from_wire(code: u64) -> Option<Self> {
        match code.checked_sub(ERROR_CODE_OFFSET)? {
            0 => Some(ErrorCode::Unexpected),
            1 => Some(ErrorCode::NotFound),
            2 => Some(ErrorCode::AccessDenied),
            3 => Some(ErrorCode::UriNotUnique),
            _ => None,
        }
    }
}

impl From<&PublishError> for ErrorCode {
    fn from(err: &PublishError) -> Self {
        match err {
            PublishError::NotFound => ErrorCode::NotFound,
            PublishError::UriNotUnique => ErrorCode::UriNotUnique,
            PublishError::AccessDenied => ErrorCode::AccessDenied,
            _ => ErrorCode::Unexpected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ResolveUri(ResolveUriRequest),
    GetPublishStatus(GetPublishStatusRequest),
    Publish(PublishRequest),
    UnPublish(UnPublishRequest),
    ListPublishes(ListPublishesRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveUriRequest {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPublishStatusRequest {
    pub space_id: String,
    pub object_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub space_id: String,
    pub object_id: String,
    pub uri: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnPublishRequest {
    pub space_id: String,
    pub object_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPublishesRequest {
    pub space_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    ResolveUri(PublishInfo),
    GetPublishStatus(PublishInfo),
    Publish(PublishResponse),
    UnPublish,
    ListPublishes(Vec<PublishInfo>),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u64,
    pub message: String,
}

/// Publication state as exposed on the wire. Version and size of a publish
/// leak out only once it reached `Published`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishInfo {
    pub space_id: String,
    pub object_id: String,
    pub uri: String,
    pub timestamp: i64,
    pub status: PublishStatus,
    pub version: String,
    pub size: i64,
}

impl From<&ObjectWithPublish> for PublishInfo {
    fn from(owp: &ObjectWithPublish) -> Self {
        let mut info = PublishInfo {
            space_id: owp.object.space_id.clone(),
            object_id: owp.object.object_id.clone(),
            uri: owp.object.uri.clone(),
            timestamp: owp.object.created_at,
            status: PublishStatus::Created,
            version: String::new(),
            size: 0,
        };
        if let Some(publish) = &owp.publish {
            if publish.status == PublishStatus::Published {
                info.status = PublishStatus::Published;
                info.version = publish.version.clone();
                info.size = publish.size;
            }
        }
        info
    }
}
