//! Typed client for the publish RPC.

use std::net::SocketAddr;

use ed25519_dalek::SigningKey;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::auth::signed_handshake;
use super::wire::{
    read_msg, write_msg, ErrorCode, Handshake, HandshakeAck, ListPublishesRequest, PublishInfo,
    PublishRequest, Request, Response, ResolveUriRequest, UnPublishRequest,
    GetPublishStatusRequest,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,
    #[error("uri is not unique")]
    UriNotUnique,
    #[error("access denied")]
    AccessDenied,
    #[error("remote error {code}: {message}")]
    Remote { code: u64, message: String },
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    fn from_wire(code: u64, message: String) -> Self {
        match ErrorCode::from_wire(code) {
            Some(ErrorCode::NotFound) => ClientError::NotFound,
            Some(ErrorCode::UriNotUnique) => ClientError::UriNotUnique,
            Some(ErrorCode::AccessDenied) => ClientError::AccessDenied,
            _ => ClientError::Remote { code, message },
        }
    }
}

/// A connection to the publish RPC, authenticated as one identity.
#[derive(Debug)]
pub struct PublishClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl PublishClient {
    /// Connects and authenticates with the given account key.
    pub async fn connect(addr: SocketAddr, key: &SigningKey) -> Result<Self, ClientError> {
        Self::connect_with(addr, signed_handshake(key)).await
    }

    /// Connects with a prepared handshake; lets callers (and tests) control
    /// the identity proof.
    pub async fn connect_with(addr: SocketAddr, handshake: Handshake) -> Result<Self, ClientError> {
        debug!("client: connecting to {addr}");
        let stream = TcpStream::connect(addr)
            .await
            .map_err(anyhow::Error::from)?;
        let (mut reader, mut writer) = stream.into_split();

        write_msg(&mut writer, &handshake).await?;
        let ack: HandshakeAck = read_msg(&mut reader)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed during handshake"))?;
        if !ack.ok {
            return Err(match ack.error_code {
                Some(code) => ClientError::from_wire(code, "handshake refused".into()),
                None => ClientError::AccessDenied,
            });
        }
        Ok(Self { reader, writer })
    }

    pub async fn resolve_uri(&mut self, uri: &str) -> Result<PublishInfo, ClientError> {
        match self
            .call(Request::ResolveUri(ResolveUriRequest { uri: uri.into() }))
            .await?
        {
            Response::ResolveUri(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_publish_status(
        &mut self,
        space_id: &str,
        object_id: &str,
    ) -> Result<PublishInfo, ClientError> {
        match self
            .call(Request::GetPublishStatus(GetPublishStatusRequest {
                space_id: space_id.into(),
                object_id: object_id.into(),
            }))
            .await?
        {
            Response::GetPublishStatus(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Stakes a URI; returns the one-shot upload URL.
    pub async fn publish(
        &mut self,
        space_id: &str,
        object_id: &str,
        uri: &str,
        version: &str,
    ) -> Result<String, ClientError> {
        match self
            .call(Request::Publish(PublishRequest {
                space_id: space_id.into(),
                object_id: object_id.into(),
                uri: uri.into(),
                version: version.into(),
            }))
            .await?
        {
            Response::Publish(resp) => Ok(resp.upload_url),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unpublish(&mut self, space_id: &str, object_id: &str) -> Result<(), ClientError> {
        match self
            .call(Request::UnPublish(UnPublishRequest {
                space_id: space_id.into(),
                object_id: object_id.into(),
            }))
            .await?
        {
            Response::UnPublish => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_publishes(
        &mut self,
        space_id: Option<&str>,
    ) -> Result<Vec<PublishInfo>, ClientError> {
        match self
            .call(Request::ListPublishes(ListPublishesRequest {
                space_id: space_id.map(str::to_string),
            }))
            .await?
        {
            Response::ListPublishes(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        write_msg(&mut self.writer, &request).await?;
        let response: Response = read_msg(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        match response {
            Response::Error(err) => Err(ClientError::from_wire(err.code, err.message)),
            other => Ok(other),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    debug!(?response, "mismatched response variant");
    ClientError::UnexpectedResponse
}
