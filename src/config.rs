//! Server configuration, loaded from a TOML file.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration with one section per component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    pub publish: PublishConfig,
    pub rpc: RpcConfig,
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub names: NamesConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// sqlx connect URL.
    pub url: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://webpub.db".to_string(),
        }
    }
}

/// S3-compatible blob storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Custom endpoint for self-hosted or non-AWS gateways; AWS when unset.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Permit plain-HTTP endpoints (local development).
    pub allow_http: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: String::new(),
            access_key: None,
            secret_key: None,
            allow_http: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Prefix of upload URLs handed to publishers; the publish id and upload
    /// key are appended to it.
    pub upload_url_prefix: String,
    /// Bind address of the upload HTTP API.
    pub http_api_addr: SocketAddr,
    /// Enables the periodic garbage collection loop.
    pub cleanup_on: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            upload_url_prefix: "http://localhost:8091/api/upload".to_string(),
            http_api_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8091)),
            cleanup_on: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub addr: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8092)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    /// Public domain used when composing result URLs for publishers.
    pub domain: String,
    pub static_files_url: String,
    /// Base URL under which uploaded snapshot blobs are reachable.
    pub publish_files_url: String,
    /// Serve `./static` under `/static/` from this process.
    pub serve_static: bool,
    pub analytics_code: String,
    /// Variant served on `/name/{name}` pages.
    pub analytics_code_members: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            domain: "localhost:8080".to_string(),
            static_files_url: "/static".to_string(),
            publish_files_url: String::new(),
            serve_static: false,
            analytics_code: String::new(),
            analytics_code_members: String::new(),
        }
    }
}

/// Rendered-page cache backend. In-process memory cache unless a redis URL
/// is configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
}

/// Static name-directory table; stands in for the upstream directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesConfig {
    pub entries: Vec<NameEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameEntry {
    pub name: String,
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Bind address of the OpenMetrics endpoint; disabled when unset.
    pub addr: Option<SocketAddr>,
}
