//! The HTML renderer seam.
//!
//! Rendering proper is an external concern: the gateway only needs a pure
//! function from a [`RenderConfig`] to page bytes, plus a build-identity
//! string that versions every cached body. [`HtmlRenderer`] is the stock
//! implementation, emitting the embedded page shell.

use async_trait::async_trait;

pub const PRISM_CDN_URL: &str = "https://cdn.jsdelivr.net/npm/prismjs@1.29.0";
pub const STATIC_CDN_URL: &str = "https://webpub-static.fra1.cdn.digitaloceanspaces.com";

const PAGE_TEMPLATE: &str = include_str!("../assets/page.html");

/// Everything a renderer needs to produce one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    pub static_files_url: String,
    /// Base URL of the snapshot's blobs, already joined with the publish id.
    pub publish_files_url: String,
    pub prism_cdn_url: String,
    pub cdn_url: String,
    /// Analytics snippet injected into the page head; may be empty.
    pub analytics_code: String,
}

#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Build identity of the renderer. Cached bodies are keyed by it; the
    /// gateway refuses to start when it is empty.
    fn version(&self) -> &str;

    async fn render(&self, config: &RenderConfig) -> anyhow::Result<Vec<u8>>;
}

/// Stock renderer substituting the config into the embedded shell template.
#[derive(Debug, Clone)]
pub struct HtmlRenderer {
    version: String,
}

impl HtmlRenderer {
    /// Reads the build identity baked in at compile time.
    pub fn from_build_info() -> Self {
        let version = option_env!("WEBPUB_RENDER_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
        Self {
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl Renderer for HtmlRenderer {
    fn version(&self) -> &str {
        &self.version
    }

    async fn render(&self, config: &RenderConfig) -> anyhow::Result<Vec<u8>> {
        let page = PAGE_TEMPLATE
            .replace("{{static_files_url}}", &config.static_files_url)
            .replace("{{publish_files_url}}", &config.publish_files_url)
            .replace("{{prism_cdn_url}}", &config.prism_cdn_url)
            .replace("{{cdn_url}}", &config.cdn_url)
            .replace("{{analytics_code}}", &config.analytics_code);
        Ok(page.into_bytes())
    }
}
