//! Headless browser rendering for JS-heavy pages.
//!
//! This module provides the renderer trait consumed by the cache
//! orchestrator and, behind the `render` feature, an implementation using
//! chromiumoxide for headless Chrome/Chromium control.

pub mod directives;
#[cfg(feature = "render")]
pub mod headless;

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use prerender_core::TagRegistry;
use thiserror::Error;
use url::Url;

#[cfg(feature = "render")]
pub use headless::{HeadlessConfig, HeadlessRenderer};

/// Errors that can occur during page rendering.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Failed to launch or connect to browser.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// Failed to navigate to URL.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Failed to get page content.
    #[error("content retrieval failed: {0}")]
    ContentRetrieval(String),

    /// Timeout waiting for page to load.
    #[error("render timeout after {0}ms")]
    Timeout(u64),

    /// The page tried to reach privileged metadata.
    #[error("forbidden: page served compute metadata")]
    Forbidden,

    /// Navigation produced no document response.
    #[error("no response for page")]
    EmptyResponse,

    /// The page rendered its "not found" view.
    #[error("page rendered a not found view")]
    NotFoundView,

    /// Timezone override rejected by the browser.
    #[error("invalid timezone id: {0}")]
    InvalidTimezone(String),

    /// Browser connection closed while the page was being opened.
    #[error("browser closed unexpectedly")]
    BrowserClosed,
}

/// Options for rendering a page.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Render with the mobile viewport and user agent.
    pub is_mobile: bool,

    /// IANA timezone the page should observe.
    pub timezone_id: Option<String>,

    /// Navigation timeout.
    pub timeout: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { is_mobile: false, timezone_id: None, timeout: Duration::from_millis(10_000) }
    }
}

/// Options for capturing a screenshot.
#[derive(Debug, Clone)]
pub struct ScreenshotOptions {
    pub is_mobile: bool,
    pub timezone_id: Option<String>,
    pub timeout: Duration,
    /// Viewport dimensions.
    pub viewport: (u32, u32),
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self { is_mobile: false, timezone_id: None, timeout: Duration::from_millis(10_000), viewport: (1280, 1280) }
    }
}

/// Result of rendering a page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Resolved status code (see [`directives::resolve_status`]).
    pub status: u16,

    /// Custom response headers requested by the page.
    pub headers: BTreeMap<String, String>,

    /// Serialized HTML content.
    pub html: String,

    /// Final URL after redirects.
    pub final_url: Url,

    /// Time taken to render in milliseconds.
    pub render_time_ms: u64,
}

/// Renderer trait for headless browser page rendering.
///
/// Implementations push tag header values seen on GET sub-resource responses
/// into `tags` under [`prerender_core::TagKey::new`] of the rendered URL.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    /// Render a URL to HTML via headless browser.
    async fn render(&self, url: &Url, opts: &RenderOptions, tags: &TagRegistry) -> Result<RenderedPage, RenderError>;

    /// Capture a JPEG screenshot of a URL.
    async fn screenshot(&self, url: &Url, opts: &ScreenshotOptions) -> Result<Bytes, RenderError>;
}
