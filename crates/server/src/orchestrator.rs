//! Cache-aside render orchestration.
//!
//! Each render request is looked up in the snapshot store first. A miss
//! renders the page under the configured timeout with a fresh tag registry,
//! stores successful (200) results and optionally reports 404/500 outcomes to
//! the failure notifier.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prerender_client::{FailureNotifier, RenderOptions, RenderedPage, Renderer, ScreenshotOptions, UrlGuard};
use prerender_core::cache::{Payload, RequestMeta, digest, invalidation_key, sanitize};
use prerender_core::{AppConfig, CachedSnapshot, Digest, SnapshotRecord, SnapshotStore, TagKey, TagRegistry};
use url::Url;

use crate::error::ServerError;

pub const CACHED_HEADER: &str = "x-prerender-cached";
pub const RENDERER_HEADER: &str = "x-renderer";
pub const RENDERER_NAME: &str = "prerender";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const JSON_CONTENT_TYPE: &str = "application/json";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Slack past the render timeout before a renderer that overran its own
/// deadline is abandoned.
const RENDERER_GRACE: Duration = Duration::from_millis(500);

/// A render request as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    /// Request path and query as received, used to derive the cache key.
    pub raw_path: String,
    /// Page to render.
    pub url: String,
    pub mobile: bool,
    pub timezone_id: Option<String>,
    pub refresh_cache: bool,
    pub method: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Text(String),
    Binary(Bytes),
}

impl From<Payload> for ResponseBody {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Text(text) => ResponseBody::Text(text),
            Payload::Binary(bytes) => ResponseBody::Binary(Bytes::from(bytes)),
        }
    }
}

/// Response produced for a render request.
#[derive(Debug, Clone)]
pub struct RenderResponse {
    pub status: u16,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

impl RenderResponse {
    fn from_error(err: &ServerError) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), TEXT_CONTENT_TYPE.to_string());
        if matches!(err, ServerError::RenderTimeout(_)) {
            headers.insert("connection".to_string(), "close".to_string());
        }
        Self { status: err.status().as_u16(), headers, body: ResponseBody::Text(err.body()) }
    }

    fn from_snapshot(snapshot: CachedSnapshot) -> Self {
        let saved_at = http_date(snapshot.saved_at);
        let status = snapshot.status();
        let mut headers = snapshot.record.response_headers.header;
        headers.insert(CACHED_HEADER.to_string(), saved_at);
        Self { status, headers, body: snapshot.record.response_body.into() }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Coordinates cache lookups, rendering, storage and failure alerts.
pub struct CacheOrchestrator {
    renderer: Arc<dyn Renderer>,
    store: Option<Arc<SnapshotStore>>,
    guard: UrlGuard,
    notifier: Option<Arc<dyn FailureNotifier>>,
    timeout: Duration,
    response_headers: BTreeMap<String, String>,
    viewport: (u32, u32),
    viewport_mobile: (u32, u32),
}

impl CacheOrchestrator {
    /// `store` is `None` when caching is disabled.
    pub fn new(
        renderer: Arc<dyn Renderer>, store: Option<Arc<SnapshotStore>>, guard: UrlGuard, config: &AppConfig,
    ) -> Self {
        let response_headers = config
            .response_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();

        Self {
            renderer,
            store,
            guard,
            notifier: None,
            timeout: config.timeout(),
            response_headers,
            viewport: (config.width, config.height),
            viewport_mobile: (config.width_mobile, config.height_mobile),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Serve `request` from the cache or render it.
    pub async fn render(&self, request: &RenderRequest) -> RenderResponse {
        if self.guard.is_restricted_target(&request.url) {
            tracing::info!(url = %request.url, "refusing restricted url");
            return RenderResponse::from_error(&ServerError::RestrictedUrl(request.url.clone()));
        }

        let Ok(url) = Url::parse(&request.url) else {
            return RenderResponse::from_error(&ServerError::RestrictedUrl(request.url.clone()));
        };

        let key = sanitize(&request.raw_path);
        let entry = self.store.as_deref().map(|store| (store, digest(&key)));

        if let Some((store, digest)) = &entry
            && let Some(snapshot) = store.lookup(digest, request.refresh_cache).await
        {
            tracing::debug!(key = %key, digest = %digest, "cache hit");
            return RenderResponse::from_snapshot(snapshot);
        }

        tracing::debug!(key = %key, refresh = request.refresh_cache, "cache miss");

        let tags = TagRegistry::new();
        let tag_key = TagKey::new(url.as_str(), request.mobile);
        let opts =
            RenderOptions { is_mobile: request.mobile, timezone_id: request.timezone_id.clone(), timeout: self.timeout };

        let render = self.renderer.render(&url, &opts, &tags);
        let outcome = match tokio::time::timeout(self.timeout + RENDERER_GRACE, render).await {
            Ok(result) => result.map_err(ServerError::from),
            Err(_) => Err(ServerError::RenderTimeout(self.timeout.as_millis() as u64)),
        };

        let response = match outcome {
            Ok(page) => {
                let stored = entry.as_ref().map(|(store, digest)| (*store, digest));
                self.respond_rendered(request, page, stored, &tags, &tag_key).await
            }
            Err(err) => {
                tracing::warn!(url = %url, status = err.status().as_u16(), error = %err, "render failed");
                RenderResponse::from_error(&err)
            }
        };

        tags.clear(&tag_key);

        if matches!(response.status, 404 | 500) {
            self.alert(url.as_str(), response.status);
        }

        response
    }

    async fn respond_rendered(
        &self, request: &RenderRequest, page: RenderedPage, store: Option<(&SnapshotStore, &Digest)>,
        tags: &TagRegistry, tag_key: &TagKey,
    ) -> RenderResponse {
        let mut headers = self.response_headers.clone();
        headers.insert(RENDERER_HEADER.to_string(), RENDERER_NAME.to_string());
        for (name, value) in page.headers {
            headers.insert(name.to_ascii_lowercase(), value);
        }
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| HTML_CONTENT_TYPE.to_string());

        tracing::info!(
            url = %page.final_url,
            status = page.status,
            render_time_ms = page.render_time_ms,
            "page rendered"
        );

        let mut body = page.html;

        if page.status == 200
            && let Some((store, digest)) = store
        {
            let meta = RequestMeta {
                method: request.method.clone(),
                url: request.raw_path.clone(),
                header: request.headers.clone(),
            };
            let record = SnapshotRecord::new(page.status, headers.clone(), Payload::Text(body.clone()), meta);
            if let Err(e) = store.store(digest, &record).await {
                tracing::warn!(digest = %digest, error = %e, "failed to store snapshot");
            }

            let collected = tags.read_deduped(tag_key);
            tracing::debug!(tag_key = %tag_key, tags = %collected, "tags collected");

            if request.refresh_cache {
                body = serde_json::json!({ "html": body, "tags": format!(" {collected} ") }).to_string();
                headers.insert("content-type".to_string(), JSON_CONTENT_TYPE.to_string());
            }
        }

        RenderResponse { status: page.status, headers, body: ResponseBody::Text(body) }
    }

    /// Fire-and-forget failure ping.
    fn alert(&self, url: &str, status: u16) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };

        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_failure(&url, status).await {
                tracing::warn!(url = %url, status, error = %e, "failure alert not delivered");
            }
        });
    }

    /// Capture a JPEG screenshot; `viewport` defaults to the configured size.
    pub async fn screenshot(
        &self, url: &str, mobile: bool, timezone_id: Option<String>, viewport: Option<(u32, u32)>,
    ) -> Result<Bytes, ServerError> {
        if self.guard.is_restricted_target(url) {
            return Err(ServerError::RestrictedUrl(url.to_string()));
        }
        let parsed = Url::parse(url).map_err(|_| ServerError::RestrictedUrl(url.to_string()))?;

        let default_viewport = if mobile { self.viewport_mobile } else { self.viewport };
        let opts = ScreenshotOptions {
            is_mobile: mobile,
            timezone_id,
            timeout: self.timeout,
            viewport: viewport.unwrap_or(default_viewport),
        };

        let capture = self.renderer.screenshot(&parsed, &opts);
        match tokio::time::timeout(self.timeout + RENDERER_GRACE, capture).await {
            Ok(result) => result.map_err(|e| ServerError::from(e).for_screenshot()),
            Err(_) => Err(ServerError::RenderTimeout(self.timeout.as_millis() as u64).for_screenshot()),
        }
    }

    /// Remove the entry addressed by an `/invalidate/...` path.
    pub async fn invalidate(&self, raw_path: &str) -> Result<(), ServerError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let key = invalidation_key(raw_path);
        let digest = digest(&key);
        store.invalidate(&digest).await?;
        tracing::info!(key = %key, digest = %digest, "cache entry invalidated");
        Ok(())
    }

    /// Remove every entry; returns how many were deleted.
    pub async fn invalidate_all(&self) -> Result<usize, ServerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let removed = store.invalidate_all().await?;
        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }
}

/// IMF-fixdate as used in HTTP headers.
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
