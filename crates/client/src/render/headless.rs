//! Headless Chrome/Chromium renderer using chromiumoxide.
//!
//! Each render opens a fresh page on a shared browser. Page requests are
//! intercepted so the [`UrlGuard`] can abort restricted or mutating ones, and
//! GET responses are inspected for invalidation tag headers.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, EventRequestWillBeSent, EventResponseReceived, Headers, ResourceType, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use futures_util::StreamExt;
use prerender_core::{AppConfig, TagKey, TagRegistry};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use url::Url;

use super::directives::{read_directives, resolve_status};
use super::{RenderError, RenderOptions, RenderedPage, Renderer, ScreenshotOptions};
use crate::guard::UrlGuard;

const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 8.0.0; Pixel 2 XL Build/OPD1.170816.004) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/68.0.3440.75 Mobile Safari/537.36";

/// Interval between readiness checks.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Removes stripped elements and pins relative resources to the page origin.
const SERIALIZE_SCRIPT: &str = r#"(() => {
  const strip = __STRIP__;
  if (strip) {
    for (const el of Array.from(document.querySelectorAll(strip))) el.remove();
  }
  const origin = __ORIGIN__;
  const directory = __DIRECTORY__;
  const bases = document.head.querySelectorAll('base');
  if (bases.length) {
    const existing = bases[0].getAttribute('href') || '';
    if (existing.startsWith('/')) {
      bases[0].setAttribute('href', existing === '/' ? origin : origin + existing);
    }
  } else {
    const base = document.createElement('base');
    base.setAttribute('href', origin + directory);
    document.head.insertAdjacentElement('afterbegin', base);
  }
  return true;
})()"#;

/// Browser and page settings for the headless renderer.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub browser_args: Vec<String>,
    pub viewport: (u32, u32),
    pub viewport_mobile: (u32, u32),
    pub set_user_agent_mobile: bool,
    pub request_headers: BTreeMap<String, String>,
    pub strip_selectors: String,
    pub ready_selectors: String,
    pub pending_selector: String,
    pub not_found_selector: String,
    pub tag_headers: Vec<String>,
}

impl From<&AppConfig> for HeadlessConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            browser_args: config.browser_args.clone(),
            viewport: (config.width, config.height),
            viewport_mobile: (config.width_mobile, config.height_mobile),
            set_user_agent_mobile: config.set_user_agent_mobile,
            request_headers: config.request_headers.clone(),
            strip_selectors: config.strip_selectors.clone(),
            ready_selectors: config.ready_selectors.clone(),
            pending_selector: config.pending_selector.clone(),
            not_found_selector: config.not_found_selector.clone(),
            tag_headers: config.tag_headers.clone(),
        }
    }
}

/// Status and headers of the main document response.
#[derive(Debug, Clone)]
struct MainResponse {
    status: u16,
    headers: serde_json::Value,
}

type MainSlot = Arc<Mutex<Option<MainResponse>>>;

/// Interception task for one page, aborted when dropped.
struct ListenerTask(JoinHandle<()>);

impl Drop for ListenerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A page that is closed even when the render using it is abandoned.
struct OpenPage {
    page: Page,
    closed: bool,
}

impl OpenPage {
    fn new(page: Page) -> Self {
        Self { page, closed: false }
    }

    async fn close(mut self, url: &Url) {
        self.closed = true;
        if let Err(e) = self.page.clone().close().await {
            tracing::debug!(url = %url, error = %e, "failed to close page");
        }
    }
}

impl Drop for OpenPage {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let page = self.page.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = page.close().await {
                    tracing::debug!(error = %e, "failed to close abandoned page");
                }
            });
        }
    }
}

/// A launched browser plus the task driving its CDP connection.
struct Session {
    browser: Arc<Browser>,
    alive: Arc<AtomicBool>,
    _handler: JoinHandle<()>,
}

/// Headless Chrome/Chromium renderer using chromiumoxide.
pub struct HeadlessRenderer {
    config: HeadlessConfig,
    guard: UrlGuard,
    session: RwLock<Session>,
}

impl HeadlessRenderer {
    /// Create a new headless renderer by launching a browser instance.
    ///
    /// The browser runs in headless mode and uses a background task
    /// to handle Chrome DevTools Protocol events.
    pub async fn new(config: HeadlessConfig, guard: UrlGuard) -> Result<Self, RenderError> {
        let session = launch(&config).await?;
        Ok(Self { config, guard, session: RwLock::new(session) })
    }

    /// Current browser and its liveness flag, relaunching it if the previous one disconnected.
    async fn browser(&self) -> Result<(Arc<Browser>, Arc<AtomicBool>), RenderError> {
        {
            let session = self.session.read().await;
            if session.alive.load(Ordering::Acquire) {
                return Ok((Arc::clone(&session.browser), Arc::clone(&session.alive)));
            }
        }

        let mut session = self.session.write().await;
        if !session.alive.load(Ordering::Acquire) {
            tracing::warn!("browser disconnected, launching a new one");
            *session = launch(&self.config).await?;
        }
        Ok((Arc::clone(&session.browser), Arc::clone(&session.alive)))
    }

    async fn open_page(&self) -> Result<Page, RenderError> {
        let (browser, alive) = self.browser().await?;
        browser.new_page("about:blank").await.map_err(|e| {
            if alive.load(Ordering::Acquire) {
                RenderError::Navigation(e.to_string())
            } else {
                RenderError::BrowserClosed
            }
        })
    }

    /// Viewport, user agent, timezone and extra request headers.
    async fn prepare_page(
        &self, page: &Page, viewport: (u32, u32), is_mobile: bool, timezone_id: Option<&str>,
    ) -> Result<(), RenderError> {
        page.execute(SetDeviceMetricsOverrideParams::new(
            i64::from(viewport.0),
            i64::from(viewport.1),
            1.0,
            is_mobile,
        ))
        .await
        .map_err(|e| RenderError::Navigation(e.to_string()))?;

        if is_mobile && self.config.set_user_agent_mobile {
            page.execute(SetUserAgentOverrideParams::new(MOBILE_USER_AGENT))
                .await
                .map_err(|e| RenderError::Navigation(e.to_string()))?;
        }

        if let Some(timezone_id) = timezone_id {
            page.execute(SetTimezoneOverrideParams::new(timezone_id))
                .await
                .map_err(|_| RenderError::InvalidTimezone(timezone_id.to_string()))?;
        }

        if !self.config.request_headers.is_empty() {
            let headers = serde_json::to_value(&self.config.request_headers)
                .map_err(|e| RenderError::Navigation(e.to_string()))?;
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                .await
                .map_err(|e| RenderError::Navigation(e.to_string()))?;
        }

        Ok(())
    }

    /// Start request interception and response inspection for `page`.
    ///
    /// The returned task ends when the page closes or the handle is dropped.
    async fn spawn_listeners(
        &self, page: &Page, tag_key: TagKey, tags: TagRegistry, main: MainSlot,
    ) -> Result<ListenerTask, RenderError> {
        let nav = |e: chromiumoxide::error::CdpError| RenderError::Navigation(e.to_string());

        let mut paused = page.event_listener::<EventRequestPaused>().await.map_err(nav)?;
        let mut sent = page.event_listener::<EventRequestWillBeSent>().await.map_err(nav)?;
        let mut received = page.event_listener::<EventResponseReceived>().await.map_err(nav)?;

        page.execute(
            EnableParams::builder()
                .pattern(
                    RequestPattern::builder()
                        .url_pattern("*")
                        .request_stage(RequestStage::Request)
                        .build(),
                )
                .build(),
        )
        .await
        .map_err(nav)?;

        let page = page.clone();
        let guard = self.guard.clone();
        let tag_headers = self.config.tag_headers.clone();

        Ok(ListenerTask(tokio::spawn(async move {
            let mut get_requests: HashSet<String> = HashSet::new();

            loop {
                tokio::select! {
                    biased;
                    Some(event) = paused.next() => {
                        let request = &event.request;
                        if guard.allow_subrequest(&request.method, &request.url, request.post_data.as_deref()) {
                            if let Err(e) = page.execute(ContinueRequestParams::new(event.request_id.clone())).await {
                                tracing::debug!(url = %request.url, error = %e, "failed to continue request");
                            }
                        } else {
                            tracing::debug!(url = %request.url, method = %request.method, "aborting page request");
                            let fail = FailRequestParams::new(event.request_id.clone(), ErrorReason::BlockedByClient);
                            if let Err(e) = page.execute(fail).await {
                                tracing::debug!(url = %request.url, error = %e, "failed to abort request");
                            }
                        }
                    }
                    Some(event) = sent.next() => {
                        if event.request.method.eq_ignore_ascii_case("GET") {
                            get_requests.insert(event.request_id.inner().clone());
                        }
                    }
                    Some(event) = received.next() => {
                        let response = &event.response;

                        if event.r#type == ResourceType::Document {
                            let mut slot = main.lock().unwrap_or_else(PoisonError::into_inner);
                            if slot.is_none() {
                                *slot = Some(MainResponse {
                                    status: u16::try_from(response.status).unwrap_or(0),
                                    headers: response.headers.inner().clone(),
                                });
                            }
                        }

                        if get_requests.remove(event.request_id.inner()) {
                            tags.open(&tag_key);
                            for name in &tag_headers {
                                if let Some(value) = header_value(response.headers.inner(), name)
                                    && !value.trim().is_empty()
                                {
                                    tracing::debug!(tag_key = %tag_key, header = %name, "collected invalidation tags");
                                    tags.accumulate(&tag_key, value);
                                }
                            }
                        }
                    }
                    else => break,
                }
            }
        })))
    }

    /// Wait until a ready selector matches and nothing is pending.
    ///
    /// Evaluation errors (e.g. a context destroyed by a client-side redirect)
    /// count as not ready; the render deadline bounds the wait.
    async fn wait_until_ready(&self, page: &Page) {
        let ready = js_string(&self.config.ready_selectors);
        let pending = js_string(&self.config.pending_selector);
        let probe = format!(
            "(() => {{ const ready = {ready}; const pending = {pending}; \
             return (!ready || document.querySelectorAll(ready).length > 0) \
             && (!pending || document.querySelectorAll(pending).length === 0); }})()"
        );

        loop {
            let done = match page.evaluate(probe.as_str()).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(e) => {
                    tracing::debug!(error = %e, "readiness check failed, retrying");
                    false
                }
            };
            if done {
                return;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn render_page(
        &self, page: &Page, url: &Url, opts: &RenderOptions, tags: &TagRegistry,
    ) -> Result<RenderedPage, RenderError> {
        let start = Instant::now();
        let viewport = if opts.is_mobile { self.config.viewport_mobile } else { self.config.viewport };
        self.prepare_page(page, viewport, opts.is_mobile, opts.timezone_id.as_deref())
            .await?;

        let main: MainSlot = Arc::new(Mutex::new(None));
        let tag_key = TagKey::new(url.as_str(), opts.is_mobile);
        let listeners = self
            .spawn_listeners(page, tag_key, tags.clone(), Arc::clone(&main))
            .await?;

        let result = self.navigate_and_serialize(page, url, &main).await;
        drop(listeners);

        let (origin_status, html) = result?;

        let directives = read_directives(&html, &self.config.not_found_selector);
        if directives.not_found {
            return Err(RenderError::NotFoundView);
        }

        let status = resolve_status(origin_status, directives.status_code);
        let headers: BTreeMap<String, String> = directives.header.into_iter().collect();

        let page_url = page
            .url()
            .await
            .map_err(|e| RenderError::ContentRetrieval(e.to_string()))?;
        let final_url = page_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .unwrap_or_else(|| url.clone());

        let render_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(url = %url, status, render_time_ms, "page rendered");

        Ok(RenderedPage { status, headers, html, final_url, render_time_ms })
    }

    async fn navigate_and_serialize(
        &self, page: &Page, url: &Url, main: &MainSlot,
    ) -> Result<(u16, String), RenderError> {
        page.goto(url.as_str())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        self.wait_until_ready(page).await;

        let origin = check_main_response(main)?;

        let script = SERIALIZE_SCRIPT
            .replace("__STRIP__", &js_string(&self.config.strip_selectors))
            .replace("__ORIGIN__", &js_string(&url.origin().ascii_serialization()))
            .replace("__DIRECTORY__", &js_string(&base_directory(url)));
        page.evaluate(script.as_str())
            .await
            .map_err(|e| RenderError::ContentRetrieval(e.to_string()))?;

        let html = page
            .content()
            .await
            .map_err(|e| RenderError::ContentRetrieval(e.to_string()))?;

        Ok((origin, html))
    }

    async fn capture(&self, page: &Page, url: &Url, opts: &ScreenshotOptions) -> Result<Bytes, RenderError> {
        self.prepare_page(page, opts.viewport, opts.is_mobile, opts.timezone_id.as_deref())
            .await?;

        let main: MainSlot = Arc::new(Mutex::new(None));
        let listeners = self
            .spawn_listeners(page, TagKey::new(url.as_str(), opts.is_mobile), TagRegistry::new(), Arc::clone(&main))
            .await?;

        let result = async {
            page.goto(url.as_str())
                .await
                .map_err(|e| RenderError::Navigation(e.to_string()))?;
            check_main_response(&main)?;
            page.screenshot(ScreenshotParams::builder().format(CaptureScreenshotFormat::Jpeg).build())
                .await
                .map_err(|e| RenderError::ContentRetrieval(e.to_string()))
        }
        .await;
        drop(listeners);

        result.map(Bytes::from)
    }
}

#[async_trait::async_trait]
impl Renderer for HeadlessRenderer {
    async fn render(&self, url: &Url, opts: &RenderOptions, tags: &TagRegistry) -> Result<RenderedPage, RenderError> {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        let timed_out = || RenderError::Timeout(opts.timeout.as_millis() as u64);

        let page = OpenPage::new(tokio::time::timeout_at(deadline, self.open_page()).await.map_err(|_| timed_out())??);

        let result = tokio::time::timeout_at(deadline, self.render_page(&page.page, url, opts, tags)).await;
        page.close(url).await;

        result.unwrap_or_else(|_| Err(timed_out()))
    }

    async fn screenshot(&self, url: &Url, opts: &ScreenshotOptions) -> Result<Bytes, RenderError> {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        let timed_out = || RenderError::Timeout(opts.timeout.as_millis() as u64);

        let page = OpenPage::new(tokio::time::timeout_at(deadline, self.open_page()).await.map_err(|_| timed_out())??);

        let result = tokio::time::timeout_at(deadline, self.capture(&page.page, url, opts)).await;
        page.close(url).await;

        result.unwrap_or_else(|_| Err(timed_out()))
    }
}

async fn launch(config: &HeadlessConfig) -> Result<Session, RenderError> {
    let (browser, mut handler) = Browser::launch(
        BrowserConfig::builder()
            .args(config.browser_args.clone())
            .window_size(config.viewport.0, config.viewport.1)
            .build()
            .map_err(RenderError::BrowserLaunch)?,
    )
    .await
    .map_err(|e| RenderError::BrowserLaunch(e.to_string()))?;

    let alive = Arc::new(AtomicBool::new(true));
    let handler_alive = Arc::clone(&alive);
    let handler = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                tracing::debug!("browser handler event error: {e}");
            }
        }
        handler_alive.store(false, Ordering::Release);
        tracing::warn!("browser connection closed");
    });

    tracing::info!("headless browser launched");
    Ok(Session { browser: Arc::new(browser), alive, _handler: handler })
}

/// Status of the main document, refusing pages that expose compute metadata.
fn check_main_response(main: &MainSlot) -> Result<u16, RenderError> {
    let slot = main.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(response) = slot.as_ref() else {
        return Err(RenderError::EmptyResponse);
    };

    if header_value(&response.headers, "metadata-flavor") == Some("Google") {
        return Err(RenderError::Forbidden);
    }

    Ok(response.status)
}

/// Case-insensitive header lookup in a CDP header object.
fn header_value<'a>(headers: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    headers
        .as_object()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
}

/// JSON string literal usable as a JavaScript expression.
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Directory part of the URL path, as used for an injected `<base href>`.
fn base_directory(url: &Url) -> String {
    let path = url.path().trim_end_matches('/');
    match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    }
}
