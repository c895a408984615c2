//! Test doubles for the renderer and failure notifier.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use prerender_client::{AlertError, FailureNotifier, RenderError, RenderOptions, RenderedPage, Renderer, ScreenshotOptions};
use prerender_core::{AppConfig, TagKey, TagRegistry};
use tokio::sync::mpsc;
use url::Url;

pub const FAKE_HTML: &str = "<html><head></head><body>rendered</body></html>";
pub const FAKE_JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0];

pub fn test_config() -> AppConfig {
    AppConfig { timeout_ms: 200, ..AppConfig::default() }
}

pub enum Behavior {
    /// Succeed with `status`, reporting each entry of `tags` as one tag header.
    Render { status: u16, tags: Vec<&'static str> },
    /// Never finish.
    Hang,
    /// Open a page, wait out `opts.timeout`, close the page and report a timeout.
    SelfTimeout,
    NotFound,
    Forbidden,
}

pub struct FakeRenderer {
    behavior: Behavior,
    pub calls: AtomicUsize,
    pub page_closed: AtomicBool,
    last_render: Mutex<Option<(Url, RenderOptions)>>,
    last_viewport: Mutex<Option<(u32, u32)>>,
}

impl FakeRenderer {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            page_closed: AtomicBool::new(false),
            last_render: Mutex::new(None),
            last_viewport: Mutex::new(None),
        }
    }

    pub fn last_render(&self) -> Option<(Url, RenderOptions)> {
        self.last_render.lock().unwrap().clone()
    }

    pub fn last_viewport(&self) -> Option<(u32, u32)> {
        *self.last_viewport.lock().unwrap()
    }

    async fn time_out_page(&self, timeout: Duration) -> RenderError {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
        self.page_closed.store(true, Ordering::SeqCst);
        RenderError::Timeout(timeout.as_millis() as u64)
    }
}

#[async_trait::async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, url: &Url, opts: &RenderOptions, tags: &TagRegistry) -> Result<RenderedPage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_render.lock().unwrap() = Some((url.clone(), opts.clone()));

        match &self.behavior {
            Behavior::Render { status, tags: values } => {
                let key = TagKey::new(url.as_str(), opts.is_mobile);
                for value in values {
                    tags.open(&key);
                    tags.accumulate(&key, value);
                }

                let mut headers = BTreeMap::new();
                headers.insert("X-Page-Header".to_string(), "from-meta".to_string());

                Ok(RenderedPage {
                    status: *status,
                    headers,
                    html: FAKE_HTML.to_string(),
                    final_url: url.clone(),
                    render_time_ms: 1,
                })
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::SelfTimeout => Err(self.time_out_page(opts.timeout).await),
            Behavior::NotFound => Err(RenderError::NotFoundView),
            Behavior::Forbidden => Err(RenderError::Forbidden),
        }
    }

    async fn screenshot(&self, _url: &Url, opts: &ScreenshotOptions) -> Result<Bytes, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_viewport.lock().unwrap() = Some(opts.viewport);

        match &self.behavior {
            Behavior::Forbidden => Err(RenderError::Forbidden),
            Behavior::Hang => std::future::pending().await,
            Behavior::SelfTimeout => Err(self.time_out_page(opts.timeout).await),
            _ => Ok(Bytes::from_static(FAKE_JPEG)),
        }
    }
}

/// Forwards every alert to a channel.
pub struct RecordingNotifier {
    sender: mpsc::UnboundedSender<(String, u16)>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, u16)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, fail: false }, receiver)
    }

    /// Records the alert, then reports a delivery failure.
    pub fn failing() -> (Self, mpsc::UnboundedReceiver<(String, u16)>) {
        let (notifier, receiver) = Self::new();
        (Self { fail: true, ..notifier }, receiver)
    }
}

#[async_trait::async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn notify_failure(&self, url: &str, status: u16) -> Result<(), AlertError> {
        let _ = self.sender.send((url.to_string(), status));
        if self.fail { Err(AlertError::HttpError { status: 503 }) } else { Ok(()) }
    }
}
