//! Client code for prerender.
//!
//! This crate provides the headless renderer, URL restrictions, and failure
//! alerting used by the server.

pub mod alert;
pub mod guard;
pub mod render;

pub use alert::{AlertError, FailureNotifier, HealthCheckNotifier};
pub use guard::{GuardError, UrlGuard};
pub use render::{RenderError, RenderOptions, RenderedPage, Renderer, ScreenshotOptions};

#[cfg(feature = "render")]
pub use render::{HeadlessConfig, HeadlessRenderer};
