//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (PRERENDER_*)
//! 2. TOML config file (if PRERENDER_CONFIG_FILE set)
//! 3. Built-in defaults

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Value of `cache_duration_minutes` / `cache_max_entries` meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Snapshot cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheBackend {
    /// Every request renders; nothing is stored.
    None,
    /// JSON file per digest with tag envelopes on forced refresh.
    FilesystemTags,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (PRERENDER_*)
/// 2. TOML config file (if PRERENDER_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Snapshot cache backend.
    ///
    /// Set via PRERENDER_CACHE environment variable.
    #[serde(default = "default_cache")]
    pub cache: CacheBackend,

    /// Directory holding one `<digest>.json` file per snapshot.
    ///
    /// Set via PRERENDER_SNAPSHOT_DIR environment variable.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Minutes a snapshot stays fresh, `-1` for never expiring.
    #[serde(default = "default_cache_duration_minutes")]
    pub cache_duration_minutes: i64,

    /// Maximum number of stored snapshots, `-1` for unlimited.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: i64,

    /// Health check key pinged when a render fails with 404 or 500.
    ///
    /// Set via PRERENDER_HEALTH_CHECK_KEY environment variable.
    #[serde(default)]
    pub health_check_key: Option<String>,

    /// Base URL of the health check service.
    #[serde(default = "default_health_check_url")]
    pub health_check_url: String,

    /// Render timeout in milliseconds.
    ///
    /// Set via PRERENDER_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_width_mobile")]
    pub width_mobile: u32,

    #[serde(default = "default_height_mobile")]
    pub height_mobile: u32,

    /// Send a mobile user agent when rendering the mobile viewport.
    #[serde(default = "default_true")]
    pub set_user_agent_mobile: bool,

    /// Extra headers the browser sends with every page request.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,

    /// Static headers added to every render response.
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,

    /// Command line arguments for the browser process.
    #[serde(default = "default_browser_args")]
    pub browser_args: Vec<String>,

    /// URL prefixes allowed as render targets. Empty allows every http(s) URL.
    #[serde(default)]
    pub render_only: Vec<String>,

    /// Regex matched against sub-resource URLs; matches are aborted.
    #[serde(default)]
    pub restricted_url_pattern: Option<String>,

    /// Elements removed from the page before serialization.
    #[serde(default = "default_strip_selectors")]
    pub strip_selectors: String,

    /// At least one element matching these selectors marks the page as ready.
    #[serde(default = "default_ready_selectors")]
    pub ready_selectors: String,

    /// Elements matching this selector mean the page is still loading.
    #[serde(default = "default_pending_selector")]
    pub pending_selector: String,

    /// A page containing this selector is a "not found" view and never cached.
    #[serde(default = "default_not_found_selector")]
    pub not_found_selector: String,

    /// Sub-resource response headers carrying invalidation tags.
    #[serde(default = "default_tag_headers")]
    pub tag_headers: Vec<String>,
}

fn default_cache() -> CacheBackend {
    CacheBackend::FilesystemTags
}

fn default_snapshot_dir() -> PathBuf {
    std::env::temp_dir().join("prerender")
}

fn default_cache_duration_minutes() -> i64 {
    60 * 24
}

fn default_cache_max_entries() -> i64 {
    100
}

fn default_health_check_url() -> String {
    "https://hc-ping.com".into()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    3000
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    1280
}

fn default_width_mobile() -> u32 {
    768
}

fn default_height_mobile() -> u32 {
    768
}

fn default_true() -> bool {
    true
}

fn default_browser_args() -> Vec<String> {
    vec!["--no-sandbox".into()]
}

fn default_strip_selectors() -> String {
    r#"script:not([type]), script[type*="javascript"], script[type="module"], link[rel=import]"#.into()
}

fn default_ready_selectors() -> String {
    concat!(
        r#"main > form, main > [class*="-bannerImage-"], main > [class*="main-page-"], "#,
        r#"main > [class*="-RootComponents-"], [class*="-breadcrumbs-"], main > [class*="-errorView-"], "#,
        r#"main > [class*="-layoutContainer-"], main > [class*="-productFullDetail-"] form, "#,
        r#"main > [class*="-ProductFullDetail-"], main > div > [class*="-components-base-grid-"], "#,
        r#"main > div > [class*="-contentBlocks-"], main > div > [class*="-summaryFinder-"], main > h1"#
    )
    .into()
}

fn default_pending_selector() -> String {
    r#"[class*="_pending-"]"#.into()
}

fn default_not_found_selector() -> String {
    r#"main > [class*="-errorView-"]"#.into()
}

fn default_tag_headers() -> Vec<String> {
    vec!["x-magento-tags".into(), "xkey".into()]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: default_cache(),
            snapshot_dir: default_snapshot_dir(),
            cache_duration_minutes: default_cache_duration_minutes(),
            cache_max_entries: default_cache_max_entries(),
            health_check_key: None,
            health_check_url: default_health_check_url(),
            timeout_ms: default_timeout_ms(),
            host: default_host(),
            port: default_port(),
            width: default_width(),
            height: default_height(),
            width_mobile: default_width_mobile(),
            height_mobile: default_height_mobile(),
            set_user_agent_mobile: true,
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            browser_args: default_browser_args(),
            render_only: Vec::new(),
            restricted_url_pattern: None,
            strip_selectors: default_strip_selectors(),
            ready_selectors: default_ready_selectors(),
            pending_selector: default_pending_selector(),
            not_found_selector: default_not_found_selector(),
            tag_headers: default_tag_headers(),
        }
    }
}

impl AppConfig {
    /// Render timeout as Duration for use with tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Socket address string the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether snapshots are persisted at all.
    pub fn cache_enabled(&self) -> bool {
        self.cache != CacheBackend::None
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `PRERENDER_`
    /// 2. TOML file from `PRERENDER_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("PRERENDER_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("PRERENDER_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Health check key, if failure alerting is configured.
    pub fn alert_key(&self) -> Option<&str> {
        self.health_check_key.as_deref().filter(|key| !key.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.cache, CacheBackend::FilesystemTags);
        assert_eq!(config.cache_duration_minutes, 1440);
        assert_eq!(config.cache_max_entries, 100);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.port, 3000);
        assert_eq!(config.width_mobile, 768);
        assert!(config.set_user_agent_mobile);
        assert!(config.health_check_key.is_none());
        assert!(config.render_only.is_empty());
        assert_eq!(config.tag_headers, vec!["x-magento-tags".to_string(), "xkey".to_string()]);
    }

    #[test]
    fn test_timeout_duration() {
        let config = AppConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_bind_addr() {
        let config = AppConfig { host: "127.0.0.1".into(), port: 8080, ..Default::default() };
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_alert_key_blank_is_disabled() {
        let config = AppConfig { health_check_key: Some("  ".into()), ..Default::default() };
        assert!(config.alert_key().is_none());

        let config = AppConfig { health_check_key: Some("abc".into()), ..Default::default() };
        assert_eq!(config.alert_key(), Some("abc"));
    }

    #[test]
    fn test_cache_backend_deserialize() {
        let backend: CacheBackend = serde_json::from_str("\"filesystem-tags\"").unwrap();
        assert_eq!(backend, CacheBackend::FilesystemTags);
        let backend: CacheBackend = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(backend, CacheBackend::None);
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(
                "cache_max_entries = -1\ncache_duration_minutes = 30\n[response_headers]\nx-robots = \"noindex\"\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(config.cache_max_entries, UNLIMITED);
        assert_eq!(config.cache_duration_minutes, 30);
        assert_eq!(config.response_headers.get("x-robots").map(String::as_str), Some("noindex"));
    }
}
