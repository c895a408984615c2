//! URL restrictions for render targets and page sub-requests.
//!
//! ### Render targets
//! - Only `http` / `https` schemes
//! - Hosts under `.internal` are refused
//! - When `render_only` prefixes are configured, the URL must start with one
//!
//! ### Sub-requests issued by the page
//! - Hosts under `.internal` and URLs matching the restricted pattern are aborted
//! - POST requests are aborted unless their body addresses the `urlResolver` query

use regex::Regex;
use url::Url;

/// Schemes a render target may use.
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Host suffix reserved for cloud-internal names.
const INTERNAL_HOST_SUFFIX: &str = ".internal";

/// Marker a POST body must contain to be let through.
const ALLOWED_POST_MARKER: &str = "urlResolver";

/// Error type for guard construction failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("invalid restricted_url_pattern: {0}")]
    InvalidPattern(String),
}

/// Decides which URLs may be rendered and which page requests may proceed.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard {
    render_only: Vec<String>,
    restricted_pattern: Option<Regex>,
}

impl UrlGuard {
    /// Create a guard from the allowed target prefixes and an optional
    /// sub-request pattern.
    pub fn new(render_only: Vec<String>, restricted_pattern: Option<&str>) -> Result<Self, GuardError> {
        let restricted_pattern = restricted_pattern
            .filter(|pattern| !pattern.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| GuardError::InvalidPattern(e.to_string()))?;

        Ok(Self { render_only, restricted_pattern })
    }

    /// Whether `href` must not be rendered.
    pub fn is_restricted_target(&self, href: &str) -> bool {
        let Ok(parsed) = Url::parse(href) else {
            return true;
        };

        if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return true;
        }

        if is_internal_host(&parsed) {
            return true;
        }

        if self.render_only.is_empty() {
            return false;
        }

        !self.render_only.iter().any(|prefix| href.starts_with(prefix.as_str()))
    }

    /// Whether a request issued by the page must be aborted.
    pub fn is_restricted_subrequest(&self, request_url: &str) -> bool {
        if let Ok(parsed) = Url::parse(request_url)
            && is_internal_host(&parsed)
        {
            return true;
        }

        self.restricted_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(request_url))
    }

    /// Whether a page request may continue.
    ///
    /// Mutating POST requests (e.g. cart creation) are blocked; only POSTs
    /// resolving URLs are allowed.
    pub fn allow_subrequest(&self, method: &str, request_url: &str, post_data: Option<&str>) -> bool {
        if self.is_restricted_subrequest(request_url) {
            return false;
        }

        if method.eq_ignore_ascii_case("POST") {
            return post_data.is_some_and(|body| body.contains(ALLOWED_POST_MARKER));
        }

        true
    }
}

fn is_internal_host(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| host.to_ascii_lowercase().ends_with(INTERNAL_HOST_SUFFIX))
}
