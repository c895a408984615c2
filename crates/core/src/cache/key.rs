//! Cache key normalization.
//!
//! Every request is cached by its full path and query, so requests with
//! different parameters are stored separately. The only parts dropped are the
//! `refreshCache` flag, the route prefix the request arrived on and trailing
//! `?` / `/` noise.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Route prefixes removed from the front of a key. At most one is stripped per pass.
pub const ROUTE_PREFIXES: &[&str] = &["/seo-snap/", "/render/"];

/// Prefix of the single-key invalidation route.
pub const INVALIDATE_PREFIX: &str = "/invalidate/";

static REFRESH_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&?refreshCache=(?:true|false)&?").expect("refreshCache pattern is a valid regex")
});

/// Canonical form of a request path used for lookup, storage and invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a raw request path (with query) into a cache key.
///
/// Steps:
/// 1. Drop the first `refreshCache=true|false` parameter
/// 2. Drop one trailing `?`
/// 3. Drop one route prefix (`/seo-snap/` or `/render/`)
/// 4. Drop one trailing `/`
///
/// The steps are repeated until the value is stable, which makes the
/// function idempotent even for inputs such as `/render//render/x//`.
pub fn sanitize(raw: &str) -> CacheKey {
    let mut current = raw.to_string();
    loop {
        let next = sanitize_once(&current);
        if next == current {
            return CacheKey(current);
        }
        current = next;
    }
}

/// Key addressed by an `/invalidate/<url>` request.
pub fn invalidation_key(raw: &str) -> CacheKey {
    let key = sanitize(raw);
    match key.as_str().strip_prefix(INVALIDATE_PREFIX) {
        Some(rest) => sanitize(rest),
        None => key,
    }
}

fn sanitize_once(raw: &str) -> String {
    let mut key = strip_refresh_flag(raw);

    if key.ends_with('?') {
        key.pop();
    }

    if let Some(rest) = ROUTE_PREFIXES.iter().find_map(|prefix| key.strip_prefix(prefix)) {
        key = rest.to_string();
    }

    if key.ends_with('/') {
        key.pop();
    }

    key
}

fn strip_refresh_flag(raw: &str) -> String {
    let Some(found) = REFRESH_FLAG.find(raw) else {
        return raw.to_string();
    };
    let matched = found.as_str();
    // keep the separator when the flag sat between two other parameters
    let replacement = if matched.len() > 1 && matched.starts_with('&') && matched.ends_with('&') { "&" } else { "" };
    format!("{}{}{}", &raw[..found.start()], replacement, &raw[found.end()..])
}
