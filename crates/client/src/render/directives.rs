//! In-page render directives.
//!
//! Pages can steer the prerendered response with meta tags:
//!
//! - `<meta name="render:status_code" content="404">` replaces a 200 status
//! - `<meta name="render:header" content="Location: https://...">` adds one header
//!
//! A page containing the configured "not found" selector is never treated as
//! a successful render.

use scraper::{Html, Selector};

const STATUS_META: &str = r#"meta[name="render:status_code"]"#;
const HEADER_META: &str = r#"meta[name="render:header"]"#;

/// Directives found in a serialized page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageDirectives {
    pub status_code: Option<u16>,
    pub header: Option<(String, String)>,
    pub not_found: bool,
}

/// Extract render directives from serialized HTML.
///
/// An unparsable `not_found_selector` never matches.
pub fn read_directives(html: &str, not_found_selector: &str) -> PageDirectives {
    let document = Html::parse_document(html);

    let status_code = first_meta_content(&document, STATUS_META).and_then(|content| parse_status(&content));
    let header = first_meta_content(&document, HEADER_META).and_then(|content| parse_header(&content));

    let not_found = match Selector::parse(not_found_selector) {
        Ok(selector) => document.select(&selector).next().is_some(),
        Err(e) => {
            tracing::warn!(selector = not_found_selector, error = %e, "invalid not found selector");
            false
        }
    };

    PageDirectives { status_code, header, not_found }
}

/// Resolve the response status from the origin status and an in-page override.
///
/// - 304 from the origin is treated as 200 (browser cache revalidation)
/// - only a 200 may be replaced by the override
/// - any other origin status is final
pub fn resolve_status(origin: u16, directive: Option<u16>) -> u16 {
    let status = if origin == 304 { 200 } else { origin };
    match directive {
        Some(code) if status == 200 => code,
        _ => status,
    }
}

fn first_meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(str::to_string)
}

/// Leading digits of the content attribute, if they form a valid status.
fn parse_status(content: &str) -> Option<u16> {
    let digits: String = content.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse::<u16>().ok().filter(|code| (100..=599).contains(code))
}

/// `Key: value` split at the first colon, both sides trimmed.
fn parse_header(content: &str) -> Option<(String, String)> {
    let (name, value) = content.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
