//! HTTP routes.
//!
//! The target URL is taken from the path after the route prefix. Query
//! parameters that steer rendering are consumed here; any other parameters
//! belong to the target page and are appended back onto it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::error::ServerError;
use crate::orchestrator::{CacheOrchestrator, RenderRequest, RenderResponse, ResponseBody};

/// Query parameters interpreted by the server rather than the target page.
const CONTROL_PARAMS: &[&str] = &["mobile", "timezoneId", "refreshCache", "width", "height"];

type AppState = Arc<CacheOrchestrator>;

pub fn build_router(orchestrator: AppState) -> Router {
    Router::new()
        .route("/render/{*url}", get(render_page))
        .route("/seo-snap/{*url}", get(render_page))
        .route("/screenshot/{*url}", get(screenshot).post(screenshot))
        .route("/invalidate/", get(invalidate_all))
        .route("/invalidate/{*url}", get(invalidate))
        .route("/_ah/health", get(health))
        .with_state(orchestrator)
}

async fn render_page(
    State(orchestrator): State<AppState>, OriginalUri(uri): OriginalUri, method: Method, Path(url): Path<String>,
    Query(params): Query<HashMap<String, String>>, headers: HeaderMap,
) -> Response {
    let request = RenderRequest {
        raw_path: uri.path_and_query().map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string()),
        url: target_url(&url, uri.query()),
        mobile: params.contains_key("mobile"),
        timezone_id: timezone(&params),
        refresh_cache: params
            .get("refreshCache")
            .is_some_and(|value| value.eq_ignore_ascii_case("true")),
        method: method.to_string(),
        headers: header_map(&headers),
    };

    orchestrator.render(&request).await.into_response()
}

async fn screenshot(
    State(orchestrator): State<AppState>, OriginalUri(uri): OriginalUri, Path(url): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ServerError> {
    let dimension = |name: &str| params.get(name).and_then(|value| value.parse::<u32>().ok());
    let viewport = dimension("width").zip(dimension("height"));

    let image = orchestrator
        .screenshot(&target_url(&url, uri.query()), params.contains_key("mobile"), timezone(&params), viewport)
        .await?;

    Ok(([(CONTENT_TYPE, "image/jpeg")], image).into_response())
}

async fn invalidate(
    State(orchestrator): State<AppState>, OriginalUri(uri): OriginalUri,
) -> Result<&'static str, ServerError> {
    let raw_path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    orchestrator.invalidate(raw_path).await?;
    Ok("Invalidated")
}

async fn invalidate_all(State(orchestrator): State<AppState>) -> Result<String, ServerError> {
    let removed = orchestrator.invalidate_all().await?;
    Ok(format!("Cleared {removed} entries"))
}

async fn health() -> &'static str {
    "OK"
}

impl IntoResponse for RenderResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = match self.body {
            ResponseBody::Text(text) => (status, text).into_response(),
            ResponseBody::Binary(bytes) => (status, bytes).into_response(),
        };

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "dropping invalid response header"),
            }
        }

        response
    }
}

/// Rebuild the page URL with the query parameters meant for it.
fn target_url(path_url: &str, query: Option<&str>) -> String {
    let page_params: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|param| !param.is_empty())
        .filter(|param| {
            let name = param.split_once('=').map_or(*param, |(name, _)| name);
            !CONTROL_PARAMS.contains(&name)
        })
        .collect();

    if page_params.is_empty() { path_url.to_string() } else { format!("{path_url}?{}", page_params.join("&")) }
}

fn timezone(params: &HashMap<String, String>) -> Option<String> {
    params.get("timezoneId").filter(|tz| !tz.is_empty()).cloned()
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect()
}
