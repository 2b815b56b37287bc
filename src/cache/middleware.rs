//! HTTP response cache middleware.
//!
//! [`response_cache_layer`] memoizes GET responses through the
//! [`CacheService`]; [`clear_cache_layer`] drops matching entries after a
//! successful mutation. Both attach diagnostic headers.

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody as _},
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri,
        header::{self, CACHE_CONTROL, PRAGMA},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::entry::Ttl;
use super::keys::{CacheKey, CallerIdentity};
use super::pattern::escape_glob;
use super::service::CacheService;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_CACHE_KEY: HeaderName = HeaderName::from_static("x-cache-key");
pub const X_CACHE_CLEARED: HeaderName = HeaderName::from_static("x-cache-cleared");
pub const X_CACHE_CLEARED_COUNT: HeaderName = HeaderName::from_static("x-cache-cleared-count");

/// Decides whether a GET request may be served from or stored in the cache.
pub type CacheCondition = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// How a request maps to a cache key.
#[derive(Debug, Clone)]
pub enum KeyStrategy {
    /// Method, path and caller. The query string is ignored.
    Route,
    /// Resource name, path, canonical query and caller.
    Resource(Arc<str>),
}

#[derive(Clone)]
pub struct ResponseCacheState {
    cache: Arc<CacheService>,
    strategy: KeyStrategy,
    ttl: Ttl,
    condition: CacheCondition,
}

/// Cache responses of one named resource.
pub fn resource_cache(
    cache: Arc<CacheService>,
    name: &str,
    ttl: impl Into<Ttl>,
) -> ResponseCacheState {
    ResponseCacheState::new(cache, KeyStrategy::Resource(Arc::from(name)), ttl.into())
}

/// Cache responses keyed by route alone.
pub fn route_cache(cache: Arc<CacheService>, ttl: impl Into<Ttl>) -> ResponseCacheState {
    ResponseCacheState::new(cache, KeyStrategy::Route, ttl.into())
}

impl ResponseCacheState {
    pub fn new(cache: Arc<CacheService>, strategy: KeyStrategy, ttl: Ttl) -> Self {
        Self {
            cache,
            strategy,
            ttl,
            condition: Arc::new(default_condition),
        }
    }

    /// Replace the default condition.
    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    pub fn key_for(&self, request: &Request<Body>) -> String {
        let identity = request
            .extensions()
            .get::<CallerIdentity>()
            .cloned()
            .unwrap_or_default();
        let uri = request.uri();

        let key = match &self.strategy {
            KeyStrategy::Route => CacheKey::new(self.cache.namespace())
                .part("route")
                .part(request.method().as_str())
                .part(uri.path()),
            KeyStrategy::Resource(name) => CacheKey::new(self.cache.namespace())
                .part(name.as_ref())
                .part(uri.path())
                .query(uri.query().unwrap_or("")),
        };
        key.identity(&identity).build()
    }
}

/// Skip when the client asks for a fresh copy or for an event stream.
pub fn default_condition(request: &Request<Body>) -> bool {
    let headers = request.headers();
    if header_has_token(headers, &CACHE_CONTROL, &["no-cache", "no-store"])
        || header_has_token(headers, &PRAGMA, &["no-cache"])
    {
        return false;
    }
    !headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"))
}

fn header_has_token(headers: &HeaderMap, name: &HeaderName, tokens: &[&str]) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| tokens.contains(&directive.as_str()))
}

pub async fn response_cache_layer(
    State(state): State<ResponseCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.cache.is_enabled() || request.method() != Method::GET {
        return next.run(request).await;
    }
    if !(state.condition)(&request) {
        debug!(
            target = "gazette::cache::http",
            path = %request.uri().path(),
            "cache bypassed by condition"
        );
        return next.run(request).await;
    }

    let key = state.key_for(&request);

    if let Some(cached) = state.cache.get::<CachedResponse>(&key).await {
        match cached.into_response() {
            Some(mut response) => {
                mark(&mut response, "HIT", &key);
                return response;
            }
            None => warn!(
                target = "gazette::cache::http",
                key = %key,
                "cached response unusable; re-running handler"
            ),
        }
    }

    let response = next.run(request).await;
    let mut response = if should_store_response(&response) {
        let sink = ResponseSink::new(state.cache.config().response_body_limit_bytes);
        match sink.capture(response).await {
            Captured::Buffered { response, cached } => {
                let cache = Arc::clone(&state.cache);
                let ttl = state.ttl;
                let key = key.clone();
                tokio::spawn(async move {
                    cache.set(&key, &cached, ttl).await;
                });
                response
            }
            Captured::Passthrough(response) => response,
        }
    } else {
        response
    };

    mark(&mut response, "MISS", &key);
    response
}

fn mark(response: &mut Response, outcome: &'static str, key: &str) {
    let headers = response.headers_mut();
    headers.insert(X_CACHE, HeaderValue::from_static(outcome));
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(X_CACHE_KEY, value);
    }
}

/// 2xx, no cookies, not a stream.
pub fn should_store_response(response: &Response) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::SET_COOKIE) {
        return false;
    }

    !response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// A response as persisted in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Base64 so binary bodies survive the JSON encoding.
    pub body: String,
}

impl CachedResponse {
    fn new(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| **name != X_CACHE && **name != X_CACHE_KEY)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Self {
            status: status.as_u16(),
            headers,
            body: STANDARD.encode(body),
        }
    }

    fn into_response(self) -> Option<Response> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let body = STANDARD.decode(self.body.as_bytes()).ok()?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        Some(response)
    }
}

enum Captured {
    Buffered {
        response: Response,
        cached: CachedResponse,
    },
    Passthrough(Response),
}

/// Buffers a response body so it can be both returned and persisted.
///
/// Bodies whose length is unknown up front or exceeds the limit pass
/// through untouched.
struct ResponseSink {
    limit: usize,
}

impl ResponseSink {
    fn new(limit: usize) -> Self {
        Self { limit }
    }

    async fn capture(&self, response: Response) -> Captured {
        let within_limit = response
            .body()
            .size_hint()
            .upper()
            .is_some_and(|upper| upper <= self.limit as u64);
        if !within_limit {
            debug!(
                target = "gazette::cache::http",
                limit = self.limit,
                "response body too large or unsized; not cached"
            );
            return Captured::Passthrough(response);
        }

        let (parts, body) = response.into_parts();
        match BodyExt::collect(body).await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                let cached = CachedResponse::new(parts.status, &parts.headers, &bytes);
                Captured::Buffered {
                    response: Response::from_parts(parts, Body::from(bytes)),
                    cached,
                }
            }
            Err(err) => {
                warn!(
                    target = "gazette::cache::http",
                    error = %err,
                    "failed to buffer response body"
                );
                Captured::Passthrough(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }
}

/// Which keys a mutation invalidates.
#[derive(Clone)]
pub enum ClearTarget {
    /// A fixed glob.
    Pattern(Arc<str>),
    /// Globs computed from the request; an empty list clears nothing.
    Derived(fn(&Method, &Uri) -> Vec<String>),
}

impl ClearTarget {
    fn resolve(&self, method: &Method, uri: &Uri) -> Vec<String> {
        match self {
            ClearTarget::Pattern(pattern) => vec![pattern.to_string()],
            ClearTarget::Derived(derive) => derive(method, uri),
        }
    }
}

#[derive(Clone)]
pub struct ClearCacheState {
    cache: Arc<CacheService>,
    target: ClearTarget,
}

pub fn clear_cache(cache: Arc<CacheService>, target: ClearTarget) -> ClearCacheState {
    ClearCacheState { cache, target }
}

/// Globs covering every cached read of `/api/{collection}`: the listing with
/// or without a query, and anything below it. Keys end in `@{caller}`, so a
/// collection whose name extends another (`news`, `newsletters`) is not hit.
/// The query separator is escaped; a bare `?` would match any character.
pub fn collection_patterns(_method: &Method, uri: &Uri) -> Vec<String> {
    let mut segments = uri.path().split('/').filter(|segment| !segment.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "api" {
            let Some(collection) = segments.next() else {
                break;
            };
            let collection = escape_glob(collection);
            return vec![
                format!("*/api/{collection}@*"),
                format!("*/api/{collection}/*"),
                format!("*/api/{collection}\\?*"),
            ];
        }
    }
    Vec::new()
}

fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

pub async fn clear_cache_layer(
    State(state): State<ClearCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_mutation(request.method()) {
        return next.run(request).await;
    }

    let patterns = state.target.resolve(request.method(), request.uri());
    let mut response = next.run(request).await;
    if !response.status().is_success() || patterns.is_empty() {
        return response;
    }

    let mut removed = 0;
    for pattern in &patterns {
        removed += state.cache.delete_by_pattern(pattern).await;
    }
    let cleared = patterns.join(",");
    debug!(
        target = "gazette::cache::http",
        patterns = %cleared,
        removed,
        "cleared cache after mutation"
    );

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&cleared) {
        headers.insert(X_CACHE_CLEARED, value);
    }
    headers.insert(X_CACHE_CLEARED_COUNT, HeaderValue::from(removed));
    response
}
