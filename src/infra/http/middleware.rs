use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, cache::CallerIdentity};

const SUBJECT_DIGEST_LEN: usize = 16;

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Derive the caller identity used to partition cached responses.
///
/// A bearer token maps to a truncated SHA-256 digest so raw credentials never
/// appear in cache keys or headers. Token validation happens elsewhere.
pub async fn resolve_caller(mut request: Request<Body>, next: Next) -> Response {
    let identity = caller_identity(request.headers());
    request.extensions_mut().insert(identity);
    next.run(request).await
}

pub fn caller_identity(headers: &HeaderMap) -> CallerIdentity {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    match token {
        Some(token) => {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hex::encode(hasher.finalize());
            CallerIdentity::Authenticated(digest[..SUBJECT_DIGEST_LEN].to_string())
        }
        None => CallerIdentity::Anonymous,
    }
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let caller = request
        .extensions()
        .get::<CallerIdentity>()
        .map(CallerIdentity::scope)
        .unwrap_or_else(|| caller_identity(request.headers()).scope());

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "gazette::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                caller = caller,
                "request failed",
            );
        } else {
            warn!(
                target = "gazette::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                caller = caller,
                "client request error",
            );
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn missing_or_foreign_scheme_is_anonymous() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_identity(&headers), CallerIdentity::Anonymous);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(caller_identity(&headers), CallerIdentity::Anonymous);
    }

    #[test]
    fn bearer_tokens_map_to_stable_digests() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        let first = caller_identity(&headers);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer s3cret"));
        let second = caller_identity(&headers);

        assert_eq!(first, second);
        match first {
            CallerIdentity::Authenticated(subject) => {
                assert_eq!(subject.len(), SUBJECT_DIGEST_LEN);
                assert!(!subject.contains("s3cret"));
            }
            CallerIdentity::Anonymous => panic!("expected an authenticated caller"),
        }
    }
}
