//! Middleware chain (C6): logging, authentication and rate-limiting, composed
//! as a single `from_fn_with_state` wrapper.
//!
//! The stages are deliberately *not* three stacked `tower` layers: the
//! authentication stage must populate `client_key` before the rate-limit
//! stage can read it, which is awkward to express across independently
//! stacked layers. Expressing the whole chain as one function lets logging
//! still wrap everything (it runs first and last) while authentication runs
//! before rate-limiting within that wrapper, matching the documented
//! outermost-to-innermost order of logging -> rate-limit -> authentication.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::bucket::{estimate_tokens, BucketKind};
use crate::context::{AppState, RequestContext};
use crate::error::ProxyError;

const BYPASS_PATHS: [&str; 5] = ["/health", "/metrics", "/docs", "/redoc", "/openapi.json"];

fn is_bypass(method: &Method, path: &str) -> bool {
    method == Method::OPTIONS || BYPASS_PATHS.contains(&path)
}

/// Headers as a plain sorted map, the way `structlog`'s `dict(request.headers)`
/// renders for the original service's request-start/request-end log lines.
fn headers_for_log(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("<non-utf8>").to_string()))
        .collect()
}

pub async fn chain(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let request_headers = headers_for_log(request.headers());

    let mut ctx = RequestContext::new();
    tracing::info!(
        request_id = %ctx.request_id,
        %method,
        url = %request.uri(),
        client_ip,
        headers = ?request_headers,
        "request started"
    );

    if !is_bypass(&method, &path) {
        if let Err(err) = authenticate(&state, &request, &mut ctx) {
            log_completion(&ctx, &method, &path, start, err.status_code().as_u16(), &HeaderMap::new());
            return err.into_response();
        }
        if let Err(err) = rate_limit(&state, &request, &ctx) {
            log_completion(&ctx, &method, &path, start, err.status_code().as_u16(), &HeaderMap::new());
            return err.into_response();
        }
    }

    request.extensions_mut().insert(ctx.clone());
    let response = next.run(request).await;
    let status = response.status().as_u16();
    log_completion(&ctx, &method, &path, start, status, response.headers());
    response
}

fn log_completion(ctx: &RequestContext, method: &Method, path: &str, start: Instant, status: u16, response_headers: &HeaderMap) {
    tracing::info!(
        request_id = %ctx.request_id,
        %method,
        path,
        status,
        duration_ms = start.elapsed().as_millis() as u64,
        response_headers = ?headers_for_log(response_headers),
        "request completed"
    );
}

fn authenticate(state: &AppState, request: &Request, ctx: &mut RequestContext) -> Result<(), ProxyError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(t) if !t.is_empty() => t,
        _ => {
            return Err(ProxyError::Authentication(
                "missing or invalid authorization header".to_string(),
            ))
        }
    };

    if !state.credentials.accepts(token) {
        return Err(ProxyError::Authentication("invalid API key".to_string()));
    }

    let upstream_key = state
        .credentials
        .resolve(token)
        .ok_or_else(|| ProxyError::Authentication("unable to resolve upstream credential".to_string()))?;

    ctx.client_key = Some(token.to_string());
    ctx.upstream_key = Some(upstream_key);
    Ok(())
}

fn rate_limit(state: &AppState, request: &Request, ctx: &RequestContext) -> Result<(), ProxyError> {
    let Some(client_key) = &ctx.client_key else {
        return Ok(());
    };

    let request_bucket = state.buckets.get_or_create(client_key, BucketKind::Requests);
    if !request_bucket.consume(1.0) {
        return Err(ProxyError::RateLimited("request rate limit exceeded".to_string()));
    }

    let content_length = request
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let estimated_tokens = estimate_tokens(content_length);

    let token_bucket = state.buckets.get_or_create(client_key, BucketKind::Tokens);
    if !token_bucket.consume(estimated_tokens as f64) {
        return Err(ProxyError::RateLimited("token rate limit exceeded".to_string()));
    }

    Ok(())
}
