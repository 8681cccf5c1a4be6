//! Endpoint handlers (C7): admission -> cache lookup -> upstream call ->
//! cache store -> usage extraction, for each OpenAI-compatible endpoint.

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::body::Body;
use futures_util::StreamExt;
use serde_json::Value;

use crate::cache::should_cache;
use crate::context::{AppState, RequestContext};
use crate::error::{ProxyError, ProxyResult};
use crate::metrics::{extract_usage, CacheOp, CacheResult};
use crate::upstream::RetryPolicy;

fn retry_policy(state: &AppState) -> RetryPolicy {
    RetryPolicy {
        max_attempts: state.config.retry_max_attempts.max(1),
        backoff_factor: state.config.retry_backoff_factor,
    }
}

fn client_label(ctx: &RequestContext) -> String {
    ctx.client_key.clone().unwrap_or_else(|| "anonymous".to_string())
}

/// Shared non-streaming orchestration for chat/completions/embeddings/models:
/// cache lookup, upstream call on miss, cache store on eligible success,
/// usage extraction, and metric scope status.
async fn orchestrate(
    state: &AppState,
    ctx: &RequestContext,
    endpoint: &'static str,
    body: &Value,
    call_upstream: impl std::future::Future<Output = ProxyResult<crate::upstream::UpstreamResponse>>,
) -> ProxyResult<Json<Value>> {
    let client = client_label(ctx);
    let scope = state.metrics.enter_scope(endpoint, "POST", &client);

    let eligible = should_cache(endpoint, body);
    if eligible {
        if let Some(cached) = state.cache.get(endpoint, body).await {
            state.metrics.record_cache_op(CacheOp::Get, CacheResult::Hit);
            let parsed: Value = serde_json::from_slice(&cached).unwrap_or(Value::Null);
            let usage = extract_usage(&parsed);
            state.metrics.record_tokens(
                endpoint,
                &client,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
            );
            scope.set_status(200);
            return Ok(Json(parsed));
        }
        state.metrics.record_cache_op(CacheOp::Get, CacheResult::Miss);
    }

    let result = call_upstream.await;
    let response = match result {
        Ok(resp) => resp,
        Err(err) => {
            scope.set_status(err.status_code().as_u16());
            return Err(err);
        }
    };

    let usage = extract_usage(&response.body);
    state.metrics.record_tokens(
        endpoint,
        &client,
        usage.prompt_tokens,
        usage.completion_tokens,
        usage.total_tokens,
    );

    if eligible {
        let ttl = endpoint_ttl(state, endpoint);
        let bytes = serde_json::to_vec(&response.body).unwrap_or_default();
        let stored = state.cache.set(endpoint, body, &bytes, ttl).await;
        state.metrics.record_cache_op(
            CacheOp::Set,
            if stored { CacheResult::Success } else { CacheResult::Error },
        );
    }

    scope.set_status(response.status);
    Ok(Json(response.body))
}

fn endpoint_ttl(state: &AppState, endpoint: &str) -> u64 {
    match endpoint {
        "embeddings" => state.config.cache.embeddings_ttl,
        "models" => 300,
        _ => state.config.cache.default_ttl,
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Response {
    let is_streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let upstream_key = match ctx.upstream_key.clone() {
        Some(k) => k,
        None => return ProxyError::Internal("missing upstream credential in context".into()).into_response(),
    };

    if is_streaming {
        return stream_chat_completions(state, ctx, upstream_key, body).await;
    }

    let retry = retry_policy(&state);
    let body_ref = &body;
    let result = orchestrate(&state, &ctx, "chat_completions", body_ref, async {
        state.upstream.chat_completions(&upstream_key, body_ref, &retry).await
    })
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn stream_chat_completions(
    state: AppState,
    ctx: RequestContext,
    upstream_key: String,
    body: Value,
) -> Response {
    let client = client_label(&ctx);
    let scope = state.metrics.enter_scope("chat_completions", "POST", &client);

    match state.upstream.chat_completions_stream(&upstream_key, &body).await {
        Ok(stream) => {
            scope.set_status(200);
            // The scope must stay alive until the last frame is forwarded, so it
            // rides along inside the stream itself rather than being dropped here;
            // its own Drop impl still fires the duration/count observation once the
            // stream (and the scope bundled with it) is dropped.
            let scoped = stream.map(move |item| {
                let _keep_alive = &scope;
                item
            });
            let body = Body::from_stream(scoped);
            Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
                .body(body)
                .unwrap_or_else(|_| ProxyError::Internal("failed to build streaming response".into()).into_response())
        }
        Err(err) => {
            scope.set_status(err.status_code().as_u16());
            err.into_response()
        }
    }
}

pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Response {
    let upstream_key = match ctx.upstream_key.clone() {
        Some(k) => k,
        None => return ProxyError::Internal("missing upstream credential in context".into()).into_response(),
    };
    let retry = retry_policy(&state);
    let body_ref = &body;
    let result = orchestrate(&state, &ctx, "completions", body_ref, async {
        state.upstream.completions(&upstream_key, body_ref, &retry).await
    })
    .await;
    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<Value>,
) -> Response {
    let upstream_key = match ctx.upstream_key.clone() {
        Some(k) => k,
        None => return ProxyError::Internal("missing upstream credential in context".into()).into_response(),
    };
    let retry = retry_policy(&state);
    let body_ref = &body;
    let result = orchestrate(&state, &ctx, "embeddings", body_ref, async {
        state.upstream.embeddings(&upstream_key, body_ref, &retry).await
    })
    .await;
    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn models(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> Response {
    let upstream_key = match ctx.upstream_key.clone() {
        Some(k) => k,
        None => return ProxyError::Internal("missing upstream credential in context".into()).into_response(),
    };
    let client = client_label(&ctx);
    let scope = state.metrics.enter_scope("models", "GET", &client);
    let retry = retry_policy(&state);
    let empty_body = Value::Object(Default::default());

    let eligible = should_cache("models", &empty_body);
    if eligible {
        if let Some(cached) = state.cache.get("models", &empty_body).await {
            state.metrics.record_cache_op(CacheOp::Get, CacheResult::Hit);
            let parsed: Value = serde_json::from_slice(&cached).unwrap_or(Value::Null);
            scope.set_status(200);
            return Json(parsed).into_response();
        }
        state.metrics.record_cache_op(CacheOp::Get, CacheResult::Miss);
    }

    match state.upstream.models(&upstream_key, &retry).await {
        Ok(response) => {
            if eligible {
                let bytes = serde_json::to_vec(&response.body).unwrap_or_default();
                let stored = state.cache.set("models", &empty_body, &bytes, 300).await;
                state.metrics.record_cache_op(
                    CacheOp::Set,
                    if stored { CacheResult::Success } else { CacheResult::Error },
                );
            }
            scope.set_status(response.status);
            Json(response.body).into_response()
        }
        Err(err) => {
            scope.set_status(err.status_code().as_u16());
            err.into_response()
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    let redis_connected = if state.cache.is_enabled() {
        state.cache.ping().await
    } else {
        false
    };
    let status = if redis_connected || !state.cache.is_enabled() {
        // Cache being entirely disabled (never configured to be reachable)
        // is a degraded-but-intended mode, not a failed dependency check;
        // only a *lost* connection to a previously-working cache degrades health.
        "healthy"
    } else {
        "degraded"
    };
    let code = if status == "healthy" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(serde_json::json!({ "status": status, "redis_connected": redis_connected }))).into_response()
}

/// Exposes the process's metrics in Prometheus/OpenMetrics text format.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(err) => ProxyError::Internal(format!("failed to encode metrics: {err}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_ttl_uses_embeddings_specific_ttl() {
        let cfg = test_config();
        let state = test_state(cfg);
        assert_eq!(endpoint_ttl(&state, "embeddings"), 3600);
        assert_eq!(endpoint_ttl(&state, "models"), 300);
        assert_eq!(endpoint_ttl(&state, "chat_completions"), 300);
    }

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            environment: "development".into(),
            debug: false,
            log_level: "info".into(),
            openai_api_base: "https://api.openai.com/v1".into(),
            openai_api_key: "sk-default".into(),
            client_api_keys: String::new(),
            api_key_mapping: String::new(),
            rate_limit: crate::config::RateLimitConfig { requests_per_minute: 60, tokens_per_minute: 100_000 },
            cache: crate::config::CacheConfig {
                redis_url: "redis://localhost:6379".into(),
                embeddings_ttl: 3600,
                default_ttl: 300,
            },
            retry_max_attempts: 3,
            retry_backoff_factor: 2.0,
            bind_addr: "0.0.0.0:8000".into(),
        }
    }

    fn test_state(cfg: crate::config::Config) -> AppState {
        let (credentials, _) = crate::credentials::CredentialMap::from_config(&cfg);
        AppState {
            buckets: std::sync::Arc::new(crate::bucket::BucketRegistry::new(
                cfg.rate_limit.requests_per_minute,
                cfg.rate_limit.tokens_per_minute,
            )),
            cache: crate::cache::Cache::disabled(),
            metrics: std::sync::Arc::new(crate::metrics::Metrics::new()),
            upstream: crate::upstream::UpstreamClient::new(&cfg.openai_api_base),
            credentials: std::sync::Arc::new(credentials),
            config: std::sync::Arc::new(cfg),
        }
    }
}
