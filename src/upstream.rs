//! Upstream client (C5): connection-pooled HTTP client with retry/backoff and
//! SSE streaming passthrough.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
}

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Backoff delay for a zero-indexed attempt: `backoff_factor ^ attempt` seconds.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    Duration::from_secs_f64(policy.backoff_factor.powi(attempt as i32))
}

/// Shared, connection-pooled client for talking to the upstream API.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    api_base: String,
}

/// Outcome of a non-streaming upstream call: either a final response (which
/// may itself be a non-2xx upstream error body, already structured for the
/// handler to propagate) plus its status, ready to hand back to the caller.
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

impl UpstreamClient {
    pub fn new(api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            http,
            api_base: api_base.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn headers(upstream_key: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {upstream_key}").parse().expect("valid bearer header"),
        );
        headers.insert(reqwest::header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    /// POST `body` to `path` with retry/backoff on transient failures. Returns
    /// the final response (status + parsed-or-synthesized JSON body) or a
    /// `ProxyError` for non-retryable rejections / exhausted retries.
    async fn post_with_retry(
        &self,
        path: &str,
        upstream_key: &str,
        body: &Value,
        retry: &RetryPolicy,
    ) -> Result<UpstreamResponse, ProxyError> {
        let url = self.url(path);
        let headers = Self::headers(upstream_key);

        for attempt in 0..retry.max_attempts {
            let result = self
                .http
                .post(&url)
                .headers(headers.clone())
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status < 300 {
                        let text = response.text().await.unwrap_or_default();
                        let parsed = serde_json::from_str(&text).unwrap_or(Value::Null);
                        return Ok(UpstreamResponse { status, body: parsed });
                    }
                    let is_last_attempt = attempt + 1 >= retry.max_attempts;
                    if is_retryable_status(status) && !is_last_attempt {
                        tracing::warn!(attempt, status, "upstream request failed, retrying");
                        tokio::time::sleep(backoff_delay(retry, attempt)).await;
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(Self::error_from_status(status, &text));
                }
                Err(err) => {
                    let is_last_attempt = attempt + 1 >= retry.max_attempts;
                    if !is_last_attempt {
                        tracing::warn!(attempt, %err, "upstream transport error, retrying");
                        tokio::time::sleep(backoff_delay(retry, attempt)).await;
                        continue;
                    }
                    return Err(ProxyError::ServiceUnavailable(format!(
                        "failed to connect to upstream: {err}"
                    )));
                }
            }
        }
        unreachable!("retry loop always returns or continues until max_attempts")
    }

    fn error_from_status(status: u16, body_text: &str) -> ProxyError {
        let status_code = axum::http::StatusCode::from_u16(status)
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        match serde_json::from_str::<Value>(body_text) {
            Ok(body) => ProxyError::Upstream { status: status_code, body },
            Err(_) => ProxyError::Upstream {
                status: status_code,
                body: serde_json::json!({
                    "error": {
                        "type": "api_error",
                        "message": format!("OpenAI API error: {status}"),
                        "param": Value::Null,
                        "code": Value::Null,
                    }
                }),
            },
        }
    }

    pub async fn chat_completions(
        &self,
        upstream_key: &str,
        body: &Value,
        retry: &RetryPolicy,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.post_with_retry("chat/completions", upstream_key, body, retry).await
    }

    pub async fn completions(
        &self,
        upstream_key: &str,
        body: &Value,
        retry: &RetryPolicy,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.post_with_retry("completions", upstream_key, body, retry).await
    }

    pub async fn embeddings(
        &self,
        upstream_key: &str,
        body: &Value,
        retry: &RetryPolicy,
    ) -> Result<UpstreamResponse, ProxyError> {
        self.post_with_retry("embeddings", upstream_key, body, retry).await
    }

    pub async fn models(&self, upstream_key: &str, retry: &RetryPolicy) -> Result<UpstreamResponse, ProxyError> {
        let url = self.url("models");
        let headers = Self::headers(upstream_key);
        for attempt in 0..retry.max_attempts {
            let result = self.http.get(&url).headers(headers.clone()).send().await;
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status < 300 {
                        let text = response.text().await.unwrap_or_default();
                        let parsed = serde_json::from_str(&text).unwrap_or(Value::Null);
                        return Ok(UpstreamResponse { status, body: parsed });
                    }
                    let is_last_attempt = attempt + 1 >= retry.max_attempts;
                    if is_retryable_status(status) && !is_last_attempt {
                        tokio::time::sleep(backoff_delay(retry, attempt)).await;
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(Self::error_from_status(status, &text));
                }
                Err(err) => {
                    let is_last_attempt = attempt + 1 >= retry.max_attempts;
                    if !is_last_attempt {
                        tokio::time::sleep(backoff_delay(retry, attempt)).await;
                        continue;
                    }
                    return Err(ProxyError::ServiceUnavailable(format!(
                        "failed to connect to upstream: {err}"
                    )));
                }
            }
        }
        unreachable!("retry loop always returns or continues until max_attempts")
    }

    /// Open a streaming chat-completions call. No retry: the client request
    /// body is single-pass and cannot be safely re-sent once the connection
    /// has been established. Returns a byte stream already framed as
    /// `data: <json>\n\n`, with the `[DONE]` sentinel absorbed (not re-emitted)
    /// and non-data lines dropped. A non-200 open is translated into a single
    /// framed error event before the stream ends.
    pub async fn chat_completions_stream(
        &self,
        upstream_key: &str,
        body: &Value,
    ) -> Result<impl futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>>, ProxyError>
    {
        let url = self.url("chat/completions");
        let headers = Self::headers(upstream_key);
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|err| ProxyError::ServiceUnavailable(format!("failed to connect to upstream: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()).map(|s| s.to_string()))
                .unwrap_or_else(|| format!("OpenAI API error: {}", status.as_u16()));
            let frame = format!("data: {}\n\n", serde_json::json!({ "error": message }));
            let once = futures_util::stream::once(async move { Ok(bytes::Bytes::from(frame)) });
            return Ok(futures_util::future::Either::Left(once));
        }

        let framed = sse_frame_stream(response.bytes_stream());
        Ok(futures_util::future::Either::Right(framed))
    }
}

/// Buffer raw upstream bytes into lines, re-frame `data: ` lines as SSE events,
/// drop everything else, and end the stream on the `[DONE]` sentinel without
/// re-emitting it. Tolerates upstream chunk boundaries splitting a line across
/// reads, and both `\n` and `\r\n` line endings.
struct SseFrameState<S> {
    upstream: S,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<bytes::Bytes>,
    done: bool,
}

fn sse_frame_stream(
    upstream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    let state = SseFrameState {
        upstream,
        buffer: Vec::new(),
        pending: std::collections::VecDeque::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.upstream.next().await {
                None => return None,
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())), state));
                }
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    for line in drain_complete_lines(&mut state.buffer) {
                        if let Some(data) = parse_sse_data(&line) {
                            if is_done_sentinel(data) {
                                state.done = true;
                                break;
                            }
                            state.pending.push_back(bytes::Bytes::from(format!("data: {data}\n\n")));
                        }
                    }
                }
            }
        }
    })
}

fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop(); // trailing \n
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

fn is_done_sentinel(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_matches_default_factor_sequence() {
        let policy = RetryPolicy { max_attempts: 3, backoff_factor: 2.0 };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(4));
    }

    #[test]
    fn retryable_statuses_match_spec_set() {
        for s in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(s));
        }
        for s in [400, 401, 403, 404, 422] {
            assert!(!is_retryable_status(s));
        }
    }

    #[test]
    fn parse_sse_data_strips_prefix_and_optional_space() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn is_done_sentinel_matches_done_marker() {
        assert!(is_done_sentinel("[DONE]"));
        assert!(is_done_sentinel(" [DONE] "));
        assert!(!is_done_sentinel("{\"d\":1}"));
    }

    #[test]
    fn drain_complete_lines_buffers_partial_line_across_calls() {
        let mut buf = b"data: {\"d\":1".to_vec();
        assert!(drain_complete_lines(&mut buf).is_empty());
        buf.extend_from_slice(b"}\ndata: [DONE]\n");
        let lines = drain_complete_lines(&mut buf);
        assert_eq!(lines, vec!["data: {\"d\":1}".to_string(), "data: [DONE]".to_string()]);
    }

    #[test]
    fn drain_complete_lines_strips_crlf() {
        let mut buf = b"data: {\"d\":1}\r\n".to_vec();
        let lines = drain_complete_lines(&mut buf);
        assert_eq!(lines, vec!["data: {\"d\":1}".to_string()]);
    }

    #[test]
    fn error_from_status_synthesizes_envelope_for_non_json_body() {
        let err = UpstreamClient::error_from_status(503, "not json");
        match err {
            ProxyError::Upstream { status, body } => {
                assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body["error"]["type"], "api_error");
            }
            _ => panic!("expected Upstream variant"),
        }
    }

    #[test]
    fn error_from_status_propagates_json_body_verbatim() {
        let body = serde_json::json!({"error": {"message": "bad key", "type": "invalid_request_error"}});
        let err = UpstreamClient::error_from_status(401, &body.to_string());
        match err {
            ProxyError::Upstream { status, body: got } => {
                assert_eq!(status, axum::http::StatusCode::UNAUTHORIZED);
                assert_eq!(got, body);
            }
            _ => panic!("expected Upstream variant"),
        }
    }
}
