//! Metrics accumulator (C4): Prometheus-style counters, histogram and gauge.

use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RequestLabels {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub client: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct DurationLabels {
    pub endpoint: String,
    pub method: String,
    pub client: String,
}

/// Exposed as the lowercase `prompt`/`completion`/`total` label values the
/// spec (and the original Python service's `type=`) document — `derive`d
/// `EncodeLabelValue` would instead write the PascalCase variant name, which
/// does not match `tokens_total{...kind="prompt"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Prompt,
    Completion,
    Total,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Prompt => "prompt",
            TokenKind::Completion => "completion",
            TokenKind::Total => "total",
        }
    }
}

impl EncodeLabelValue for TokenKind {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct TokenLabels {
    pub endpoint: String,
    pub client: String,
    pub kind: TokenKind,
}

/// Exposed as lowercase `get`/`set`, matching `cache_operations_total{op=get,...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Get,
    Set,
}

impl CacheOp {
    fn as_str(&self) -> &'static str {
        match self {
            CacheOp::Get => "get",
            CacheOp::Set => "set",
        }
    }
}

impl EncodeLabelValue for CacheOp {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

/// Exposed as lowercase `hit`/`miss`/`success`/`error`, matching
/// `cache_operations_total{...result=hit}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheResult {
    Hit,
    Miss,
    Success,
    Error,
}

impl CacheResult {
    fn as_str(&self) -> &'static str {
        match self {
            CacheResult::Hit => "hit",
            CacheResult::Miss => "miss",
            CacheResult::Success => "success",
            CacheResult::Error => "error",
        }
    }
}

impl EncodeLabelValue for CacheResult {
    fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        writer.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct CacheOpLabels {
    pub op: CacheOp,
    pub result: CacheResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
    pub kind: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ActiveRequestLabels {
    pub endpoint: String,
    pub client: String,
}

pub struct Metrics {
    pub registry: Arc<Registry>,
    requests_total: Family<RequestLabels, Counter>,
    tokens_total: Family<TokenLabels, Counter>,
    cache_operations_total: Family<CacheOpLabels, Counter>,
    upstream_errors_total: Family<UpstreamErrorLabels, Counter>,
    request_duration_seconds: Family<DurationLabels, Histogram>,
    active_requests: Family<ActiveRequestLabels, Gauge>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register("requests_total", "Total number of requests", requests_total.clone());

        let tokens_total = Family::<TokenLabels, Counter>::default();
        registry.register("tokens_total", "Total number of tokens processed", tokens_total.clone());

        let cache_operations_total = Family::<CacheOpLabels, Counter>::default();
        registry.register(
            "cache_operations_total",
            "Total number of cache operations",
            cache_operations_total.clone(),
        );

        let upstream_errors_total = Family::<UpstreamErrorLabels, Counter>::default();
        registry.register(
            "upstream_errors_total",
            "Total number of upstream errors",
            upstream_errors_total.clone(),
        );

        let request_duration_seconds =
            Family::<DurationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.01, 2.0, 12))
            });
        registry.register(
            "request_duration_seconds",
            "Request duration in seconds",
            request_duration_seconds.clone(),
        );

        let active_requests = Family::<ActiveRequestLabels, Gauge>::default();
        registry.register("active_requests", "Number of in-flight requests", active_requests.clone());

        Self {
            registry: Arc::new(registry),
            requests_total,
            tokens_total,
            cache_operations_total,
            upstream_errors_total,
            request_duration_seconds,
            active_requests,
        }
    }

    pub fn record_tokens(&self, endpoint: &str, client: &str, prompt: i64, completion: i64, total: i64) {
        if prompt > 0 {
            self.tokens_total
                .get_or_create(&TokenLabels {
                    endpoint: endpoint.to_string(),
                    client: client.to_string(),
                    kind: TokenKind::Prompt,
                })
                .inc_by(prompt as u64);
        }
        if completion > 0 {
            self.tokens_total
                .get_or_create(&TokenLabels {
                    endpoint: endpoint.to_string(),
                    client: client.to_string(),
                    kind: TokenKind::Completion,
                })
                .inc_by(completion as u64);
        }
        if total > 0 {
            self.tokens_total
                .get_or_create(&TokenLabels {
                    endpoint: endpoint.to_string(),
                    client: client.to_string(),
                    kind: TokenKind::Total,
                })
                .inc_by(total as u64);
        }
    }

    pub fn record_cache_op(&self, op: CacheOp, result: CacheResult) {
        self.cache_operations_total
            .get_or_create(&CacheOpLabels { op, result })
            .inc();
    }

    pub fn record_upstream_error(&self, kind: &str, status_code: u16) {
        self.upstream_errors_total
            .get_or_create(&UpstreamErrorLabels {
                kind: kind.to_string(),
                status_code,
            })
            .inc();
    }

    /// Enter a request's metrics scope: bumps the active-requests gauge and
    /// returns a guard whose `Drop` impl emits the duration/count observation
    /// on every exit path, including early returns via `?` and panics that
    /// unwind through it.
    pub fn enter_scope(self: &Arc<Self>, endpoint: &str, method: &str, client: &str) -> RequestScope {
        self.active_requests
            .get_or_create(&ActiveRequestLabels {
                endpoint: endpoint.to_string(),
                client: client.to_string(),
            })
            .inc();
        RequestScope {
            metrics: self.clone(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            client: client.to_string(),
            start: std::time::Instant::now(),
            status_code: std::cell::Cell::new(None),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII scope for a single request's `requests_total`/`request_duration_seconds`/
/// `active_requests` observations. The handler calls `set_status` once it knows
/// the outcome; if it never does (panic, early return before the status is
/// known), the scope still fires with status 500 on drop.
pub struct RequestScope {
    metrics: Arc<Metrics>,
    endpoint: String,
    method: String,
    client: String,
    start: std::time::Instant,
    status_code: std::cell::Cell<Option<u16>>,
}

impl RequestScope {
    pub fn set_status(&self, status_code: u16) {
        self.status_code.set(Some(status_code));
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let status_code = self.status_code.get().unwrap_or(500);

        self.metrics
            .request_duration_seconds
            .get_or_create(&DurationLabels {
                endpoint: self.endpoint.clone(),
                method: self.method.clone(),
                client: self.client.clone(),
            })
            .observe(elapsed);

        self.metrics
            .requests_total
            .get_or_create(&RequestLabels {
                endpoint: self.endpoint.clone(),
                method: self.method.clone(),
                status_code,
                client: self.client.clone(),
            })
            .inc();

        self.metrics
            .active_requests
            .get_or_create(&ActiveRequestLabels {
                endpoint: self.endpoint.clone(),
                client: self.client.clone(),
            })
            .dec();
    }
}

/// Best-effort extraction of `usage.{prompt,completion,total}_tokens` from a
/// response body; any parse failure or missing field yields the zero record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

pub fn extract_usage(body: &serde_json::Value) -> Usage {
    let usage = body.get("usage");
    Usage {
        prompt_tokens: usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        completion_tokens: usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        total_tokens: usage
            .and_then(|u| u.get("total_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_usage_reads_present_fields() {
        let body = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}});
        let usage = extract_usage(&body);
        assert_eq!(usage, Usage { prompt_tokens: 5, completion_tokens: 7, total_tokens: 12 });
    }

    #[test]
    fn extract_usage_defaults_missing_fields_to_zero() {
        let usage = extract_usage(&json!({}));
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn extract_usage_treats_non_object_as_zero() {
        let usage = extract_usage(&json!("not an object"));
        assert_eq!(usage, Usage::default());
    }

    #[test]
    fn scope_drop_records_default_status_when_unset() {
        let metrics = Arc::new(Metrics::new());
        {
            let _scope = metrics.enter_scope("chat_completions", "POST", "k1");
        }
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &metrics.registry).unwrap();
        assert!(buf.contains("status_code=\"500\""));
    }

    #[test]
    fn cache_and_token_labels_are_exposed_lowercase() {
        let metrics = Metrics::new();
        metrics.record_cache_op(CacheOp::Get, CacheResult::Hit);
        metrics.record_tokens("embeddings", "k1", 5, 7, 12);

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &metrics.registry).unwrap();

        assert!(buf.contains("op=\"get\""));
        assert!(buf.contains("result=\"hit\""));
        assert!(buf.contains("kind=\"prompt\""));
        assert!(buf.contains("kind=\"completion\""));
        assert!(buf.contains("kind=\"total\""));
        assert!(!buf.contains("\"Get\""));
        assert!(!buf.contains("\"Hit\""));
        assert!(!buf.contains("\"Prompt\""));
    }
}
