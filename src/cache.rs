//! Fingerprint & cache (C3): deterministic request fingerprinting and a
//! best-effort Redis-backed response cache.

use sha2::{Digest, Sha256};

/// Recursively sort object keys so two semantically identical bodies produce
/// the same fingerprint regardless of field insertion order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// `SHA-256("endpoint:" + canonical_json(body))`, hex-encoded, first 16
/// characters, prefixed with the cache key namespace. `serde_json::to_string`
/// never inserts whitespace, so canonicalization only needs to sort keys.
pub fn fingerprint(endpoint: &str, body: &serde_json::Value) -> String {
    let canonical = canonicalize(body).to_string();
    let payload = format!("{endpoint}:{canonical}");
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let hex_digest = hex::encode(hasher.finalize());
    format!("openai_proxy:{endpoint}:{}", &hex_digest[..16])
}

/// Admission predicate: whether a request is eligible for caching at all.
///
/// Per the documented (conservative) policy, only `embeddings` and `models`
/// are ever cached; a `temperature == 0 && seed` request is still excluded —
/// this is a deliberate, currently-unreconciled gap in the upstream policy,
/// not an oversight here.
pub fn should_cache(endpoint: &str, body: &serde_json::Value) -> bool {
    if endpoint == "embeddings" || endpoint == "models" {
        return true;
    }
    if body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return false;
    }
    false
}

/// Best-effort Redis-backed cache. Any backend failure degrades the operation
/// to a miss/no-op rather than failing the request; if the initial connection
/// attempt at startup fails, the handle stays in the disabled state for the
/// rest of the process lifetime.
#[derive(Clone)]
pub struct Cache {
    inner: Option<std::sync::Arc<tokio::sync::Mutex<redis::aio::MultiplexedConnection>>>,
}

impl Cache {
    /// Attempt to connect; on failure, return a disabled cache rather than an
    /// error — caching degrades gracefully, it never blocks startup.
    pub async fn connect(redis_url: &str) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_multiplexed_tokio_connection().await {
                Ok(conn) => {
                    tracing::info!(redis_url, "cache backend connected");
                    Self {
                        inner: Some(std::sync::Arc::new(tokio::sync::Mutex::new(conn))),
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "cache backend unreachable at startup; caching disabled");
                    Self { inner: None }
                }
            },
            Err(err) => {
                tracing::warn!(%err, "invalid cache backend url; caching disabled");
                Self { inner: None }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub async fn get(&self, endpoint: &str, body: &serde_json::Value) -> Option<Vec<u8>> {
        let inner = self.inner.as_ref()?;
        let key = fingerprint(endpoint, body);
        let mut conn = inner.lock().await;
        match redis::cmd("GET").arg(&key).query_async::<_, Option<Vec<u8>>>(&mut *conn).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%err, cache_key = %key, "cache get error");
                None
            }
        }
    }

    /// Best-effort store; failures are swallowed and logged, never propagated.
    pub async fn set(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        value: &[u8],
        ttl_secs: u64,
    ) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let key = fingerprint(endpoint, body);
        let mut conn = inner.lock().await;
        match redis::cmd("SETEX")
            .arg(&key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, cache_key = %key, "cache set error");
                false
            }
        }
    }

    /// `true` if the backend responds to a PING; used by the `/health` endpoint.
    pub async fn ping(&self) -> bool {
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let mut conn = inner.lock().await;
        redis::cmd("PING").query_async::<_, String>(&mut *conn).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a = json!({"model": "m", "messages": [], "stream": false});
        let b = json!({"stream": false, "messages": [], "model": "m"});
        assert_eq!(fingerprint("chat_completions", &a), fingerprint("chat_completions", &b));
    }

    #[test]
    fn fingerprint_differs_across_endpoints() {
        let body = json!({"a": 1});
        assert_ne!(fingerprint("embeddings", &body), fingerprint("models", &body));
    }

    #[test]
    fn fingerprint_has_expected_shape() {
        let body = json!({"a": 1});
        let fp = fingerprint("embeddings", &body);
        assert!(fp.starts_with("openai_proxy:embeddings:"));
        let hex_part = fp.strip_prefix("openai_proxy:embeddings:").unwrap();
        assert_eq!(hex_part.len(), 16);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn embeddings_always_eligible() {
        assert!(should_cache("embeddings", &json!({"stream": true})));
    }

    #[test]
    fn models_always_eligible() {
        assert!(should_cache("models", &json!({})));
    }

    #[test]
    fn streaming_never_eligible() {
        assert!(!should_cache("chat_completions", &json!({"stream": true})));
    }

    #[test]
    fn zero_temperature_with_seed_is_still_ineligible() {
        // Documented conservative behavior: even the "should be deterministic"
        // case is excluded by the current policy.
        assert!(!should_cache(
            "chat_completions",
            &json!({"temperature": 0, "seed": 42})
        ));
    }

    #[tokio::test]
    async fn disabled_cache_is_a_pure_miss() {
        let cache = Cache::disabled();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("embeddings", &json!({})).await, None);
        assert!(!cache.set("embeddings", &json!({}), b"x", 60).await);
    }
}
