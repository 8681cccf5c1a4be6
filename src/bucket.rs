//! Token bucket (C2): per-client leaky-bucket quota primitive.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// A single refilling bucket: capacity, refill rate, current tokens and the
/// instant tokens were last topped up. `Instant` is monotonic, so refill can
/// never go backwards under wall-clock adjustments.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    fn eta(&mut self, n: f64) -> f64 {
        self.refill();
        if self.tokens >= n {
            0.0
        } else if self.refill_rate <= 0.0 {
            f64::INFINITY
        } else {
            (n - self.tokens) / self.refill_rate
        }
    }
}

/// A named token bucket guarded by its own mutex: contention is per-bucket,
/// not global, so different clients never block one another.
pub struct NamedBucket(Mutex<Bucket>);

impl NamedBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self(Mutex::new(Bucket::new(capacity, refill_rate)))
    }

    /// Refill then atomically consume `n` tokens. `true` if admitted.
    pub fn consume(&self, n: f64) -> bool {
        self.0.lock().expect("bucket mutex poisoned").consume(n)
    }

    /// Seconds until `n` tokens would be available, given the current refill rate.
    pub fn eta(&self, n: f64) -> f64 {
        self.0.lock().expect("bucket mutex poisoned").eta(n)
    }
}

/// Which quota dimension a bucket tracks for a given client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Requests,
    Tokens,
}

/// Lazily-created, process-lifetime registry of per-client buckets.
///
/// Insertion races on first sighting of a client are resolved by holding the
/// map lock across get-or-create; the buckets themselves are independent once
/// created, so steady-state traffic never contends on this lock.
pub struct BucketRegistry {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    buckets: Mutex<HashMap<(String, BucketKind), std::sync::Arc<NamedBucket>>>,
}

impl BucketRegistry {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(
        &self,
        client_key: &str,
        kind: BucketKind,
    ) -> std::sync::Arc<NamedBucket> {
        let mut buckets = self.buckets.lock().expect("bucket registry mutex poisoned");
        let key = (client_key.to_string(), kind);
        if let Some(existing) = buckets.get(&key) {
            return existing.clone();
        }
        let bucket = match kind {
            BucketKind::Requests => std::sync::Arc::new(NamedBucket::new(
                self.requests_per_minute as f64,
                self.requests_per_minute as f64 / 60.0,
            )),
            BucketKind::Tokens => std::sync::Arc::new(NamedBucket::new(
                self.tokens_per_minute as f64,
                self.tokens_per_minute as f64 / 60.0,
            )),
        };
        buckets.insert(key, bucket.clone());
        bucket
    }
}

/// `max(100, content_length / 4)`; an absent header is treated as 0 bytes,
/// which floors the estimate at 100. Intentionally pessimistic and never
/// reconciled against the upstream's actually-reported usage.
pub fn estimate_tokens(content_length: Option<u64>) -> u64 {
    let bytes = content_length.unwrap_or(0);
    std::cmp::max(100, bytes / 4)
}
