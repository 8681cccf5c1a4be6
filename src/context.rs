//! Per-request context and the process-lifetime `AppState` bundle.

use std::sync::Arc;

use crate::bucket::BucketRegistry;
use crate::cache::Cache;
use crate::config::Config;
use crate::credentials::CredentialMap;
use crate::metrics::Metrics;
use crate::upstream::UpstreamClient;

/// `Arc`-shared, process-lifetime handles to C1–C5, threaded through axum via
/// the `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialMap>,
    pub buckets: Arc<BucketRegistry>,
    pub cache: Cache,
    pub metrics: Arc<Metrics>,
    pub upstream: UpstreamClient,
}

/// Per-request record, attached to the request's extensions by the
/// authentication stage and read by the rate-limit stage and handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: uuid::Uuid,
    pub client_key: Option<String>,
    pub upstream_key: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            client_key: None,
            upstream_key: None,
        }
    }
}
