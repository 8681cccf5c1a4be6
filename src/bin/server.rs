//! Process entry point: load configuration, wire `AppState`, serve the
//! router until `SIGINT`/`SIGTERM`.

use std::sync::Arc;

use llm_proxy::bucket::BucketRegistry;
use llm_proxy::cache::Cache;
use llm_proxy::config::Config;
use llm_proxy::context::AppState;
use llm_proxy::credentials::CredentialMap;
use llm_proxy::metrics::Metrics;
use llm_proxy::upstream::UpstreamClient;
use llm_proxy::{logging, router};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    logging::init(&config);

    let (credentials, mapping_error) = CredentialMap::from_config(&config);
    if let Some(err) = mapping_error {
        tracing::warn!(%err, "api_key_mapping is not valid JSON; falling back to the default upstream key for every client");
    }

    let cache = Cache::connect(&config.cache.redis_url).await;
    let buckets = BucketRegistry::new(config.rate_limit.requests_per_minute, config.rate_limit.tokens_per_minute);
    let upstream = UpstreamClient::new(&config.openai_api_base);
    let metrics = Metrics::new();

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        credentials: Arc::new(credentials),
        buckets: Arc::new(buckets),
        cache,
        metrics: Arc::new(metrics),
        upstream,
    };

    let app = router::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind_addr}: {err}"));
    tracing::info!(%bind_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

/// Resolves once a `SIGINT` (Ctrl-C) or, on unix, `SIGTERM` is observed, so
/// axum can stop accepting new connections while letting in-flight requests
/// finish.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
