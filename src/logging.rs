//! Structured logging bootstrap.
//!
//! Compact, human-readable output in development; JSON lines otherwise, mirroring
//! the upstream Python service's structlog-in-prod / plain-in-dev split.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub fn init(cfg: &Config) {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if cfg.environment == "development" {
        subscriber.compact().init();
    } else {
        subscriber.json().init();
    }
}
