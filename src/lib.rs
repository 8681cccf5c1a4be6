//! Authenticating, rate-limiting, caching reverse proxy for an
//! OpenAI-compatible LLM API.
//!
//! The library crate exposes the request-path engine (credential
//! resolution, token buckets, fingerprinting cache, metrics, upstream
//! client, middleware chain and endpoint handlers) plus the axum `Router`
//! that wires them together; `src/bin/server.rs` is the thin process
//! entry point that loads configuration and serves the router.

pub mod bucket;
pub mod cache;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod upstream;
