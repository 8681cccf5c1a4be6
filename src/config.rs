//! Process configuration, loaded once from the environment at startup.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub embeddings_ttl: u64,
    pub default_ttl: u64,
}

/// Process-lifetime configuration. Constructed once in `main` and shared via `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub debug: bool,
    pub log_level: String,

    pub openai_api_base: String,
    pub openai_api_key: String,

    pub client_api_keys: String,
    pub api_key_mapping: String,

    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,

    pub retry_max_attempts: u32,
    pub retry_backoff_factor: f64,

    pub bind_addr: String,
}

impl Config {
    /// Load from environment variables. Only `openai_api_key` is required; every
    /// other field degrades to a documented default rather than failing startup.
    pub fn from_env() -> Result<Self, String> {
        let openai_api_key = env::var("openai_api_key")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .map_err(|_| "openai_api_key is required".to_string())?;
        if openai_api_key.trim().is_empty() {
            return Err("openai_api_key must not be empty".to_string());
        }

        Ok(Self {
            environment: env_string("environment", "development"),
            debug: env_parsed("debug", false),
            log_level: env_string("log_level", "info"),

            openai_api_base: env_string("openai_api_base", "https://api.openai.com/v1"),
            openai_api_key,

            client_api_keys: env_string("client_api_keys", ""),
            api_key_mapping: env_string("api_key_mapping", ""),

            rate_limit: RateLimitConfig {
                requests_per_minute: env_parsed("rate_limit__requests_per_minute", 60),
                tokens_per_minute: env_parsed("rate_limit__tokens_per_minute", 100_000),
            },
            cache: CacheConfig {
                redis_url: env_string("cache__redis_url", "redis://localhost:6379"),
                embeddings_ttl: env_parsed("cache__embeddings_ttl", 3600),
                default_ttl: env_parsed("cache__default_ttl", 300),
            },

            retry_max_attempts: env_parsed("retry_max_attempts", 3),
            retry_backoff_factor: env_parsed("retry_backoff_factor", 2.0),

            bind_addr: env_string("bind_addr", "0.0.0.0:8000"),
        })
    }

    /// Accepted proxy keys. Empty set means accept-all ("open mode").
    pub fn valid_client_keys(&self) -> std::collections::HashSet<String> {
        self.client_api_keys
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    /// Proxy key -> upstream key mapping. Malformed JSON degrades to an empty
    /// mapping (every client falls back to the default upstream key); logged
    /// once by the caller, not here.
    pub fn key_mapping(&self) -> Result<HashMap<String, String>, serde_json::Error> {
        if self.api_key_mapping.trim().is_empty() {
            return Ok(HashMap::new());
        }
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct Mapping(HashMap<String, String>);
        let parsed: Mapping = serde_json::from_str(&self.api_key_mapping)?;
        Ok(parsed.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_client_keys_splits_and_trims() {
        let cfg = Config {
            client_api_keys: " k1, k2 ,,k3".to_string(),
            ..test_config()
        };
        let keys = cfg.valid_client_keys();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("k1"));
        assert!(keys.contains("k3"));
    }

    #[test]
    fn empty_client_keys_means_open_mode() {
        let cfg = test_config();
        assert!(cfg.valid_client_keys().is_empty());
    }

    #[test]
    fn key_mapping_parses_json_object() {
        let cfg = Config {
            api_key_mapping: r#"{"k1":"sk-A"}"#.to_string(),
            ..test_config()
        };
        let mapping = cfg.key_mapping().unwrap();
        assert_eq!(mapping.get("k1"), Some(&"sk-A".to_string()));
    }

    #[test]
    fn key_mapping_rejects_malformed_json() {
        let cfg = Config {
            api_key_mapping: "not json".to_string(),
            ..test_config()
        };
        assert!(cfg.key_mapping().is_err());
    }

    fn test_config() -> Config {
        Config {
            environment: "development".into(),
            debug: false,
            log_level: "info".into(),
            openai_api_base: "https://api.openai.com/v1".into(),
            openai_api_key: "sk-default".into(),
            client_api_keys: String::new(),
            api_key_mapping: String::new(),
            rate_limit: RateLimitConfig {
                requests_per_minute: 60,
                tokens_per_minute: 100_000,
            },
            cache: CacheConfig {
                redis_url: "redis://localhost:6379".into(),
                embeddings_ttl: 3600,
                default_ttl: 300,
            },
            retry_max_attempts: 3,
            retry_backoff_factor: 2.0,
            bind_addr: "0.0.0.0:8000".into(),
        }
    }
}
