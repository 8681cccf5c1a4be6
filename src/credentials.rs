//! Credential map (C1): proxy-issued key -> upstream key resolution.

use std::collections::{HashMap, HashSet};

use crate::config::Config;

/// Resolves proxy-issued bearer tokens to upstream API keys.
///
/// Built once at startup from configuration and shared read-only across all
/// request tasks; resolution never mutates state, so no synchronization is
/// needed beyond the `Arc` that shares it.
#[derive(Debug, Clone)]
pub struct CredentialMap {
    accepted: HashSet<String>,
    mapping: HashMap<String, String>,
    default_upstream_key: String,
}

impl CredentialMap {
    /// Build from configuration. A malformed `api_key_mapping` degrades to an
    /// empty mapping (every client falls back to the default upstream key)
    /// rather than failing startup; the caller is expected to log that once.
    pub fn from_config(cfg: &Config) -> (Self, Option<serde_json::Error>) {
        let (mapping, mapping_error) = match cfg.key_mapping() {
            Ok(m) => (m, None),
            Err(e) => (HashMap::new(), Some(e)),
        };
        let map = Self {
            accepted: cfg.valid_client_keys(),
            mapping,
            default_upstream_key: cfg.openai_api_key.clone(),
        };
        (map, mapping_error)
    }

    /// Open mode (no configured allow-list) accepts any non-empty bearer token.
    pub fn accepts(&self, proxy_key: &str) -> bool {
        self.accepted.is_empty() || self.accepted.contains(proxy_key)
    }

    /// Resolve a proxy key to the upstream key to use. Returns `None` only when
    /// no default upstream key is configured at all (never the case once
    /// `Config::from_env` has succeeded, since `openai_api_key` is required).
    pub fn resolve(&self, proxy_key: &str) -> Option<String> {
        if let Some(upstream) = self.mapping.get(proxy_key) {
            if !upstream.is_empty() {
                return Some(upstream.clone());
            }
        }
        if self.default_upstream_key.is_empty() {
            None
        } else {
            Some(self.default_upstream_key.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(accepted: &[&str], mapping: &[(&str, &str)], default_key: &str) -> CredentialMap {
        CredentialMap {
            accepted: accepted.iter().map(|s| s.to_string()).collect(),
            mapping: mapping
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default_upstream_key: default_key.to_string(),
        }
    }

    #[test]
    fn empty_accept_list_is_open_mode() {
        let m = map(&[], &[], "sk-default");
        assert!(m.accepts("anything"));
    }

    #[test]
    fn non_empty_accept_list_restricts() {
        let m = map(&["k1", "k2"], &[], "sk-default");
        assert!(m.accepts("k1"));
        assert!(!m.accepts("k3"));
    }

    #[test]
    fn mapped_key_resolves_to_its_upstream_key() {
        let m = map(&["k1"], &[("k1", "sk-A")], "sk-default");
        assert_eq!(m.resolve("k1").as_deref(), Some("sk-A"));
    }

    #[test]
    fn unmapped_key_falls_back_to_default() {
        let m = map(&[], &[("k1", "sk-A")], "sk-default");
        assert_eq!(m.resolve("k2").as_deref(), Some("sk-default"));
    }

    #[test]
    fn no_default_and_no_mapping_resolves_to_none() {
        let m = map(&[], &[], "");
        assert_eq!(m.resolve("anything"), None);
    }
}
