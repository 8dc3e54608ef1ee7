//! Bearer-token principal resolution.
//!
//! Caller authentication proper is an upstream concern; this resolver maps
//! already-issued bearer tokens to principals from a YAML token table.
//! Lookups go through a TTL cache so the table file can be rotated on disk
//! without a restart and without a read per request.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;
use tracing::warn;

use weir_common::config::AuthSettings;
use weir_common::principal::Principal;

#[derive(Debug, Deserialize)]
struct TokenFile {
    tokens: BTreeMap<String, Principal>,
}

pub struct TokenAuthenticator {
    token_file: PathBuf,
    cache: Cache<String, Principal>,
}

impl TokenAuthenticator {
    pub fn new(token_file: impl Into<PathBuf>, settings: &AuthSettings) -> Self {
        let cache = Cache::builder()
            .time_to_live(Duration::from_secs(settings.cache_ttl_secs))
            .max_capacity(settings.cache_max_capacity)
            .build();
        Self {
            token_file: token_file.into(),
            cache,
        }
    }

    /// Resolve a bearer token to its principal, or `None` for unknown
    /// tokens.
    pub async fn authenticate(&self, token: &str) -> Option<Principal> {
        if let Some(principal) = self.cache.get(token).await {
            return Some(principal);
        }

        let table = match self.load_table() {
            Some(table) => table,
            None => return None,
        };
        let principal = table.tokens.get(token).cloned()?;
        self.cache
            .insert(token.to_string(), principal.clone())
            .await;
        Some(principal)
    }

    fn load_table(&self) -> Option<TokenFile> {
        let yaml = match std::fs::read_to_string(&self.token_file) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(file = ?self.token_file, error = %e, "cannot read token table");
                return None;
            }
        };
        match serde_yaml::from_str(&yaml) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!(file = ?self.token_file, error = %e, "invalid token table");
                None
            }
        }
    }
}

/// Extract the bearer token from an Authorization header value.
pub fn bearer_token(header_value: &str) -> &str {
    header_value.strip_prefix("Bearer ").unwrap_or(header_value)
}
