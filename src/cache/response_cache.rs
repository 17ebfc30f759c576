//! Completion entry semantics on top of the raw key-value store.
//!
//! # Write policy
//!
//! - Successful responses under policy `use` are written with set-if-absent:
//!   an existing entry wins, so concurrent replicas that both computed the
//!   same fingerprint keep the first committed result.
//! - `refresh` writes unconditionally; the newer response replaces the entry.
//! - Deterministic backend rejections may be negative-cached with a short
//!   TTL to stop hot-failure loops. Transient failures are never cached.
//!
//! Entries are immutable after write and expire by TTL; an expired entry is
//! indistinguishable from a miss.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use super::traits::{Cache, CacheExt};
use crate::{
    api_types::TokenUsage,
    fingerprint::{Fingerprint, Fingerprinter},
    observability::metrics,
};

/// A cached successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub response_text: String,
    /// Backend-reported model identifier at compute time.
    pub model_used: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    /// Unix seconds at write time.
    pub created_at: i64,
    pub ttl_secs: u64,
}

impl CachedCompletion {
    pub fn tokens(&self) -> TokenUsage {
        TokenUsage {
            prompt: self.prompt_tokens,
            completion: self.completion_tokens,
        }
    }
}

/// What lives under a fingerprint key: a completion, or a remembered
/// deterministic rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CachedOutcome {
    Success(CachedCompletion),
    Rejected { status: u16, message: String },
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum LookupResult {
    Hit(CachedCompletion),
    /// A negative entry: the backend deterministically rejected this
    /// fingerprint recently.
    NegativeHit { status: u16, message: String },
    Miss,
}

/// Response cache service.
pub struct ResponseCache {
    store: Arc<dyn Cache>,
    fingerprinter: Fingerprinter,
    default_ttl: Duration,
    negative_ttl: Duration,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn Cache>,
        fingerprinter: Fingerprinter,
        default_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            store,
            fingerprinter,
            default_ttl,
            negative_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up the entry for a fingerprint. Store errors degrade to a miss;
    /// an unreachable cache must not fail requests.
    pub async fn lookup(&self, fp: &Fingerprint) -> LookupResult {
        let cache_key = self.fingerprinter.cache_key(fp);

        match self.store.get_json::<CachedOutcome>(&cache_key).await {
            Ok(Some(CachedOutcome::Success(entry))) => {
                metrics::record_cache_operation("get", "hit");
                tracing::debug!(
                    cache_key = %cache_key,
                    model = %entry.model_used,
                    "Response cache hit"
                );
                LookupResult::Hit(entry)
            }
            Ok(Some(CachedOutcome::Rejected { status, message })) => {
                metrics::record_cache_operation("get", "negative_hit");
                tracing::debug!(cache_key = %cache_key, status, "Negative cache hit");
                LookupResult::NegativeHit { status, message }
            }
            Ok(None) => {
                metrics::record_cache_operation("get", "miss");
                LookupResult::Miss
            }
            Err(e) => {
                metrics::record_cache_operation("get", "error");
                tracing::warn!(
                    cache_key = %cache_key,
                    error = %e,
                    "Response cache lookup error, treating as miss"
                );
                LookupResult::Miss
            }
        }
    }

    /// Store a successful completion.
    ///
    /// With `refresh` the write replaces any existing entry; otherwise an
    /// existing entry is kept and the write is a no-op. Returns true when
    /// the entry was written.
    pub async fn store_success(
        &self,
        fp: &Fingerprint,
        entry: &CachedCompletion,
        refresh: bool,
    ) -> bool {
        let cache_key = self.fingerprinter.cache_key(fp);
        let ttl = Duration::from_secs(entry.ttl_secs);
        let outcome = CachedOutcome::Success(entry.clone());

        let result = if refresh {
            self.store
                .set_json(&cache_key, &outcome, ttl)
                .await
                .map(|()| true)
        } else {
            self.store.set_json_nx(&cache_key, &outcome, ttl).await
        };

        match result {
            Ok(written) => {
                metrics::record_cache_operation("set", "success");
                tracing::debug!(
                    cache_key = %cache_key,
                    written,
                    refresh,
                    ttl_secs = entry.ttl_secs,
                    "Response cached"
                );
                written
            }
            Err(e) => {
                metrics::record_cache_operation("set", "error");
                tracing::warn!(cache_key = %cache_key, error = %e, "Failed to cache response");
                false
            }
        }
    }

    /// Negative-cache a deterministic rejection under the short TTL.
    /// Set-if-absent keeps the first rejection when replicas race.
    pub async fn store_negative(&self, fp: &Fingerprint, status: u16, message: &str) {
        if self.negative_ttl.is_zero() {
            return;
        }

        let cache_key = self.fingerprinter.cache_key(fp);
        let outcome = CachedOutcome::Rejected {
            status,
            message: message.to_string(),
        };

        match self
            .store
            .set_json_nx(&cache_key, &outcome, self.negative_ttl)
            .await
        {
            Ok(_) => {
                metrics::record_cache_operation("set", "negative");
                tracing::debug!(
                    cache_key = %cache_key,
                    status,
                    ttl_secs = self.negative_ttl.as_secs(),
                    "Rejection negative-cached"
                );
            }
            Err(e) => {
                metrics::record_cache_operation("set", "error");
                tracing::warn!(cache_key = %cache_key, error = %e, "Failed to negative-cache");
            }
        }
    }

    /// Remove the entry for a fingerprint. Eventual consistency is
    /// tolerated.
    pub async fn invalidate(&self, fp: &Fingerprint) {
        let cache_key = self.fingerprinter.cache_key(fp);
        if let Err(e) = self.store.delete(&cache_key).await {
            tracing::warn!(cache_key = %cache_key, error = %e, "Failed to invalidate entry");
        }
    }
}
