//! Response caching.
//!
//! Layers, bottom up:
//! - [`traits::Cache`]: the raw key-value contract (get/set/set-if-absent/
//!   delete with TTL) implemented by [`MemoryCache`] and, behind the `redis`
//!   feature, [`RedisCache`].
//! - [`response_cache::ResponseCache`]: completion entries, negative
//!   caching, and the policy for which writes win.
//! - [`single_flight::SingleFlightRegistry`]: per-process coalescing of
//!   concurrent identical computations.

pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod response_cache;
pub mod single_flight;
pub mod traits;

pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis::RedisCache;
pub use response_cache::{CachedCompletion, CachedOutcome, LookupResult, ResponseCache};
pub use single_flight::{FlightOutcome, SingleFlightRegistry};
pub use traits::{Cache, CacheExt};

use std::sync::Arc;

use crate::config::CacheBackendConfig;

/// Build the cache store selected by config.
pub async fn build_store(config: &CacheBackendConfig) -> CacheResult<Arc<dyn Cache>> {
    match config {
        CacheBackendConfig::Memory {
            max_entries,
            eviction_batch_size,
        } => Ok(Arc::new(MemoryCache::new(*max_entries, *eviction_batch_size))),
        #[cfg(feature = "redis")]
        CacheBackendConfig::Redis { url } => Ok(Arc::new(RedisCache::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        CacheBackendConfig::Redis { .. } => Err(CacheError::NotConfigured(
            "cache.backend.type = \"redis\" requires the 'redis' cargo feature".into(),
        )),
    }
}
