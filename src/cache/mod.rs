//! Persistent bidirectional selector cache and enhanced cache keys.

pub mod bidirectional;
pub mod keys;
pub mod snapshot;
pub mod store;

pub use bidirectional::{BidirectionalCache, CacheHit, CacheStats, CleanupReport, LookupSource};
pub use keys::{extract_url_pattern, steps_structure_hash, EnhancedCacheKey, SelectorFamily};
pub use snapshot::{SnapshotOptions, SnapshotScope};
pub use store::{LegacyMigration, SqliteStore};

use crate::error::Result;
use async_trait::async_trait;

/// Seam between the cache and its consumers. The scenario store composes a
/// backend through this trait instead of reaching into cache internals.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, input: &str, url: &str) -> Result<Option<CacheHit>>;
    async fn set(&self, input: &str, url: &str, selector: &str) -> Result<()>;
    async fn invalidate(&self, selector: &str, url: &str) -> Result<usize>;
    async fn stats(&self) -> Result<CacheStats>;
}

#[async_trait]
impl CacheBackend for BidirectionalCache {
    async fn get(&self, input: &str, url: &str) -> Result<Option<CacheHit>> {
        BidirectionalCache::get(self, input, url).await
    }

    async fn set(&self, input: &str, url: &str, selector: &str) -> Result<()> {
        BidirectionalCache::set(self, input, url, selector).await
    }

    async fn invalidate(&self, selector: &str, url: &str) -> Result<usize> {
        BidirectionalCache::invalidate(self, selector, url).await
    }

    async fn stats(&self) -> Result<CacheStats> {
        BidirectionalCache::stats(self).await
    }
}
