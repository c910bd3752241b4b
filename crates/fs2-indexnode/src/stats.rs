//! Periodically generated index statistics.
//!
//! Popular files need a full scan of the hash index, so statistics are built
//! by a background task and served from a cache.

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

use crate::registry::ClientRegistry;

/// One entry of the popular files list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopularFileInfo {
    /// Path of a representative copy.
    pub path: String,
    /// Content hash.
    pub hash: String,
    /// File size.
    pub size: u64,
    /// Number of copies on the network.
    pub alternatives: usize,
}

/// Snapshot of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Registered clients.
    pub clients: usize,
    /// Files indexed, counting every copy.
    pub files: u64,
    /// Distinct hashes indexed.
    pub unique_files: u64,
    /// Bytes indexed, counting every copy.
    pub total_size: u64,
    /// Bytes indexed, counting each hash once.
    pub unique_size: u64,
    /// Most replicated files first.
    pub popular_files: Vec<PopularFileInfo>,
    /// Seconds since the indexnode started.
    pub uptime_secs: u64,
    /// Unix time the snapshot was taken.
    pub generated_at: u64,
}

impl IndexStats {
    /// Builds a snapshot from the registry and its filesystem.
    pub fn generate(registry: &ClientRegistry, popular_limit: usize, started: Instant) -> Self {
        let fs = registry.filesystem();
        let popular_files = fs
            .popular_files(popular_limit)
            .into_iter()
            .map(|p| PopularFileInfo {
                path: fs.path_of(&p.entry),
                hash: p.entry.content_hash().to_string(),
                size: p.entry.size(),
                alternatives: p.alternatives,
            })
            .collect();

        Self {
            clients: registry.client_count(),
            files: fs.count_files(),
            unique_files: fs.count_unique_files(),
            total_size: fs.total_size(),
            unique_size: fs.unique_size(),
            popular_files,
            uptime_secs: started.elapsed().as_secs(),
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// Latest statistics snapshot.
#[derive(Debug, Default)]
pub struct StatsCache {
    current: RwLock<Arc<IndexStats>>,
}

impl StatsCache {
    /// Creates a cache holding an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached snapshot.
    pub fn get(&self) -> Arc<IndexStats> {
        self.current.read().clone()
    }

    /// Replaces the cached snapshot.
    pub fn set(&self, stats: IndexStats) {
        *self.current.write() = Arc::new(stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_starts_empty() {
        let cache = StatsCache::new();
        assert_eq!(*cache.get(), IndexStats::default());

        cache.set(IndexStats {
            clients: 2,
            ..Default::default()
        });
        assert_eq!(cache.get().clients, 2);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = IndexStats {
            files: 1,
            popular_files: vec![PopularFileInfo {
                path: "/alice/music/track.mp3".into(),
                hash: "0123456789abcdef0123456789abcdef".into(),
                size: 4_000_000,
                alternatives: 2,
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["files"], 1);
        assert_eq!(json["popular_files"][0]["alternatives"], 2);
    }
}
