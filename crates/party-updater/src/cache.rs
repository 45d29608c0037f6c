//! Process-wide cache of release tag lists.
//!
//! Entries are keyed by `owner/repo` and are always replaced whole. Readers
//! receive a cloned snapshot, so a concurrent refresh is never observed
//! half-written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::release::{ReleaseTag, RepoId};

/// How long a fetched tag list stays fresh.
pub const CACHE_EXPIRY: Duration = Duration::from_secs(300);

/// A cached tag list and the instant it was fetched.
#[derive(Debug, Clone)]
struct CacheEntry {
    tags: Arc<[ReleaseTag]>,
    fetched_at: Instant,
}

/// Cache of tag lists shared between all release source users.
#[derive(Debug)]
pub struct VersionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    expiry: Duration,
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionCache {
    /// Creates an empty cache with the standard expiry window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry: CACHE_EXPIRY,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry for `repo` if it is younger than the expiry window.
    #[must_use]
    pub fn get_fresh(&self, repo: &RepoId) -> Option<Vec<ReleaseTag>> {
        let entries = self.lock();
        let entry = entries.get(&repo.key())?;
        let age = entry.fetched_at.elapsed();
        if age < self.expiry {
            tracing::debug!(repo = %repo, age_secs = age.as_secs(), "version cache hit");
            Some(entry.tags.to_vec())
        } else {
            None
        }
    }

    /// Returns the entry for `repo` regardless of age, with its age.
    ///
    /// Only for callers that explicitly choose to fall back to stale data.
    #[must_use]
    pub fn get_any(&self, repo: &RepoId) -> Option<(Vec<ReleaseTag>, Duration)> {
        self.lock()
            .get(&repo.key())
            .map(|entry| (entry.tags.to_vec(), entry.fetched_at.elapsed()))
    }

    /// Replaces the entry for `repo` with a freshly fetched list.
    pub fn replace(&self, repo: &RepoId, tags: &[ReleaseTag]) {
        let entry = CacheEntry {
            tags: Arc::from(tags),
            fetched_at: Instant::now(),
        };
        self.lock().insert(repo.key(), entry);
    }

    /// Evicts the entry for `repo`. Returns whether an entry existed.
    pub fn clear(&self, repo: &RepoId) -> bool {
        let existed = self.lock().remove(&repo.key()).is_some();
        tracing::debug!(repo = %repo, existed, "version cache cleared");
        existed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<ReleaseTag> {
        names
            .iter()
            .map(|name| ReleaseTag {
                name: (*name).to_string(),
                zipball_url: String::new(),
                tarball_url: String::new(),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_window() {
        let cache = VersionCache::new();
        let repo = RepoId::mihomo();
        cache.replace(&repo, &tags(&["v1.18.0"]));

        tokio::time::advance(CACHE_EXPIRY - Duration::from_secs(1)).await;
        assert_eq!(cache.get_fresh(&repo), Some(tags(&["v1.18.0"])));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get_fresh(&repo), None);

        let (stale, age) = cache.get_any(&repo).unwrap();
        assert_eq!(stale, tags(&["v1.18.0"]));
        assert_eq!(age, CACHE_EXPIRY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_is_wholesale() {
        let cache = VersionCache::new();
        let repo = RepoId::mihomo();
        cache.replace(&repo, &tags(&["v1", "v2"]));
        cache.replace(&repo, &tags(&["v3"]));
        assert_eq!(cache.get_fresh(&repo), Some(tags(&["v3"])));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let cache = VersionCache::new();
        let repo = RepoId::mihomo();
        assert!(!cache.clear(&repo));

        cache.replace(&repo, &tags(&["v1.18.0"]));
        assert!(cache.clear(&repo));
        assert!(!cache.clear(&repo));
        assert!(cache.get_any(&repo).is_none());
    }

    #[test]
    fn test_keys_are_per_repository() {
        let cache = VersionCache::new();
        cache.replace(&RepoId::mihomo(), &tags(&["v1"]));
        assert!(cache.get_fresh(&RepoId::new("MetaCubeX", "other")).is_none());
    }
}
