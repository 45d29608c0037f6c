//! Cache behavior of the release source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use party_updater::{
    CACHE_EXPIRY, ReleaseSource, ReleaseTag, RepoId, Result, TagFetcher, UpdateError,
    VersionCache,
};

fn tag(name: &str) -> ReleaseTag {
    ReleaseTag {
        name: name.to_string(),
        zipball_url: format!("https://api.github.com/repos/MetaCubeX/mihomo/zipball/refs/tags/{name}"),
        tarball_url: format!("https://api.github.com/repos/MetaCubeX/mihomo/tarball/refs/tags/{name}"),
    }
}

/// Scripted fetcher that counts invocations.
#[derive(Default)]
struct ScriptedFetcher {
    calls: AtomicUsize,
    responses: Mutex<VecDeque<Result<Vec<ReleaseTag>>>>,
}

impl ScriptedFetcher {
    fn push(&self, response: Result<Vec<ReleaseTag>>) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TagFetcher for ScriptedFetcher {
    async fn fetch_tags(&self, _repo: &RepoId) -> Result<Vec<ReleaseTag>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![tag("v1.18.0")]))
    }
}

fn source() -> (ReleaseSource<Arc<ScriptedFetcher>>, Arc<ScriptedFetcher>) {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let source = ReleaseSource::new(Arc::clone(&fetcher), Arc::new(VersionCache::new()));
    (source, fetcher)
}

#[tokio::test(start_paused = true)]
async fn test_empty_cache_fetches_and_stores() {
    let (source, fetcher) = source();
    let repo = RepoId::new("MetaCubeX", "mihomo");

    let tags = source.list_versions(&repo, false).await.unwrap();
    assert_eq!(tags, vec![tag("v1.18.0")]);
    assert_eq!(fetcher.calls(), 1);

    let (cached, age) = source.cache().get_any(&repo).unwrap();
    assert_eq!(cached, tags);
    assert_eq!(age, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_two_calls_within_window_fetch_once() {
    let (source, fetcher) = source();
    let repo = RepoId::mihomo();

    source.list_versions(&repo, false).await.unwrap();
    tokio::time::advance(Duration::from_secs(120)).await;
    source.list_versions(&repo, false).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_call_after_expiry_fetches_again() {
    let (source, fetcher) = source();
    let repo = RepoId::mihomo();

    source.list_versions(&repo, false).await.unwrap();
    tokio::time::advance(CACHE_EXPIRY + Duration::from_secs(1)).await;
    source.list_versions(&repo, false).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_bypasses_and_overwrites() {
    let (source, fetcher) = source();
    let repo = RepoId::mihomo();

    source.list_versions(&repo, false).await.unwrap();
    fetcher.push(Ok(vec![tag("v1.19.0"), tag("v1.18.0")]));

    let refreshed = source.list_versions(&repo, true).await.unwrap();
    assert_eq!(refreshed, vec![tag("v1.19.0"), tag("v1.18.0")]);
    assert_eq!(fetcher.calls(), 2);

    let cached = source.list_versions(&repo, false).await.unwrap();
    assert_eq!(cached, refreshed);
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_surfaces_and_keeps_old_entry() {
    let (source, fetcher) = source();
    let repo = RepoId::mihomo();

    source.list_versions(&repo, false).await.unwrap();
    tokio::time::advance(CACHE_EXPIRY * 2).await;

    fetcher.push(Err(UpdateError::SourceUnavailable("timed out".to_string())));
    let err = source.list_versions(&repo, false).await.unwrap_err();
    assert!(matches!(err, UpdateError::SourceUnavailable(_)));

    let (stale, _) = source.cache().get_any(&repo).unwrap();
    assert_eq!(stale, vec![tag("v1.18.0")]);
    assert!(source.cache().get_fresh(&repo).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cache_miss_with_rate_limit_is_an_error() {
    let (source, fetcher) = source();
    fetcher.push(Err(UpdateError::RateLimited { retry_after: 42 }));

    let err = source.list_versions(&RepoId::mihomo(), false).await.unwrap_err();
    assert!(matches!(err, UpdateError::RateLimited { retry_after: 42 }));
    assert!(source.cache().get_any(&RepoId::mihomo()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_clear_cache_forces_next_fetch() {
    let (source, fetcher) = source();
    let repo = RepoId::mihomo();

    source.list_versions(&repo, false).await.unwrap();
    assert!(source.clear_cache(&repo));
    assert!(!source.clear_cache(&repo));

    source.list_versions(&repo, false).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shared_cache_between_sources() {
    let cache = Arc::new(VersionCache::new());
    let first_fetcher = Arc::new(ScriptedFetcher::default());
    let second_fetcher = Arc::new(ScriptedFetcher::default());
    let first = ReleaseSource::new(Arc::clone(&first_fetcher), Arc::clone(&cache));
    let second = ReleaseSource::new(Arc::clone(&second_fetcher), cache);

    first.list_versions(&RepoId::mihomo(), false).await.unwrap();
    second.list_versions(&RepoId::mihomo(), false).await.unwrap();
    assert_eq!(first_fetcher.calls(), 1);
    assert_eq!(second_fetcher.calls(), 0);
}
