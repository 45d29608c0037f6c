//! Release Source Client.
//!
//! [`GitHubClient`] talks to the GitHub tags API. [`ReleaseSource`] puts the
//! shared [`VersionCache`] in front of any [`TagFetcher`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};

use crate::cache::VersionCache;
use crate::error::{Result, UpdateError};
use crate::release::{ReleaseTag, RepoId};

/// GitHub API base URL.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// GitHub REST API version header value.
const API_VERSION: &str = "2022-11-28";

/// Tags requested per page.
const TAGS_PER_PAGE: u32 = 100;

/// Budget for one tag listing request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// User agent string for API requests.
pub(crate) const USER_AGENT_VALUE: &str = concat!("mihomo-party/", env!("CARGO_PKG_VERSION"));

/// Source of release tags for a repository.
pub trait TagFetcher: Send + Sync {
    /// Fetches the tag list for `repo` from the remote index.
    fn fetch_tags(&self, repo: &RepoId) -> impl Future<Output = Result<Vec<ReleaseTag>>> + Send;
}

impl<T: TagFetcher> TagFetcher for Arc<T> {
    fn fetch_tags(&self, repo: &RepoId) -> impl Future<Output = Result<Vec<ReleaseTag>>> + Send {
        (**self).fetch_tags(repo)
    }
}

/// GitHub API client for listing repository tags.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_base: String,
}

impl GitHubClient {
    /// Creates a client against `api_base` (normally [`GITHUB_API_URL`]).
    ///
    /// A token, when given, is sent as a bearer credential.
    pub fn new(api_base: impl Into<String>, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|e| UpdateError::SourceUnavailable(format!("invalid token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| {
                UpdateError::SourceUnavailable(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Tags listing URL for a repository.
    #[must_use]
    pub fn tags_url(&self, repo: &RepoId) -> String {
        format!(
            "{}/repos/{}/{}/tags?per_page={TAGS_PER_PAGE}",
            self.api_base, repo.owner, repo.repo
        )
    }
}

impl TagFetcher for GitHubClient {
    async fn fetch_tags(&self, repo: &RepoId) -> Result<Vec<ReleaseTag>> {
        let url = self.tags_url(repo);
        tracing::debug!("Fetching tags from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| UpdateError::SourceUnavailable(describe_request_error(&e)))?;

        let status = response.status();
        if let Some(retry_after) = rate_limit_retry_after(status, response.headers()) {
            return Err(UpdateError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpdateError::SourceUnavailable(format!(
                "GitHub API error ({status}): {}",
                body.trim()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpdateError::SourceUnavailable(describe_request_error(&e)))?;
        let tags: Vec<ReleaseTag> = serde_json::from_slice(&bytes)?;
        Ok(tags)
    }
}

fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out after {}s", FETCH_TIMEOUT.as_secs())
    } else {
        err.to_string()
    }
}

/// Returns the retry delay when the response signals throttling.
///
/// GitHub answers 403 or 429 with `x-ratelimit-remaining: 0` for primary
/// limits and a `retry-after` header for secondary limits.
fn rate_limit_retry_after(status: StatusCode, headers: &HeaderMap) -> Option<u64> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(secs) = header("retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(secs);
    }
    let exhausted = header("x-ratelimit-remaining") == Some("0");
    if !exhausted && status == StatusCode::FORBIDDEN {
        return None;
    }
    let retry_after = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|reset| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            reset.saturating_sub(now)
        })
        .unwrap_or(60);
    Some(retry_after)
}

/// Cached release catalog in front of a [`TagFetcher`].
#[derive(Debug, Clone)]
pub struct ReleaseSource<F = GitHubClient> {
    fetcher: F,
    cache: Arc<VersionCache>,
}

impl<F: TagFetcher> ReleaseSource<F> {
    /// Creates a source that shares `cache` with other users.
    pub fn new(fetcher: F, cache: Arc<VersionCache>) -> Self {
        Self { fetcher, cache }
    }

    /// Lists the tags of `repo`.
    ///
    /// A fresh cache entry is served unless `force_refresh` is set. Otherwise
    /// the remote index is queried and, on success, the entry is replaced.
    /// A failed fetch leaves the existing entry untouched and is returned
    /// as an error; expired data is never served from here.
    pub async fn list_versions(
        &self,
        repo: &RepoId,
        force_refresh: bool,
    ) -> Result<Vec<ReleaseTag>> {
        if !force_refresh
            && let Some(tags) = self.cache.get_fresh(repo)
        {
            return Ok(tags);
        }

        let tags = self.fetcher.fetch_tags(repo).await.inspect_err(|e| {
            tracing::warn!(repo = %repo, error = %e, "failed to fetch release tags");
        })?;
        self.cache.replace(repo, &tags);
        tracing::info!(repo = %repo, count = tags.len(), force_refresh, "release tags refreshed");
        Ok(tags)
    }

    /// Evicts the cached list of `repo`. Returns whether an entry existed.
    pub fn clear_cache(&self, repo: &RepoId) -> bool {
        self.cache.clear(repo)
    }

    /// The shared cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<VersionCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_url() {
        let client = GitHubClient::new(GITHUB_API_URL, None).unwrap();
        assert_eq!(
            client.tags_url(&RepoId::mihomo()),
            "https://api.github.com/repos/MetaCubeX/mihomo/tags?per_page=100"
        );
    }

    #[test]
    fn test_api_base_trailing_slash() {
        let client = GitHubClient::new("http://127.0.0.1:8080/", Some("ghp_token")).unwrap();
        assert_eq!(
            client.tags_url(&RepoId::new("a", "b")),
            "http://127.0.0.1:8080/repos/a/b/tags?per_page=100"
        );
    }

    #[test]
    fn test_user_agent() {
        assert!(USER_AGENT_VALUE.starts_with("mihomo-party/"));
    }

    #[test]
    fn test_rate_limit_detection() {
        let mut headers = HeaderMap::new();
        assert_eq!(rate_limit_retry_after(StatusCode::FORBIDDEN, &headers), None);

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert_eq!(
            rate_limit_retry_after(StatusCode::FORBIDDEN, &headers),
            Some(60)
        );

        headers.insert("retry-after", HeaderValue::from_static("17"));
        assert_eq!(
            rate_limit_retry_after(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(17)
        );
        assert_eq!(rate_limit_retry_after(StatusCode::OK, &headers), None);
    }

    #[test]
    fn test_reset_in_the_past_saturates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1"));
        assert_eq!(
            rate_limit_retry_after(StatusCode::FORBIDDEN, &headers),
            Some(0)
        );
    }
}
