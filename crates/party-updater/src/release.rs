//! Release catalog types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A tag published in the core's release repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseTag {
    /// Version identifier, e.g. `v1.18.0`.
    pub name: String,
    /// Source archive (zip) URL.
    pub zipball_url: String,
    /// Source archive (tar) URL.
    pub tarball_url: String,
}

/// Identity of a GitHub repository, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
}

impl RepoId {
    /// Creates a repository identity.
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// The upstream mihomo repository.
    #[must_use]
    pub fn mihomo() -> Self {
        Self::new("MetaCubeX", "mihomo")
    }

    /// Composite `owner/repo` key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl FromStr for RepoId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, repo))
                if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') =>
            {
                Ok(Self::new(owner, repo))
            }
            _ => Err(format!("expected owner/repo, got {s:?}")),
        }
    }
}

/// Filters tags by a case-insensitive substring of the name.
///
/// An empty needle keeps every tag. Order is preserved.
#[must_use]
pub fn filter_tags<'a>(tags: &'a [ReleaseTag], needle: &str) -> Vec<&'a ReleaseTag> {
    let needle = needle.trim().to_lowercase();
    tags.iter()
        .filter(|tag| needle.is_empty() || tag.name.to_lowercase().contains(&needle))
        .collect()
}
