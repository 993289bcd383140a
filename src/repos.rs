use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backend::github::GitHubSource;
use crate::parser::{parse_manifest, parse_repo_list};
use crate::types::Repository;

/// Where the list of tracked repositories comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoSource {
    /// Public repositories owned by the authenticated user
    CurrentUser,
    /// Public repositories of an organization
    Organization(String),
    /// A text file with one `owner/name` per line
    File(PathBuf),
    /// A vcstool-style YAML manifest
    Manifest(PathBuf),
}

impl RepoSource {
    /// Resolve the repository list. The result is deduplicated and keeps the
    /// order in which repositories were first seen.
    pub async fn load(&self, github: &GitHubSource) -> Result<Vec<Repository>> {
        let repos = match self {
            RepoSource::CurrentUser => github
                .viewer_repositories()
                .await
                .context("Failed to list repositories of the current user")?,
            RepoSource::Organization(login) => github
                .organization_repositories(login)
                .await
                .with_context(|| format!("Failed to list repositories of {login}"))?,
            RepoSource::File(path) => parse_repo_list(&read(path)?)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            RepoSource::Manifest(path) => parse_manifest(&read(path)?)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
        };

        let repos = dedup(repos);
        info!(source = %self, repos = repos.len(), "loaded repository list");
        Ok(repos)
    }
}

impl fmt::Display for RepoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoSource::CurrentUser => f.write_str("current user"),
            RepoSource::Organization(login) => write!(f, "organization {login}"),
            RepoSource::File(path) => write!(f, "file {}", path.display()),
            RepoSource::Manifest(path) => write!(f, "manifest {}", path.display()),
        }
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Drop repeated repositories, keeping the first occurrence
pub fn dedup(repos: Vec<Repository>) -> Vec<Repository> {
    let mut seen = HashSet::new();
    repos
        .into_iter()
        .filter(|repo| seen.insert(repo.clone()))
        .collect()
}
