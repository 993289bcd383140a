use anyhow::{Context, Result};
use pest::Parser;
use pest_derive::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::types::Repository;

#[derive(Parser)]
#[grammar = "repos.pest"]
pub struct RepoListParser;

/// Parse a static repository list: one `owner/name` per line
pub fn parse_repo_list(content: &str) -> Result<Vec<Repository>> {
    let file = RepoListParser::parse(Rule::file, content)
        .context("Incorrect repository list format. Use one owner/name per line")?
        .next()
        .context("Empty document")?;

    let mut repos = Vec::new();
    for line in file.into_inner() {
        if line.as_rule() != Rule::line {
            continue;
        }
        if let Some(pair) = line.into_inner().next() {
            repos.push(parse_repository(pair)?);
        }
    }

    Ok(repos)
}

fn parse_repository(pair: pest::iterators::Pair<Rule>) -> Result<Repository> {
    let (line, _) = pair.line_col();
    let text = pair.as_str();
    let mut segments = pair.into_inner();

    let owner = segments.next().context("Missing owner")?.as_str();
    let name = segments.next().context("Missing name")?.as_str();

    let repo = Repository::new(owner, name);
    repo.validate()
        .with_context(|| format!("Invalid repository {text:?} on line {line}"))?;
    Ok(repo)
}

/// A vcstool-style `.repos` manifest
#[derive(Debug, Deserialize)]
struct Manifest {
    repositories: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    url: Option<String>,
}

/// Parse the GitHub repositories out of a YAML manifest, in file order.
/// Entries hosted elsewhere are skipped.
pub fn parse_manifest(content: &str) -> Result<Vec<Repository>> {
    let manifest: Manifest =
        serde_yaml::from_str(content).context("Failed to parse repository manifest")?;

    let mut repos = Vec::new();
    for (path, entry) in manifest.repositories {
        let path = path.as_str().unwrap_or("<unnamed>").to_string();
        let entry: ManifestEntry = serde_yaml::from_value(entry)
            .with_context(|| format!("Invalid manifest entry {path}"))?;

        let Some(url) = entry.url else {
            warn!(%path, "manifest entry has no url, skipping");
            continue;
        };

        match parse_github_url(&url) {
            Some(repo) => repos.push(repo),
            None => warn!(%path, %url, "not a GitHub repository, skipping"),
        }
    }

    Ok(repos)
}

/// Extract `owner/name` from an https or ssh GitHub clone URL
pub fn parse_github_url(url: &str) -> Option<Repository> {
    let url = url.trim();
    let slug = ["https://github.com/", "http://github.com/", "ssh://git@github.com/", "git@github.com:"]
        .iter()
        .find_map(|prefix| url.strip_prefix(prefix))?;
    let slug = slug.trim_end_matches('/');
    let slug = slug.strip_suffix(".git").unwrap_or(slug);

    Repository::parse(slug).ok()
}
