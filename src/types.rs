use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

/// A tracked remote repository, `owner/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse the `owner/name` form used on the command line and in repo files
    pub fn parse(slug: &str) -> Result<Self, SyncError> {
        let mut parts = slug.trim().split('/');
        let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(SyncError::Validation(format!(
                "expected owner/name, got {slug:?}"
            )));
        };

        let repo = Self::new(owner, name);
        repo.validate()?;
        Ok(repo)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for (field, value) in [("owner", &self.owner), ("name", &self.name)] {
            if value.is_empty() {
                return Err(SyncError::Validation(format!("repository {field} is empty")));
            }
            if value.contains('/') || value.chars().any(char::is_whitespace) {
                return Err(SyncError::Validation(format!(
                    "repository {field} {value:?} is not a valid identifier"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Which remote collection an item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    Issue,
    PullRequest,
}

impl IssueKind {
    pub const ALL: [IssueKind; 2] = [IssueKind::Issue, IssueKind::PullRequest];

    /// Qualifier used by the search API
    pub fn search_qualifier(&self) -> &'static str {
        match self {
            IssueKind::Issue => "is:issue",
            IssueKind::PullRequest => "is:pr",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::Issue => f.write_str("issue"),
            IssueKind::PullRequest => f.write_str("pull request"),
        }
    }
}

/// Identity of a tracked item. GitHub issues and pull requests share one
/// number space per repository, so the kind is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueKey {
    pub repository: Repository,
    pub number: u64,
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.number)
    }
}

/// An open issue or pull request as last seen on the remote.
///
/// Records are replaced whole; two records describe the same item when their
/// [`IssueKey`]s match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub repository: Repository,
    pub kind: IssueKind,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub number: u64,
    pub title: String,
    pub url: String,
    /// Has the viewer looked at this item since its last update?
    pub is_read: bool,
}

impl Issue {
    pub fn key(&self) -> IssueKey {
        IssueKey {
            repository: self.repository.clone(),
            number: self.number,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        self.repository.validate()?;
        if self.number == 0 {
            return Err(SyncError::Validation(format!(
                "{} has no issue number",
                self.repository
            )));
        }
        Ok(())
    }
}

/// Resume point for one paged collection of one repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationCursor {
    /// `None` until the first page has been fetched
    pub token: Option<String>,
    pub exhausted: bool,
}

impl PaginationCursor {
    pub fn is_open(&self) -> bool {
        !self.exhausted
    }

    /// Record the page metadata of a response. Exhaustion is terminal.
    pub fn advance(&mut self, end_cursor: Option<String>, has_next_page: bool) {
        if self.exhausted {
            return;
        }
        if has_next_page {
            self.token = end_cursor;
        } else {
            self.exhausted = true;
        }
    }
}

/// Bulk-load bookkeeping for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCursors {
    pub repository: Repository,
    pub issues: PaginationCursor,
    pub pull_requests: PaginationCursor,
}

impl RepoCursors {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            issues: PaginationCursor::default(),
            pull_requests: PaginationCursor::default(),
        }
    }

    pub fn cursor(&self, kind: IssueKind) -> &PaginationCursor {
        match kind {
            IssueKind::Issue => &self.issues,
            IssueKind::PullRequest => &self.pull_requests,
        }
    }

    pub fn cursor_mut(&mut self, kind: IssueKind) -> &mut PaginationCursor {
        match kind {
            IssueKind::Issue => &mut self.issues,
            IssueKind::PullRequest => &mut self.pull_requests,
        }
    }

    pub fn has_open_cursor(&self) -> bool {
        self.issues.is_open() || self.pull_requests.is_open()
    }
}
