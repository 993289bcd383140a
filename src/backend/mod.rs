use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::SyncError;
use crate::types::{Issue, IssueKind, Repository};

pub mod github;

/// One page of one collection of one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub repository: Repository,
    pub kind: IssueKind,
    /// `None` asks for the first page
    pub after: Option<String>,
}

/// Pagination metadata returned with every page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

/// The answer to a single [`PageRequest`]
#[derive(Debug, Clone)]
pub struct Page {
    pub repository: Repository,
    pub kind: IssueKind,
    pub issues: Vec<Issue>,
    pub page_info: PageInfo,
}

impl Page {
    /// An empty final page, used for repositories the remote could not resolve
    pub fn empty(repository: Repository, kind: IssueKind) -> Self {
        Self {
            repository,
            kind,
            issues: Vec::new(),
            page_info: PageInfo::default(),
        }
    }
}

/// Paginated, rate-limited remote listing of open issues and pull requests
#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Fetch several pages, possibly across many repositories, in one
    /// round-trip. Issues within a page keep the order the remote returned.
    async fn fetch_pages(&self, requests: &[PageRequest]) -> Result<Vec<Page>, SyncError>;

    /// Open items of `kind` in `repositories` updated strictly after `since`
    async fn search_updated(
        &self,
        kind: IssueKind,
        since: DateTime<Utc>,
        repositories: &[Repository],
    ) -> Result<Vec<Issue>, SyncError>;
}

#[async_trait]
impl<T: IssueSource + ?Sized> IssueSource for Arc<T> {
    async fn fetch_pages(&self, requests: &[PageRequest]) -> Result<Vec<Page>, SyncError> {
        (**self).fetch_pages(requests).await
    }

    async fn search_updated(
        &self,
        kind: IssueKind,
        since: DateTime<Utc>,
        repositories: &[Repository],
    ) -> Result<Vec<Issue>, SyncError> {
        (**self).search_updated(kind, since, repositories).await
    }
}
