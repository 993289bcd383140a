use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{IssueSource, Page, PageRequest};
use crate::cache::IssueCache;
use crate::error::SyncError;
use crate::repos::dedup;
use crate::types::{Issue, IssueKind, RepoCursors, Repository};

/// Tuning knobs for the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Repositories covered by one bulk-load request
    pub repos_per_query: usize,
    /// Items per collection per repository in one bulk-load request
    pub page_size: u32,
    /// Repositories named in one search query while polling
    pub search_repos_per_query: usize,
    pub poll_interval_secs: u64,
    /// Upper bound for the poll delay after repeated failures
    pub max_poll_backoff_secs: u64,
    /// Retries for a request failing with a transient error
    pub request_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            repos_per_query: 20,
            page_size: 50,
            search_repos_per_query: 10,
            poll_interval_secs: 15,
            max_poll_backoff_secs: 300,
            request_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Delay before the next poll after `failures` consecutive failed polls
    pub fn poll_delay(&self, failures: u32) -> Duration {
        let max = Duration::from_secs(self.max_poll_backoff_secs).max(self.poll_interval());
        self.poll_interval()
            .saturating_mul(2u32.saturating_pow(failures))
            .min(max)
    }
}

/// Lifecycle of a sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    NotStarted,
    /// Bulk load in progress; `progress` grows monotonically to 1.0
    Loading { progress: f64 },
    /// Bulk load finished, incremental polling is running
    Polling,
    /// The bulk load hit an unrecoverable error
    Failed(SyncError),
    /// Cancelled through its [`CancellationToken`]
    Stopped,
}

impl SyncState {
    pub fn is_loading(&self) -> bool {
        matches!(self, SyncState::NotStarted | SyncState::Loading { .. })
    }
}

/// Keeps an [`IssueCache`] current from an [`IssueSource`].
///
/// The engine first walks every open-item collection of every repository
/// page by page, then polls for items updated since the newest one it knows
/// about. Progress and state changes are published on a watch channel.
pub struct SyncEngine<S: IssueSource> {
    source: S,
    cache: Arc<IssueCache>,
    repos: Arc<[Repository]>,
    settings: SyncSettings,
    state: watch::Sender<SyncState>,
    /// Lower bound for poll queries while the cache is empty
    loaded_since: DateTime<Utc>,
}

impl<S: IssueSource> SyncEngine<S> {
    /// Repeated repositories in `repos` are tracked once
    pub fn new(
        source: S,
        cache: Arc<IssueCache>,
        repos: impl IntoIterator<Item = Repository>,
        settings: SyncSettings,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::NotStarted);
        Self {
            source,
            cache,
            repos: dedup(repos.into_iter().collect()).into(),
            settings,
            state,
            loaded_since: Utc::now(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn cache(&self) -> &Arc<IssueCache> {
        &self.cache
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Exhaustively page through all open issues and pull requests.
    ///
    /// Returns early with the state set to `Stopped` when `cancel` fires. Any
    /// request failure aborts the load and leaves the engine `Failed`.
    pub async fn bulk_load(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.loaded_since = Utc::now();
        let mut cursors: Vec<RepoCursors> =
            self.repos.iter().cloned().map(RepoCursors::new).collect();

        info!(repos = cursors.len(), "starting bulk load");
        self.set_state(SyncState::Loading { progress: 0.0 });

        loop {
            let requests = next_batch(&cursors, self.settings.repos_per_query);
            if requests.is_empty() {
                break;
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("bulk load cancelled");
                    self.set_state(SyncState::Stopped);
                    return Ok(());
                }
                response = self.source.fetch_pages(&requests) => response,
            };

            if let Err(err) = response.and_then(|pages| self.apply_pages(&mut cursors, &requests, pages)) {
                error!(error = %err, "bulk load failed");
                self.set_state(SyncState::Failed(err.clone()));
                return Err(err);
            }

            let progress = bulk_progress(&cursors);
            debug!(progress, "bulk load progress");
            self.set_state(SyncState::Loading { progress });
        }

        self.set_state(SyncState::Loading { progress: 1.0 });
        info!(issues = self.cache.len(), "bulk load finished");
        Ok(())
    }

    fn apply_pages(
        &self,
        cursors: &mut [RepoCursors],
        requests: &[PageRequest],
        pages: Vec<Page>,
    ) -> Result<(), SyncError> {
        let index: HashMap<Repository, usize> = cursors
            .iter()
            .enumerate()
            .map(|(i, c)| (c.repository.clone(), i))
            .collect();
        let mut pending: HashSet<(Repository, IssueKind)> = requests
            .iter()
            .map(|r| (r.repository.clone(), r.kind))
            .collect();

        for page in pages {
            if !pending.remove(&(page.repository.clone(), page.kind)) {
                return Err(SyncError::Protocol(format!(
                    "unrequested {} page for {}",
                    page.kind, page.repository
                )));
            }
            if page.page_info.has_next_page && page.page_info.end_cursor.is_none() {
                return Err(SyncError::Protocol(format!(
                    "{} page for {} has more items but no cursor",
                    page.kind, page.repository
                )));
            }

            self.insert_all(page.issues);

            let slot = index[&page.repository];
            cursors[slot]
                .cursor_mut(page.kind)
                .advance(page.page_info.end_cursor, page.page_info.has_next_page);
        }

        if let Some((repository, kind)) = pending.into_iter().next() {
            return Err(SyncError::Protocol(format!(
                "response is missing the {kind} page for {repository}"
            )));
        }
        Ok(())
    }

    fn insert_all(&self, issues: Vec<Issue>) -> usize {
        let mut inserted = 0;
        for issue in issues {
            let key = issue.key();
            match self.cache.insert(issue) {
                Ok(()) => inserted += 1,
                Err(err) => warn!(issue = %key, error = %err, "skipping invalid issue"),
            }
        }
        inserted
    }

    /// Search once for items updated since the newest one in the cache.
    ///
    /// Returns how many records were handed to the cache.
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        let since = self.cache.newest_update_time().unwrap_or(self.loaded_since);
        let mut received = 0;

        for kind in IssueKind::ALL {
            for chunk in self.repos.chunks(self.settings.search_repos_per_query.max(1)) {
                let issues = self.source.search_updated(kind, since, chunk).await?;
                received += self.insert_all(issues);
            }
        }

        Ok(received)
    }

    /// Poll until `cancel` fires. Failed polls are logged and retried with a
    /// growing delay.
    pub async fn poll(&self, cancel: &CancellationToken) {
        info!(interval = ?self.settings.poll_interval(), "polling for updates");
        self.set_state(SyncState::Polling);
        let mut failures = 0u32;

        loop {
            let delay = self.settings.poll_delay(failures);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            match result {
                Ok(received) => {
                    failures = 0;
                    debug!(received, "poll finished");
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    warn!(failures, error = %err, "poll failed");
                }
            }
        }

        info!("polling stopped");
        self.set_state(SyncState::Stopped);
    }

    /// Bulk load, then poll until cancelled
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SyncError> {
        self.bulk_load(&cancel).await?;
        if cancel.is_cancelled() {
            self.set_state(SyncState::Stopped);
            return Ok(());
        }
        self.poll(&cancel).await;
        Ok(())
    }

    /// Run the engine on a background task
    pub fn spawn(self) -> SyncHandle
    where
        S: 'static,
    {
        let cancel = CancellationToken::new();
        let state = self.subscribe();
        let task = tokio::spawn(self.run(cancel.clone()));
        SyncHandle {
            state,
            cancel,
            task,
        }
    }
}

/// Pick up to `limit` repositories that still have an open cursor and build
/// one request per open cursor.
pub fn next_batch(cursors: &[RepoCursors], limit: usize) -> Vec<PageRequest> {
    cursors
        .iter()
        .filter(|c| c.has_open_cursor())
        .take(limit)
        .flat_map(|c| {
            IssueKind::ALL
                .into_iter()
                .filter(|kind| c.cursor(*kind).is_open())
                .map(|kind| PageRequest {
                    repository: c.repository.clone(),
                    kind,
                    after: c.cursor(kind).token.clone(),
                })
        })
        .collect()
}

/// Fraction of per-repository collections that have been fully read
pub fn bulk_progress(cursors: &[RepoCursors]) -> f64 {
    if cursors.is_empty() {
        return 1.0;
    }
    let exhausted = cursors
        .iter()
        .map(|c| usize::from(c.issues.exhausted) + usize::from(c.pull_requests.exhausted))
        .sum::<usize>();
    exhausted as f64 / (2 * cursors.len()) as f64
}

/// Control handle for an engine running on a background task
pub struct SyncHandle {
    state: watch::Receiver<SyncState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), SyncError>>,
}

impl SyncHandle {
    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Ask the engine to stop at its next suspension point
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the bulk load is over. A failed load is returned as `Err`.
    pub async fn wait_until_polling(&mut self) -> Result<SyncState, SyncError> {
        let waited = self
            .state
            .wait_for(|s| !s.is_loading())
            .await
            .map(|state| (*state).clone());
        let state = match waited {
            Ok(state) => state,
            // The engine task is gone; its last word is still readable
            Err(_) => self.state.borrow().clone(),
        };

        match state {
            SyncState::Failed(err) => Err(err),
            state => Ok(state),
        }
    }

    /// Wait for the engine task to finish
    pub async fn join(self) -> Result<(), SyncError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Ok(()),
        }
    }

    /// Cancel the engine and wait for it to stop
    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.cancel();
        self.join().await
    }
}
