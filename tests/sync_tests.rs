use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use treadi::backend::{IssueSource, Page, PageInfo, PageRequest};
use treadi::{Issue, IssueCache, IssueKind, Repository, SyncEngine, SyncError, SyncSettings, SyncState};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2006, 7, 4, hour, 0, 0).unwrap()
}

fn repo(name: &str) -> Repository {
    Repository::new("gazebosim", name)
}

fn issue(repository: &Repository, kind: IssueKind, number: u64, hour: u32) -> Issue {
    Issue {
        repository: repository.clone(),
        kind,
        author: "azeey".to_string(),
        created_at: at(9),
        updated_at: at(hour),
        number,
        title: format!("{repository}#{number}"),
        url: format!("https://github.com/{repository}/issues/{number}"),
        is_read: false,
    }
}

/// In-memory remote. Page tokens are page indexes.
#[derive(Default)]
struct ScriptedSource {
    pages: HashMap<(Repository, IssueKind), Vec<Vec<Issue>>>,
    remote_updates: Mutex<Vec<Issue>>,
    fetches: Mutex<Vec<Vec<PageRequest>>>,
    searches: Mutex<Vec<(IssueKind, DateTime<Utc>, Vec<Repository>)>>,
    /// Engine state as seen at the start of each fetch
    states_at_fetch: Mutex<Vec<SyncState>>,
    observer: Mutex<Option<watch::Receiver<SyncState>>>,
    fail_fetch_number: Option<usize>,
    search_failures: Mutex<usize>,
    hang: bool,
}

impl ScriptedSource {
    fn with_pages(mut self, repository: &Repository, kind: IssueKind, pages: Vec<Vec<Issue>>) -> Self {
        self.pages.insert((repository.clone(), kind), pages);
        self
    }

    fn observe(&self, engine: &SyncEngine<Arc<ScriptedSource>>) {
        *self.observer.lock().unwrap() = Some(engine.subscribe());
    }

    fn push_update(&self, issue: Issue) {
        self.remote_updates.lock().unwrap().push(issue);
    }

    fn fetches(&self) -> Vec<Vec<PageRequest>> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssueSource for ScriptedSource {
    async fn fetch_pages(&self, requests: &[PageRequest]) -> Result<Vec<Page>, SyncError> {
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            self.states_at_fetch.lock().unwrap().push(observer.borrow().clone());
        }
        let call = {
            let mut fetches = self.fetches.lock().unwrap();
            fetches.push(requests.to_vec());
            fetches.len()
        };

        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail_fetch_number == Some(call) {
            return Err(SyncError::TransientNetwork("connection reset".into()));
        }

        Ok(requests
            .iter()
            .map(|request| {
                let pages = self
                    .pages
                    .get(&(request.repository.clone(), request.kind))
                    .cloned()
                    .unwrap_or_default();
                let index: usize = request.after.as_deref().map_or(0, |t| t.parse().unwrap());
                let has_next_page = index + 1 < pages.len();

                Page {
                    repository: request.repository.clone(),
                    kind: request.kind,
                    issues: pages.get(index).cloned().unwrap_or_default(),
                    page_info: PageInfo {
                        end_cursor: has_next_page.then(|| (index + 1).to_string()),
                        has_next_page,
                    },
                }
            })
            .collect())
    }

    async fn search_updated(
        &self,
        kind: IssueKind,
        since: DateTime<Utc>,
        repositories: &[Repository],
    ) -> Result<Vec<Issue>, SyncError> {
        self.searches
            .lock()
            .unwrap()
            .push((kind, since, repositories.to_vec()));

        {
            let mut failures = self.search_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SyncError::TransientNetwork("search timed out".into()));
            }
        }

        Ok(self
            .remote_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.kind == kind && i.updated_at > since && repositories.contains(&i.repository))
            .cloned()
            .collect())
    }
}

fn engine(
    source: &Arc<ScriptedSource>,
    repos: Vec<Repository>,
    settings: SyncSettings,
) -> (Arc<IssueCache>, SyncEngine<Arc<ScriptedSource>>) {
    let cache = Arc::new(IssueCache::new());
    let engine = SyncEngine::new(Arc::clone(source), Arc::clone(&cache), repos, settings);
    source.observe(&engine);
    (cache, engine)
}

fn batch_settings(repos_per_query: usize) -> SyncSettings {
    SyncSettings {
        repos_per_query,
        ..SyncSettings::default()
    }
}

fn three_repo_source() -> (Vec<Repository>, ScriptedSource) {
    let (a, b, c) = (repo("gz-sim"), repo("gz-math"), repo("sdformat"));
    let source = ScriptedSource::default()
        .with_pages(
            &a,
            IssueKind::Issue,
            vec![
                vec![issue(&a, IssueKind::Issue, 1, 15), issue(&a, IssueKind::Issue, 2, 14)],
                vec![issue(&a, IssueKind::Issue, 3, 13)],
            ],
        )
        .with_pages(&a, IssueKind::PullRequest, vec![vec![issue(&a, IssueKind::PullRequest, 4, 16)]])
        .with_pages(&b, IssueKind::Issue, vec![vec![issue(&b, IssueKind::Issue, 1, 12)]])
        .with_pages(
            &b,
            IssueKind::PullRequest,
            vec![
                vec![issue(&b, IssueKind::PullRequest, 2, 17)],
                vec![issue(&b, IssueKind::PullRequest, 3, 11)],
                vec![issue(&b, IssueKind::PullRequest, 4, 10)],
            ],
        );
    (vec![a, b, c], source)
}

#[tokio::test]
async fn test_bulk_load_walks_every_cursor() {
    let (repos, source) = three_repo_source();
    let source = Arc::new(source);
    let (cache, mut engine) = engine(&source, repos.clone(), batch_settings(2));

    engine.bulk_load(&CancellationToken::new()).await.unwrap();

    let fetches = source.fetches();
    assert_eq!(fetches.len(), 3);

    // First round: the first two repositories, both collections, no cursors
    assert_eq!(fetches[0].len(), 4);
    assert!(fetches[0].iter().all(|r| r.after.is_none() && r.repository != repos[2]));

    // Second round: only the collections with more pages, resumed from their cursor
    assert_eq!(
        fetches[1],
        vec![
            PageRequest { repository: repos[0].clone(), kind: IssueKind::Issue, after: Some("1".into()) },
            PageRequest { repository: repos[1].clone(), kind: IssueKind::PullRequest, after: Some("1".into()) },
        ]
    );

    // Third round: the last open cursor plus the untouched repository
    assert_eq!(fetches[2].len(), 3);
    assert_eq!(fetches[2][0].after.as_deref(), Some("2"));
    assert!(fetches[2][1..].iter().all(|r| r.repository == repos[2] && r.after.is_none()));

    assert_eq!(cache.len(), 8);
    let newest: Vec<u64> = cache.most_recent_issues(2).iter().map(|i| i.number).collect();
    assert_eq!(newest, vec![2, 4]);
    assert_eq!(cache.newest_update_time(), Some(at(17)));

    assert_eq!(engine.state(), SyncState::Loading { progress: 1.0 });
    assert_eq!(
        *source.states_at_fetch.lock().unwrap(),
        vec![
            SyncState::Loading { progress: 0.0 },
            SyncState::Loading { progress: 2.0 / 6.0 },
            SyncState::Loading { progress: 3.0 / 6.0 },
        ]
    );
}

#[tokio::test]
async fn test_bulk_load_failure_is_surfaced() {
    let (repos, mut source) = three_repo_source();
    source.fail_fetch_number = Some(2);
    let source = Arc::new(source);
    let (cache, engine) = engine(&source, repos, batch_settings(2));

    let mut handle = engine.spawn();
    let err = handle.wait_until_polling().await.unwrap_err();
    assert_eq!(err, SyncError::TransientNetwork("connection reset".into()));
    assert_eq!(handle.state(), SyncState::Failed(err.clone()));
    assert_eq!(handle.join().await, Err(err));

    // Items from the first response were kept; no polling was attempted
    assert_eq!(cache.len(), 5);
    assert!(source.searches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_repeated_repositories_are_loaded_once() {
    let a = repo("gz-sim");
    let source = Arc::new(ScriptedSource::default().with_pages(
        &a,
        IssueKind::Issue,
        vec![vec![issue(&a, IssueKind::Issue, 1, 15)]],
    ));
    let (cache, mut engine) = engine(&source, vec![a.clone(), a.clone()], SyncSettings::default());

    engine.bulk_load(&CancellationToken::new()).await.unwrap();

    let fetches = source.fetches();
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0].len(), 2);
    assert_eq!(cache.len(), 1);

    engine.poll_once().await.unwrap();
    let searches = source.searches.lock().unwrap().clone();
    assert!(searches.iter().all(|(_, _, searched)| *searched == vec![a.clone()]));
}

#[tokio::test]
async fn test_missing_page_is_a_protocol_error() {
    struct ForgetfulSource;

    #[async_trait]
    impl IssueSource for ForgetfulSource {
        async fn fetch_pages(&self, _: &[PageRequest]) -> Result<Vec<Page>, SyncError> {
            Ok(Vec::new())
        }

        async fn search_updated(
            &self,
            _: IssueKind,
            _: DateTime<Utc>,
            _: &[Repository],
        ) -> Result<Vec<Issue>, SyncError> {
            Ok(Vec::new())
        }
    }

    let cache = Arc::new(IssueCache::new());
    let mut engine = SyncEngine::new(ForgetfulSource, cache, vec![repo("gz-sim")], SyncSettings::default());

    let err = engine.bulk_load(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol(_)));
    assert!(matches!(engine.state(), SyncState::Failed(SyncError::Protocol(_))));
}

#[tokio::test]
async fn test_invalid_records_are_skipped() {
    let a = repo("gz-sim");
    let mut broken = issue(&a, IssueKind::Issue, 0, 15);
    broken.title = "no number".into();
    let source = Arc::new(ScriptedSource::default().with_pages(
        &a,
        IssueKind::Issue,
        vec![vec![broken, issue(&a, IssueKind::Issue, 7, 14)]],
    ));
    let (cache, mut engine) = engine(&source, vec![a], SyncSettings::default());

    engine.bulk_load(&CancellationToken::new()).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.most_recent_issues(1)[0].number, 7);
}

#[tokio::test]
async fn test_empty_repository_list() {
    let source = Arc::new(ScriptedSource::default());
    let (cache, mut engine) = engine(&source, Vec::new(), SyncSettings::default());

    engine.bulk_load(&CancellationToken::new()).await.unwrap();
    assert_eq!(engine.state(), SyncState::Loading { progress: 1.0 });
    assert!(source.fetches().is_empty());

    assert_eq!(engine.poll_once().await.unwrap(), 0);
    assert!(source.searches.lock().unwrap().is_empty());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_poll_once_searches_both_kinds_since_newest() {
    let (repos, source) = three_repo_source();
    let source = Arc::new(source);
    let (cache, mut engine) = engine(&source, repos.clone(), SyncSettings::default());
    engine.bulk_load(&CancellationToken::new()).await.unwrap();

    let fresh_issue = issue(&repos[2], IssueKind::Issue, 9, 18);
    let fresh_pull = issue(&repos[0], IssueKind::PullRequest, 4, 19);
    source.push_update(fresh_issue.clone());
    source.push_update(fresh_pull.clone());
    source.push_update(issue(&repos[1], IssueKind::Issue, 1, 16));

    assert_eq!(engine.poll_once().await.unwrap(), 2);

    let searches = source.searches.lock().unwrap().clone();
    assert_eq!(searches.len(), 2);
    assert_eq!(searches[0].0, IssueKind::Issue);
    assert_eq!(searches[1].0, IssueKind::PullRequest);
    assert!(searches.iter().all(|(_, since, searched)| *since == at(17) && *searched == repos));

    assert_eq!(cache.most_recent_issues(2), vec![fresh_pull, fresh_issue]);
    assert_eq!(cache.len(), 9);
}

#[tokio::test]
async fn test_poll_splits_repositories_across_searches() {
    let repos: Vec<Repository> = (0..5).map(|i| repo(&format!("gz-repo{i}"))).collect();
    let source = Arc::new(ScriptedSource::default());
    let settings = SyncSettings {
        search_repos_per_query: 2,
        ..SyncSettings::default()
    };
    let (_cache, mut engine) = engine(&source, repos.clone(), settings);
    engine.bulk_load(&CancellationToken::new()).await.unwrap();

    engine.poll_once().await.unwrap();

    let searches = source.searches.lock().unwrap().clone();
    assert_eq!(searches.len(), 6);
    let sizes: Vec<usize> = searches.iter().map(|(_, _, r)| r.len()).collect();
    assert_eq!(sizes, vec![2, 2, 1, 2, 2, 1]);
}

#[tokio::test]
async fn test_poll_resurfaces_dismissed_issue() {
    let a = repo("gz-sim");
    let original = issue(&a, IssueKind::Issue, 5, 15);
    let source = Arc::new(
        ScriptedSource::default().with_pages(&a, IssueKind::Issue, vec![vec![original.clone()]]),
    );
    let (cache, mut engine) = engine(&source, vec![a], SyncSettings::default());
    engine.bulk_load(&CancellationToken::new()).await.unwrap();

    cache.dismiss(&original);
    assert!(cache.most_recent_issues(1).is_empty());

    let mut reopened = original.clone();
    reopened.updated_at = at(16);
    source.push_update(reopened.clone());
    engine.poll_once().await.unwrap();

    assert_eq!(cache.most_recent_issues(1), vec![reopened]);
}

#[tokio::test(start_paused = true)]
async fn test_poll_failures_do_not_stop_the_engine() {
    let (repos, source) = three_repo_source();
    *source.search_failures.lock().unwrap() = 2;
    let source = Arc::new(source);
    let (cache, engine) = engine(&source, repos.clone(), SyncSettings::default());

    let mut handle = engine.spawn();
    assert_eq!(handle.wait_until_polling().await.unwrap(), SyncState::Polling);

    let late = issue(&repos[1], IssueKind::PullRequest, 40, 20);
    source.push_update(late.clone());

    // Two failed polls back off to 30s and 60s; the third poll lands at 105s
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(cache.get(&late.key()).is_none());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cache.most_recent_issues(1), vec![late]);
    assert_eq!(handle.state(), SyncState::Polling);

    let mut states = handle.subscribe();
    handle.shutdown().await.unwrap();
    assert_eq!(*states.borrow_and_update(), SyncState::Stopped);
}

#[tokio::test]
async fn test_cancel_during_bulk_load() {
    let (repos, mut source) = three_repo_source();
    source.hang = true;
    let source = Arc::new(source);
    let (cache, engine) = engine(&source, repos, SyncSettings::default());

    let handle = engine.spawn();
    let mut states = handle.subscribe();
    states
        .wait_for(|s| matches!(s, SyncState::Loading { .. }))
        .await
        .unwrap();
    while source.fetches().is_empty() {
        tokio::task::yield_now().await;
    }

    handle.cancel();
    let mut states = handle.subscribe();
    handle.join().await.unwrap();

    assert_eq!(*states.borrow_and_update(), SyncState::Stopped);
    assert!(cache.is_empty());
}
