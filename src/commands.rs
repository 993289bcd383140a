use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

use treadi::backend::github::GitHubSource;
use treadi::cache::IssueCache;
use treadi::repos::RepoSource;
use treadi::sync::{SyncEngine, SyncHandle, SyncSettings, SyncState};
use treadi::types::{Issue, IssueKind};

fn connect(token: &str, settings: &SyncSettings) -> Result<GitHubSource> {
    Ok(GitHubSource::new(token)?
        .with_page_size(settings.page_size)
        .with_retries(settings.request_retries, settings.retry_backoff()))
}

/// Execute the repos command
pub async fn repos(source: &RepoSource, token: &str) -> Result<()> {
    let github = GitHubSource::new(token)?;
    let repos = source.load(&github).await?;

    for repo in &repos {
        println!("{repo}");
    }
    println!("\nTotal: {} repositories", repos.len());
    Ok(())
}

/// Execute the feed command
pub async fn feed(source: &RepoSource, token: &str, settings: &SyncSettings, count: usize) -> Result<()> {
    let (cache, mut handle) = start(source, token, settings).await?;
    wait_for_bulk_load(&mut handle).await?;

    print_feed(&cache.most_recent_issues(count));
    handle.shutdown().await?;
    Ok(())
}

/// Execute the watch command.
///
/// Typing the position of a listed issue dismisses it.
pub async fn watch(source: &RepoSource, token: &str, settings: &SyncSettings, count: usize) -> Result<()> {
    let (cache, mut handle) = start(source, token, settings).await?;
    wait_for_bulk_load(&mut handle).await?;

    let stdin = BufReader::new(tokio::io::stdin());
    follow(&cache, count, stdin, tokio::signal::ctrl_c()).await?;

    handle.shutdown().await?;
    Ok(())
}

/// Reprint the feed whenever it changes until `shutdown` resolves
async fn follow<R, F>(cache: &IssueCache, count: usize, input: R, shutdown: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = io::Result<()>>,
{
    let mut shown = cache.most_recent_issues(count);
    let mut newest = cache.newest_update_time();
    print_feed(&shown);

    // Registered once so a signal between iterations is not lost
    tokio::pin!(shutdown);
    let mut lines = input.lines();
    let mut input_open = true;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line(), if input_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    input_open = false;
                    continue;
                };
                match line.trim().parse::<usize>() {
                    Ok(position) if (1..=shown.len()).contains(&position) => {
                        cache.dismiss(&shown[position - 1]);
                    }
                    _ => {
                        eprintln!("Type the position of an issue (1-{}) to dismiss it", shown.len());
                        continue;
                    }
                }
            }
            _ = ticker.tick() => {
                if cache.newest_update_time() == newest {
                    continue;
                }
            }
        }

        newest = cache.newest_update_time();
        shown = cache.most_recent_issues(count);
        print_feed(&shown);
    }

    Ok(())
}

async fn start(
    source: &RepoSource,
    token: &str,
    settings: &SyncSettings,
) -> Result<(Arc<IssueCache>, SyncHandle)> {
    let github = connect(token, settings)?;
    let repos = source.load(&github).await?;

    let cache = Arc::new(IssueCache::new());
    let engine = SyncEngine::new(github, Arc::clone(&cache), repos, settings.clone());
    Ok((cache, engine.spawn()))
}

/// Show a progress bar until the engine has finished its bulk load
async fn wait_for_bulk_load(handle: &mut SyncHandle) -> Result<()> {
    let bar = ProgressBar::new(100).with_message("Loading issues");
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos}%")
            .context("Invalid progress bar template")?
            .progress_chars("=> "),
    );

    let mut states = handle.subscribe();
    let updater = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let SyncState::Loading { progress } = *states.borrow_and_update() else {
                    break;
                };
                bar.set_position((progress * 100.0).round() as u64);
            }
        })
    };

    let outcome = handle.wait_until_polling().await;
    updater.abort();

    match outcome {
        Ok(_) => {
            bar.finish_and_clear();
            Ok(())
        }
        Err(err) => {
            bar.abandon_with_message("Loading failed");
            Err(err).context("Failed to load issues")
        }
    }
}

fn print_feed(issues: &[Issue]) {
    println!("\n=== Most recently updated ({}) ===", issues.len());

    for (position, issue) in issues.iter().enumerate() {
        let kind = match issue.kind {
            IssueKind::Issue => "issue",
            IssueKind::PullRequest => "pr",
        };
        let unread = if issue.is_read { ' ' } else { '*' };
        println!(
            "{:>3}.{} [{}] {}#{} {}",
            position + 1,
            unread,
            kind,
            issue.repository,
            issue.number,
            issue.title
        );
        println!(
            "       by {} updated {}  {}",
            issue.author,
            issue.updated_at.format("%Y-%m-%d %H:%M"),
            issue.url
        );
    }
}
