use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

use crate::error::SyncError;
use crate::types::{Issue, IssueKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Partition {
    Upcoming,
    Dismissed,
}

#[derive(Debug)]
struct Entry {
    issue: Issue,
    partition: Partition,
    /// Arrival order into `upcoming`; breaks ties between equal timestamps
    arrival: u64,
}

#[derive(Debug, Default)]
struct Partitions {
    entries: HashMap<IssueKey, Entry>,
    next_arrival: u64,
}

/// Hand out the next arrival number
fn take_arrival(next_arrival: &mut u64) -> u64 {
    let arrival = *next_arrival;
    *next_arrival += 1;
    arrival
}

/// Merge store for remote updates and local dismiss state.
///
/// Every item lives in exactly one of two partitions: `upcoming` (eligible
/// for display) or `dismissed`. Each public method takes the lock once and
/// releases it before returning, so the cache can be shared between the
/// sync worker and any number of readers.
#[derive(Debug, Default)]
pub struct IssueCache {
    inner: Mutex<Partitions>,
}

impl IssueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Partitions> {
        // A panicking reader cannot leave the map half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an issue into the cache.
    ///
    /// Ignored when the cache already holds the same or newer data for the
    /// item. A newer unread update to a dismissed item brings it back into
    /// `upcoming`; a newer read update refreshes it in place and keeps it
    /// hidden.
    pub fn insert(&self, issue: Issue) -> Result<(), SyncError> {
        issue.validate()?;
        let key = issue.key();

        let mut guard = self.lock();
        let parts = &mut *guard;

        match parts.entries.get_mut(&key) {
            Some(entry) if issue.updated_at <= entry.issue.updated_at => {
                trace!(issue = %key, "ignoring stale update");
            }
            Some(entry) if entry.partition == Partition::Dismissed => {
                if issue.is_read {
                    entry.issue = issue;
                } else {
                    trace!(issue = %key, "resurfacing dismissed issue");
                    entry.issue = issue;
                    entry.partition = Partition::Upcoming;
                    entry.arrival = take_arrival(&mut parts.next_arrival);
                }
            }
            Some(entry) => {
                entry.issue = issue;
            }
            None => {
                let arrival = take_arrival(&mut parts.next_arrival);
                parts.entries.insert(
                    key,
                    Entry {
                        issue,
                        partition: Partition::Upcoming,
                        arrival,
                    },
                );
            }
        }
        Ok(())
    }

    /// Hide an issue from [`most_recent_issues`](Self::most_recent_issues).
    ///
    /// Unknown issues are ignored; no tombstone is recorded for them.
    pub fn dismiss(&self, issue: &Issue) {
        let key = issue.key();
        if let Some(entry) = self.lock().entries.get_mut(&key) {
            entry.partition = Partition::Dismissed;
        }
    }

    /// The `n` most recently updated issues that are not dismissed, newest
    /// first. Equal timestamps keep their arrival order.
    pub fn most_recent_issues(&self, n: usize) -> Vec<Issue> {
        let guard = self.lock();
        let mut upcoming: Vec<&Entry> = guard
            .entries
            .values()
            .filter(|e| e.partition == Partition::Upcoming)
            .collect();
        upcoming.sort_by_key(|e| (Reverse(e.issue.updated_at), e.arrival));
        upcoming
            .into_iter()
            .take(n)
            .map(|e| e.issue.clone())
            .collect()
    }

    /// Latest `updated_at` across both partitions
    pub fn newest_update_time(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .entries
            .values()
            .map(|e| e.issue.updated_at)
            .max()
    }

    pub fn get(&self, key: &IssueKey) -> Option<Issue> {
        self.lock().entries.get(key).map(|e| e.issue.clone())
    }

    pub fn is_dismissed(&self, key: &IssueKey) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| e.partition == Partition::Dismissed)
    }

    pub fn pending_count(&self) -> usize {
        self.count(Partition::Upcoming)
    }

    pub fn dismissed_count(&self) -> usize {
        self.count(Partition::Dismissed)
    }

    fn count(&self, partition: Partition) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.partition == partition)
            .count()
    }

    /// Number of known issues, dismissed or not
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
