use thiserror::Error;

/// Failures raised while mirroring remote issues into the cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A record with a malformed identity. Only that record is rejected.
    #[error("invalid issue record: {0}")]
    Validation(String),

    /// The request failed in a way that may succeed when retried
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote refused the request, e.g. a revoked credential
    #[error("remote API rejected the request: {0}")]
    FatalApi(String),

    /// The response did not have the expected shape
    #[error("unexpected response from remote: {0}")]
    Protocol(String),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    /// Whether the upstream credential needs to be renewed
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, SyncError::FatalApi(_))
    }
}

impl SyncError {
    /// Classify a non-success HTTP reply by its status alone
    pub fn from_status(status: u16, message: &str) -> Self {
        let message = format!("GitHub responded {status}: {message}");
        match status {
            429 | 500..=599 => SyncError::TransientNetwork(message),
            _ => SyncError::FatalApi(message),
        }
    }
}

impl From<octocrab::Error> for SyncError {
    fn from(err: octocrab::Error) -> Self {
        match &err {
            octocrab::Error::GitHub { source, .. } => {
                SyncError::from_status(source.status_code.as_u16(), &source.message)
            }
            octocrab::Error::Serde { .. } | octocrab::Error::Json { .. } => {
                SyncError::Protocol(describe(&err))
            }
            _ => SyncError::TransientNetwork(describe(&err)),
        }
    }
}

/// Message of the underlying cause. octocrab appends a backtrace to its own
/// `Display` output, so the wrapper text is only used as a last resort.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    match err.source() {
        Some(source) => source.to_string(),
        None => err.to_string().lines().next().unwrap_or_default().to_string(),
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
