pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod parser;
pub mod repos;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use cache::IssueCache;
pub use error::SyncError;
pub use sync::{SyncEngine, SyncHandle, SyncSettings, SyncState};
pub use types::{Issue, IssueKind, Repository};
