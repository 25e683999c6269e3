//! Workspace-to-host file mirroring, approve-on-apply edit application,
//! per-file sync requests, and staging-to-upstream git sync.

mod edits;
mod file_sync;
mod git;
mod mirror;

pub use edits::ApplyError;
pub use edits::apply_filesystem_request;
pub use file_sync::FileSyncBroker;
pub use file_sync::SyncFile;
pub use git::BranchDiff;
pub use git::GitSync;
pub use git::GitSyncError;
pub use git::GitSyncOutcome;
pub use mirror::LiveMirror;
pub use mirror::SyncError;
