//! Git sync: mirror branches from the bare staging repo to a real
//! upstream remote, gated by the same rules/mode/queue pipeline used
//! everywhere else. Unlike exec/packages, `git` is not hardened, so a
//! category mode of `allow-all` can skip the queue entirely.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mediator_config::ConfigStore;
use mediator_protocol::Category;
use mediator_protocol::CategoryMode;
use mediator_protocol::Metadata;
use mediator_queue::PermissionQueue;
use mediator_rules::Decision;
use mediator_rules::evaluate;
use serde::Serialize;
use thiserror::Error;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);
const REAL_REMOTE: &str = "real-remote";

#[derive(Debug, Error)]
pub enum GitSyncError {
    #[error("git exited with status {0}: {1}")]
    CommandFailed(i32, String),
    #[error("git failed to spawn: {0}")]
    SpawnFailed(String),
}

/// A branch in the staging repo and its diff against the matching branch
/// on `real-remote`. `diffstat` is `None` when the upstream branch does
/// not exist yet, surfaced to the operator as "new branch".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchDiff {
    pub branch: String,
    pub diffstat: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitSyncOutcome {
    Denied,
    Pushed,
}

pub struct GitSync {
    staging_repo: PathBuf,
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
}

impl GitSync {
    pub fn new(staging_repo: impl Into<PathBuf>, config: Arc<ConfigStore>, queue: Arc<PermissionQueue>) -> Self {
        GitSync {
            staging_repo: staging_repo.into(),
            config,
            queue,
        }
    }

    async fn git(&self, args: &str) -> mediator_exec::RunOutput {
        mediator_exec::run_shell(
            &format!("git -C {} {args}", shell_quote(&self.staging_repo.display().to_string())),
            None,
            GIT_TIMEOUT,
        )
        .await
    }

    /// Enumerate local branches in the staging repo and their diffstat
    /// against `real-remote/<branch>`.
    pub async fn list_branch_diffs(&self) -> Result<Vec<BranchDiff>, GitSyncError> {
        let branches_out = self
            .git("for-each-ref refs/heads --format=%(refname:short)")
            .await;
        if branches_out.spawn_failed {
            return Err(GitSyncError::SpawnFailed(branches_out.stderr));
        }
        if branches_out.exit_code != 0 {
            return Err(GitSyncError::CommandFailed(
                branches_out.exit_code,
                branches_out.stderr,
            ));
        }

        let mut diffs = Vec::new();
        for branch in branches_out.stdout.lines().map(str::trim).filter(|b| !b.is_empty()) {
            let remote_ref = format!("{REAL_REMOTE}/{branch}");
            let exists = self
                .git(&format!("rev-parse --verify {}", shell_quote(&remote_ref)))
                .await
                .exit_code
                == 0;

            let diffstat = if exists {
                let stat = self
                    .git(&format!(
                        "diff --stat {}..{}",
                        shell_quote(&remote_ref),
                        shell_quote(branch)
                    ))
                    .await;
                Some(stat.stdout)
            } else {
                None
            };

            diffs.push(BranchDiff {
                branch: branch.to_string(),
                diffstat,
            });
        }
        Ok(diffs)
    }

    /// Rules -> mode -> queue pipeline, identical in shape to the file
    /// sync and exec/package brokers: a deny rule short-circuits to
    /// `Denied`; an allow rule or `allow-all` mode pushes immediately;
    /// otherwise a permission request is enqueued and the push happens
    /// only on approval.
    pub async fn request_git_sync(&self, branch: &str) -> GitSyncOutcome {
        let ruleset = self.config.rules();
        match evaluate(&ruleset, Category::Git, branch) {
            Some(Decision::Deny) => GitSyncOutcome::Denied,
            Some(Decision::Allow) => {
                self.push(branch).await;
                GitSyncOutcome::Pushed
            }
            None => {
                if self.config.get_category_mode(Category::Git) == CategoryMode::AllowAll {
                    self.push(branch).await;
                    return GitSyncOutcome::Pushed;
                }

                let mut metadata = Metadata::new();
                metadata.insert("branch".to_string(), serde_json::json!(branch));
                let (_id, waiter) = self.queue.request(
                    Category::Git,
                    format!("push {branch}"),
                    format!("Push {branch} to {REAL_REMOTE}"),
                    None,
                    metadata,
                );
                if waiter.wait().await {
                    self.push(branch).await;
                    GitSyncOutcome::Pushed
                } else {
                    GitSyncOutcome::Denied
                }
            }
        }
    }

    async fn push(&self, branch: &str) {
        let result = self
            .git(&format!("push {REAL_REMOTE} {}", shell_quote(branch)))
            .await;
        if result.exit_code != 0 {
            tracing::warn!(branch, exit_code = result.exit_code, stderr = %result.stderr, "git push failed");
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_config::ConfigStore;
    use mediator_config::RuleKind;
    use mediator_queue::AuditLog;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn git_sync(repo: PathBuf) -> GitSync {
        let audit = AuditLog::new(repo.join("audit.log"));
        let queue = Arc::new(PermissionQueue::new(repo.join("queue.json"), audit));
        let config = Arc::new(ConfigStore::load(
            repo.join("sandbox.config.json"),
            repo.to_string_lossy().to_string(),
        ));
        GitSync::new(repo, config, queue)
    }

    #[tokio::test]
    async fn denied_branch_is_never_pushed() {
        let dir = tempdir().unwrap();
        let sync = git_sync(dir.path().to_path_buf());
        sync.config.add_rule(RuleKind::Deny, "git(experimental)");
        let outcome = sync.request_git_sync("experimental").await;
        assert_eq!(outcome, GitSyncOutcome::Denied);
    }

    #[tokio::test]
    async fn unmatched_branch_queues_for_approval() {
        let dir = tempdir().unwrap();
        let sync = git_sync(dir.path().to_path_buf());
        let queue = Arc::clone(&sync.queue);

        let handle = tokio::spawn(async move { sync.request_git_sync("feature/x").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        queue.deny(&pending[0].id, None);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, GitSyncOutcome::Denied);
    }
}
