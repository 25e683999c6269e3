//! Per-file sync requests: an agent (or the control plane, on behalf of
//! the operator) can ask for a specific set of files to be mirrored
//! immediately rather than waiting on the live watcher, subject to the
//! same rules/mode/queue pipeline every other mediated category uses.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use mediator_config::ConfigStore;
use mediator_protocol::Category;
use mediator_protocol::CategoryMode;
use mediator_protocol::Metadata;
use mediator_queue::PermissionQueue;
use mediator_rules::Decision;
use mediator_rules::evaluate;
use serde::Serialize;

const SKIP_DIRS: [&str; 2] = [".git", "node_modules"];

/// A file under the workspace root and whether its host-side mirror copy
/// currently matches it (by length; the live watcher is what keeps them
/// byte-identical, this is just an at-a-glance staleness signal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFile {
    pub path: String,
    pub synced: bool,
}

pub struct FileSyncBroker {
    src: PathBuf,
    dst: PathBuf,
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
}

impl FileSyncBroker {
    pub fn new(
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
        config: Arc<ConfigStore>,
        queue: Arc<PermissionQueue>,
    ) -> Self {
        FileSyncBroker {
            src: src.into(),
            dst: dst.into(),
            config,
            queue,
        }
    }

    /// Decide and act on each requested path independently; a deny for one
    /// file never affects the others. Returns whether each path was copied.
    pub async fn request_file_sync(&self, files: Vec<String>) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for file in files {
            let copied = self.sync_one(&file).await;
            results.insert(file, copied);
        }
        results
    }

    async fn sync_one(&self, file: &str) -> bool {
        let ruleset = self.config.rules();
        match evaluate(&ruleset, Category::Filesystem, file) {
            Some(Decision::Deny) => false,
            Some(Decision::Allow) => {
                self.copy_file(file).await;
                true
            }
            None => {
                if self.config.get_category_mode(Category::Filesystem) == CategoryMode::AllowAll {
                    self.copy_file(file).await;
                    return true;
                }

                let mut metadata = Metadata::new();
                metadata.insert("targetFile".to_string(), serde_json::json!(file));
                let (_id, waiter) = self.queue.request(
                    Category::Filesystem,
                    format!("sync {file}"),
                    format!("Sync {file} to host"),
                    None,
                    metadata,
                );
                if waiter.wait().await {
                    self.copy_file(file).await;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Walk the workspace tree and report, for each file, whether the
    /// host-side mirror copy matches it in size.
    pub async fn list_files(&self) -> Vec<SyncFile> {
        let mut out = Vec::new();
        self.walk(&self.src, &mut out).await;
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn walk<'a>(
        &'a self,
        dir: &'a Path,
        out: &'a mut Vec<SyncFile>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + 'a>> {
        Box::pin(async move {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                return;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if file_type.is_dir() {
                    if SKIP_DIRS.contains(&name.as_ref()) {
                        continue;
                    }
                    self.walk(&path, out).await;
                } else if file_type.is_file() {
                    let Ok(rel) = path.strip_prefix(&self.src) else {
                        continue;
                    };
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    let synced = self.matches_mirror(&rel).await;
                    out.push(SyncFile { path: rel, synced });
                }
            }
        })
    }

    async fn matches_mirror(&self, file: &str) -> bool {
        let src_len = tokio::fs::metadata(self.src.join(file)).await.map(|m| m.len());
        let dst_len = tokio::fs::metadata(self.dst.join(file)).await.map(|m| m.len());
        matches!((src_len, dst_len), (Ok(a), Ok(b)) if a == b)
    }

    async fn copy_file(&self, file: &str) {
        let src_path = self.src.join(file);
        let dst_path = self.dst.join(file);
        if let Some(parent) = dst_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::copy(&src_path, &dst_path).await {
            tracing::warn!(path = %Path::new(file).display(), error = %err, "file sync copy failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_config::ConfigStore;
    use mediator_config::RuleKind;
    use mediator_protocol::ResolvedBy;
    use mediator_queue::AuditLog;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn broker() -> (tempfile::TempDir, tempfile::TempDir, FileSyncBroker) {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let audit = AuditLog::new(src_dir.path().join("audit.log"));
        let queue = Arc::new(PermissionQueue::new(src_dir.path().join("queue.json"), audit));
        let config = Arc::new(ConfigStore::load(
            src_dir.path().join("sandbox.config.json"),
            dst_dir.path().to_string_lossy().to_string(),
        ));
        let broker = FileSyncBroker::new(src_dir.path(), dst_dir.path(), config, queue);
        (src_dir, dst_dir, broker)
    }

    #[tokio::test]
    async fn denied_file_is_not_copied() {
        let (src_dir, dst_dir, broker) = broker();
        tokio::fs::write(src_dir.path().join("secret.env"), "TOKEN=abc").await.unwrap();
        broker.config.add_rule(RuleKind::Deny, "filesystem(secret.env)");

        let results = broker.request_file_sync(vec!["secret.env".to_string()]).await;
        assert_eq!(results.get("secret.env"), Some(&false));
        assert!(!dst_dir.path().join("secret.env").exists());
    }

    #[tokio::test]
    async fn allowed_file_is_copied_immediately() {
        let (src_dir, dst_dir, broker) = broker();
        tokio::fs::write(src_dir.path().join("app.ts"), "export const x = 1;").await.unwrap();
        broker.config.add_rule(RuleKind::Allow, "filesystem(app.ts)");

        let results = broker.request_file_sync(vec!["app.ts".to_string()]).await;
        assert_eq!(results.get("app.ts"), Some(&true));
        assert_eq!(
            tokio::fs::read_to_string(dst_dir.path().join("app.ts")).await.unwrap(),
            "export const x = 1;"
        );
    }

    #[tokio::test]
    async fn unmatched_file_under_allow_all_mode_is_copied() {
        let (src_dir, dst_dir, broker) = broker();
        tokio::fs::write(src_dir.path().join("b.ts"), "export const y = 2;").await.unwrap();
        broker
            .config
            .set_category_mode(Category::Filesystem, CategoryMode::AllowAll);

        let results = broker.request_file_sync(vec!["b.ts".to_string()]).await;
        assert_eq!(results.get("b.ts"), Some(&true));
        assert!(dst_dir.path().join("b.ts").exists());
    }

    #[tokio::test]
    async fn unmatched_file_queues_and_waits_for_approval() {
        let (src_dir, dst_dir, broker) = broker();
        tokio::fs::write(src_dir.path().join("c.ts"), "export const z = 3;").await.unwrap();

        let queue = Arc::clone(&broker.queue);
        let handle = tokio::spawn(async move { broker.request_file_sync(vec!["c.ts".to_string()]).await });

        // Give the request a moment to land in the queue before approving.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        queue.approve(&pending[0].id, Some(ResolvedBy::Web));

        let results = handle.await.unwrap();
        assert_eq!(results.get("c.ts"), Some(&true));
        assert!(dst_dir.path().join("c.ts").exists());
    }
}
