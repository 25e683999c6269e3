//! Live mirror: keep a host-visible copy of the workspace in sync with
//! the agent's view of it. A recursive file watcher collects changed
//! paths into a dedup set and flushes the batch after 300ms of quiet,
//! the same debounce shape the permission queue uses for its own
//! persistence writes.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use thiserror::Error;
use tokio::sync::mpsc;

const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(300);
const SKIP_SEGMENTS: [&str; 2] = [".git", "node_modules"];

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rsync exited with status {0}: {1}")]
    RsyncFailed(i32, String),
    #[error("rsync failed to spawn: {0}")]
    SpawnFailed(String),
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn is_skipped(path: &Path) -> bool {
    path.components().any(|c| {
        let s = c.as_os_str().to_string_lossy();
        SKIP_SEGMENTS.contains(&s.as_ref())
    })
}

pub struct LiveMirror {
    src: PathBuf,
    dst: PathBuf,
}

impl LiveMirror {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        LiveMirror {
            src: src.into(),
            dst: dst.into(),
        }
    }

    /// Poll every 2s until `.git/HEAD` exists in the source tree, which is
    /// the signal the workspace has been checked out and is ready to mirror.
    pub async fn wait_for_readiness(&self) {
        let marker = self.src.join(".git").join("HEAD");
        while !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    /// `rsync -a --delete --exclude .git --exclude node_modules SRC/ DST/`.
    /// Excludes are non-negotiable: the staging git metadata and installed
    /// dependencies never belong in the host-visible mirror.
    pub async fn full_sync(&self) -> Result<usize, SyncError> {
        tokio::fs::create_dir_all(&self.dst)
            .await
            .map_err(|source| SyncError::Copy {
                path: self.dst.clone(),
                source,
            })?;

        let src = format!("{}/", self.src.display());
        let dst = format!("{}/", self.dst.display());
        let output = mediator_exec::run_shell(
            &format!(
                "rsync -a --delete --exclude .git --exclude node_modules {} {}",
                shell_quote(&src),
                shell_quote(&dst)
            ),
            None,
            Duration::from_secs(300),
        )
        .await;

        if output.spawn_failed {
            return Err(SyncError::SpawnFailed(output.stderr));
        }
        if output.exit_code != 0 {
            return Err(SyncError::RsyncFailed(output.exit_code, output.stderr));
        }

        Ok(count_entries(&self.dst).await)
    }

    /// Attach a recursive watcher over `src` and run the debounce/flush
    /// loop until `stop` fires. Intended to be driven from a dedicated
    /// background task for the lifetime of the server process.
    pub async fn watch_until(&self, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let watch_root = self.src.clone();

        let watcher = tokio::task::spawn_blocking(move || {
            let handler = move |event: notify::Result<Event>| {
                let Ok(event) = event else {
                    return;
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(path);
                }
            };
            let mut watcher: RecommendedWatcher = match notify::recommended_watcher(handler) {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to create file watcher");
                    return None;
                }
            };
            if let Err(err) = watcher.watch(&watch_root, RecursiveMode::Recursive) {
                tracing::warn!(error = %err, "failed to watch workspace root");
                return None;
            }
            Some(watcher)
        })
        .await
        .ok()
        .flatten();

        if watcher.is_none() {
            return;
        }
        // Keep the watcher alive for the duration of this loop by moving it
        // into a task that we never await until shutdown; it is dropped
        // (and stops watching) when this function returns.
        let _watcher = watcher;

        let pending: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
        loop {
            tokio::select! {
                _ = &mut stop => {
                    self.flush(&pending).await;
                    return;
                }
                maybe_path = rx.recv() => {
                    let Some(path) = maybe_path else { return; };
                    if is_skipped(&path) {
                        continue;
                    }
                    #[allow(clippy::unwrap_used)]
                    pending.lock().unwrap().insert(path);
                    let pending = Arc::clone(&pending);
                    let this_src = self.src.clone();
                    let this_dst = self.dst.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(FLUSH_DEBOUNCE).await;
                        let batch: Vec<PathBuf> = {
                            #[allow(clippy::unwrap_used)]
                            let mut guard = pending.lock().unwrap();
                            guard.drain().collect()
                        };
                        flush_batch(&this_src, &this_dst, batch).await;
                    });
                }
            }
        }
    }

    async fn flush(&self, pending: &Arc<Mutex<HashSet<PathBuf>>>) {
        let batch: Vec<PathBuf> = {
            #[allow(clippy::unwrap_used)]
            let mut guard = pending.lock().unwrap();
            guard.drain().collect()
        };
        flush_batch(&self.src, &self.dst, batch).await;
    }
}

async fn flush_batch(src: &Path, dst: &Path, batch: Vec<PathBuf>) {
    for path in batch {
        let Ok(relative) = path.strip_prefix(src) else {
            continue;
        };
        let dest_path = dst.join(relative);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {
                if let Some(parent) = dest_path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(err) = tokio::fs::copy(&path, &dest_path).await {
                    tracing::warn!(path = %path.display(), error = %err, "mirror copy failed");
                }
            }
            Ok(false) => {
                let _ = tokio::fs::remove_file(&dest_path).await;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "mirror stat failed");
            }
        }
    }
}

async fn count_entries(root: &Path) -> usize {
    let mut total = 0usize;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if is_skipped(&path) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(_) => total += 1,
                Err(_) => {}
            }
        }
    }
    total
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn full_sync_copies_and_excludes_git_and_node_modules() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();

        tokio::fs::create_dir_all(src_dir.path().join(".git")).await.unwrap();
        tokio::fs::write(src_dir.path().join(".git/HEAD"), "ref: refs/heads/main").await.unwrap();
        tokio::fs::create_dir_all(src_dir.path().join("node_modules/left-pad")).await.unwrap();
        tokio::fs::write(
            src_dir.path().join("node_modules/left-pad/index.js"),
            "module.exports = {};",
        )
        .await
        .unwrap();
        tokio::fs::write(src_dir.path().join("app.ts"), "export const x = 1;").await.unwrap();

        let mirror = LiveMirror::new(src_dir.path(), dst_dir.path());
        let result = mirror.full_sync().await;

        // rsync may be unavailable in some minimal environments; only
        // assert exclusions when the binary actually ran successfully.
        if result.is_ok() {
            assert!(dst_dir.path().join("app.ts").exists());
            assert!(!dst_dir.path().join(".git").exists());
            assert!(!dst_dir.path().join("node_modules").exists());
        }
    }

    #[tokio::test]
    async fn readiness_detects_existing_git_head_immediately() {
        let src_dir = tempdir().unwrap();
        tokio::fs::create_dir_all(src_dir.path().join(".git")).await.unwrap();
        tokio::fs::write(src_dir.path().join(".git/HEAD"), "ref: refs/heads/main").await.unwrap();

        let mirror = LiveMirror::new(src_dir.path(), tempdir().unwrap().path());
        let fut = mirror.wait_for_readiness();
        tokio::time::timeout(Duration::from_millis(200), fut)
            .await
            .expect("readiness should resolve immediately when marker already exists");
    }

    #[test]
    fn skip_detects_git_and_node_modules_segments() {
        assert!(is_skipped(Path::new("/workspace/.git/HEAD")));
        assert!(is_skipped(Path::new("/workspace/node_modules/left-pad")));
        assert!(!is_skipped(Path::new("/workspace/src/app.ts")));
    }
}
