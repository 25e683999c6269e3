//! In-process permission request registry plus the audit log it fires
//! writes into.
//!
//! Waiters are represented as single-shot `tokio::sync::oneshot` channels
//! keyed by request id, the same shape the teacher uses for
//! `pending_approvals` in its session loop: every `request()` inserts a
//! sender, every `resolve()` removes and fires it exactly once.

mod audit;

pub use audit::AuditLog;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use mediator_protocol::AuditEntry;
use mediator_protocol::Category;
use mediator_protocol::Metadata;
use mediator_protocol::PermissionRequest;
use mediator_protocol::RequestStatus;
use mediator_protocol::ResolvedBy;
use tokio::sync::broadcast;
use tokio::sync::oneshot;

const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Lifecycle events fanned out to subscribers (audit log, WebSocket relay).
/// Delivered in enqueue order; the queue never blocks on a slow subscriber
/// because `tokio::sync::broadcast` hands each subscriber its own lagging
/// buffer rather than back-pressuring the sender.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Request(PermissionRequest),
    Resolve(PermissionRequest),
}

/// A one-shot awaitable returned by `request()`. Resolves to `true` if the
/// request was approved, `false` if denied or superseded. Never times out
/// on its own; it only ever completes when `resolve()` is called for this
/// id (by a human decision, a rule/mode auto-resolution, a supersession,
/// or graceful shutdown).
pub struct Waiter {
    rx: oneshot::Receiver<bool>,
}

impl Waiter {
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }
}

struct QueueState {
    requests: Vec<PermissionRequest>,
    waiters: HashMap<String, oneshot::Sender<bool>>,
}

pub struct PermissionQueue {
    state: Arc<Mutex<QueueState>>,
    counter: AtomicU64,
    events: broadcast::Sender<QueueEvent>,
    audit: Arc<AuditLog>,
    persist_path: PathBuf,
    persist_scheduled: Arc<AtomicBool>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl PermissionQueue {
    pub fn new(persist_path: impl Into<PathBuf>, audit: AuditLog) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        PermissionQueue {
            state: Arc::new(Mutex::new(QueueState {
                requests: Vec::new(),
                waiters: HashMap::new(),
            })),
            counter: AtomicU64::new(0),
            events: tx,
            audit: Arc::new(audit),
            persist_path: persist_path.into(),
            persist_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load persisted records at startup and restore the monotonic counter
    /// from the maximum observed id. Historical records are terminal, so
    /// no waiters are recreated for them.
    pub async fn init(&self) {
        let path = self.persist_path.clone();
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return;
        };
        let Ok(requests) = serde_json::from_str::<Vec<PermissionRequest>>(&contents) else {
            tracing::warn!(path = %path.display(), "queue persistence file is corrupt, starting empty");
            return;
        };

        let max_seq = requests
            .iter()
            .filter_map(|r| r.id.strip_prefix("req-"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        self.counter.store(max_seq + 1, Ordering::SeqCst);

        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.requests = requests;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("req-{n}")
    }

    /// Insert a new pending request. For filesystem requests with
    /// `metadata.targetFile` set, any existing pending filesystem request
    /// for the same file is superseded (denied/auto) *before* the new
    /// request's id is minted, so no observer ever sees both as pending at
    /// the same time.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &self,
        category: Category,
        action: impl Into<String>,
        description: impl Into<String>,
        reason: Option<String>,
        metadata: Metadata,
    ) -> (String, Waiter) {
        let action = action.into();
        let description = description.into();
        let target_file = if category == Category::Filesystem {
            metadata
                .get("targetFile")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        } else {
            None
        };

        let mut superseded = Vec::new();
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            if let Some(ref target) = target_file {
                for req in state.requests.iter_mut() {
                    if req.status == RequestStatus::Pending
                        && req.category == Category::Filesystem
                        && req.target_file() == Some(target.as_str())
                    {
                        req.status = RequestStatus::Denied;
                        req.resolved_at = Some(now_ms());
                        req.resolved_by = Some(ResolvedBy::Auto);
                        superseded.push(req.clone());
                    }
                }
                for req in &superseded {
                    if let Some(tx) = state.waiters.remove(&req.id) {
                        let _ = tx.send(false);
                    }
                }
            }
        }
        for req in &superseded {
            let _ = self.events.send(QueueEvent::Resolve(req.clone()));
            self.spawn_audit(req, None);
        }

        let id = self.next_id();
        let request = PermissionRequest {
            id: id.clone(),
            category,
            action,
            description,
            reason,
            status: RequestStatus::Pending,
            metadata,
            created_at: now_ms(),
            resolved_at: None,
            resolved_by: None,
        };

        let (tx, rx) = oneshot::channel();
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            state.waiters.insert(id.clone(), tx);
        }

        let _ = self.events.send(QueueEvent::Request(request));
        self.schedule_persist();
        (id, Waiter { rx })
    }

    /// Valid only from `pending`. Returns `false` with no side effects
    /// otherwise. Idempotent: resolving an already-terminal request is a no-op.
    pub fn resolve(&self, id: &str, status: RequestStatus, resolved_by: Option<ResolvedBy>) -> bool {
        assert_ne!(status, RequestStatus::Pending, "resolve target must be terminal");
        let (resolved, waiter) = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            let Some(req) = state
                .requests
                .iter_mut()
                .find(|r| r.id == id && r.status == RequestStatus::Pending)
            else {
                return false;
            };
            req.status = status;
            req.resolved_at = Some(now_ms());
            req.resolved_by = resolved_by;
            let resolved = req.clone();
            let waiter = state.waiters.remove(id);
            (resolved, waiter)
        };

        if let Some(tx) = waiter {
            let _ = tx.send(status == RequestStatus::Approved);
        }
        let _ = self.events.send(QueueEvent::Resolve(resolved.clone()));
        self.schedule_persist();
        self.spawn_audit(&resolved, None);
        true
    }

    pub fn approve(&self, id: &str, by: Option<ResolvedBy>) -> bool {
        self.resolve(id, RequestStatus::Approved, by)
    }

    pub fn deny(&self, id: &str, by: Option<ResolvedBy>) -> bool {
        self.resolve(id, RequestStatus::Denied, by)
    }

    /// Resolve every pending request of `category`, in insertion order.
    /// Returns the number resolved.
    pub fn bulk_resolve(&self, category: Category, status: RequestStatus, by: Option<ResolvedBy>) -> usize {
        let ids: Vec<String> = {
            #[allow(clippy::unwrap_used)]
            let state = self.state.lock().unwrap();
            state
                .requests
                .iter()
                .filter(|r| r.category == category && r.status == RequestStatus::Pending)
                .map(|r| r.id.clone())
                .collect()
        };
        let mut count = 0;
        for id in ids {
            if self.resolve(&id, status, by) {
                count += 1;
            }
        }
        count
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<PermissionRequest> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.requests.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<PermissionRequest> {
        #[allow(clippy::unwrap_used)]
        let state = self.state.lock().unwrap();
        state.requests.iter().find(|r| r.id == id).cloned()
    }

    /// Deny every pending request with `resolvedBy=auto`, signalling every
    /// waiter with `false`. Used by graceful shutdown: no agent waiter may
    /// survive a clean shutdown.
    pub fn deny_all_pending(&self) -> usize {
        let ids: Vec<String> = self
            .pending()
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut count = 0;
        for id in ids {
            if self.resolve(&id, RequestStatus::Denied, Some(ResolvedBy::Auto)) {
                count += 1;
            }
        }
        count
    }

    fn spawn_audit(&self, req: &PermissionRequest, duration_ms: Option<i64>) {
        let entry = AuditEntry {
            timestamp: req.resolved_at.unwrap_or_else(now_ms),
            id: req.id.clone(),
            category: req.category,
            action: req.action.clone(),
            decision: req.status,
            resolved_by: req.resolved_by,
            duration_ms,
            metadata: Some(req.metadata.clone()),
        };
        // Fire-and-forget: the audit log must never block request
        // resolution, and its own I/O failures are swallowed internally.
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            audit.append(entry).await;
        });
    }

    /// Coalesce writes: if a flush is already scheduled within the debounce
    /// window, this mutation rides along with it instead of scheduling a
    /// second one. The snapshot is taken only once the debounce elapses, so
    /// any mutation that lands inside the window is still captured by the
    /// single flush. Losing a coalesce window entirely (e.g. on process
    /// kill) is acceptable; waiters are in-memory only and are never
    /// persisted.
    fn schedule_persist(&self) {
        if self
            .persist_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let path = self.persist_path.clone();
        let flag = Arc::clone(&self.persist_scheduled);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(PERSIST_DEBOUNCE).await;
            flag.store(false, Ordering::SeqCst);
            let snapshot = {
                #[allow(clippy::unwrap_used)]
                let state = state.lock().unwrap();
                state.requests.clone()
            };
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    if let Err(err) = tokio::fs::write(&path, json).await {
                        tracing::warn!(error = %err, "queue persistence write failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "queue persistence serialize failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_protocol::Category;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn queue() -> (tempfile::TempDir, PermissionQueue) {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let queue = PermissionQueue::new(dir.path().join("queue.json"), audit);
        (dir, queue)
    }

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        let mut m = Metadata::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), json!(v));
        }
        m
    }

    #[tokio::test]
    async fn resolve_twice_is_idempotent() {
        let (_dir, q) = queue();
        let (id, _waiter) = q.request(Category::Network, "CONNECT a:443", "d", None, Metadata::new());
        assert!(q.resolve(&id, RequestStatus::Approved, Some(ResolvedBy::Web)));
        assert!(!q.resolve(&id, RequestStatus::Denied, Some(ResolvedBy::Web)));
        assert_eq!(q.get(&id).unwrap().status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn bulk_resolve_clears_category() {
        let (_dir, q) = queue();
        let (id1, _w1) = q.request(Category::Exec, "ls", "d", None, Metadata::new());
        let (id2, _w2) = q.request(Category::Exec, "pwd", "d", None, Metadata::new());
        let n = q.bulk_resolve(Category::Exec, RequestStatus::Approved, Some(ResolvedBy::Web));
        assert_eq!(n, 2);
        assert!(q.pending().is_empty());
        assert_eq!(q.get(&id1).unwrap().status, RequestStatus::Approved);
        assert_eq!(q.get(&id2).unwrap().status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn filesystem_supersession_denies_the_older_request() {
        let (_dir, q) = queue();
        let (id1, waiter1) = q.request(
            Category::Filesystem,
            "Write foo.ts",
            "",
            None,
            metadata(&[("targetFile", "src/foo.ts"), ("toolName", "Write")]),
        );
        let (id2, _waiter2) = q.request(
            Category::Filesystem,
            "Write foo.ts",
            "",
            None,
            metadata(&[("targetFile", "src/foo.ts"), ("toolName", "Write")]),
        );

        assert!(!waiter1.wait().await);
        let req1 = q.get(&id1).unwrap();
        assert_eq!(req1.status, RequestStatus::Denied);
        assert_eq!(req1.resolved_by, Some(ResolvedBy::Auto));
        assert_eq!(q.get(&id2).unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn waiter_resolves_true_on_approve() {
        let (_dir, q) = queue();
        let (id, waiter) = q.request(Category::Network, "CONNECT a:443", "d", None, Metadata::new());
        q.approve(&id, Some(ResolvedBy::Cli));
        assert!(waiter.wait().await);
    }

    #[tokio::test]
    async fn deny_all_pending_signals_false() {
        let (_dir, q) = queue();
        let (_id, waiter) = q.request(Category::Exec, "rm -rf /", "d", None, Metadata::new());
        let n = q.deny_all_pending();
        assert_eq!(n, 1);
        assert!(!waiter.wait().await);
    }

    #[tokio::test]
    async fn init_restores_monotonic_counter_from_persisted_max_id() {
        let dir = tempdir().unwrap();
        let persisted = vec![PermissionRequest {
            id: "req-7".to_string(),
            category: Category::Network,
            action: "CONNECT a:443".to_string(),
            description: "d".to_string(),
            reason: None,
            status: RequestStatus::Approved,
            metadata: Metadata::new(),
            created_at: 0,
            resolved_at: Some(1),
            resolved_by: Some(ResolvedBy::Web),
        }];
        let queue_path = dir.path().join("queue.json");
        tokio::fs::write(&queue_path, serde_json::to_string(&persisted).unwrap())
            .await
            .unwrap();

        let audit = AuditLog::new(dir.path().join("audit.log"));
        let queue = PermissionQueue::new(queue_path, audit);
        queue.init().await;

        let (id, _w) = queue.request(Category::Network, "CONNECT b:443", "d", None, Metadata::new());
        assert_eq!(id, "req-8");
    }
}
