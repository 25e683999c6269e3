use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use mediator_config::ConfigStore;
use mediator_exec::ExecBroker;
use mediator_exec::PackageBroker;
use mediator_protocol::RuleSet;
use mediator_queue::PermissionQueue;
use mediator_sync::FileSyncBroker;
use mediator_sync::GitSync;
use mediator_sync::LiveMirror;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Everything a route handler or the WebSocket relay needs, shared behind
/// an `Arc` the way the teacher's session handlers share a `Config`/`Session`.
pub struct AppState {
    pub queue: Arc<PermissionQueue>,
    pub config: Arc<ConfigStore>,
    pub exec: Arc<ExecBroker>,
    pub packages: Arc<PackageBroker>,
    pub file_sync: Arc<FileSyncBroker>,
    pub git_sync: Arc<GitSync>,
    pub mirror: Arc<LiveMirror>,
    pub workspace: PathBuf,
    /// Monotonic start instant: uptime math never observes a system clock
    /// adjustment made during a long-running session.
    pub started_at: Instant,
    /// Wall-clock start time, reported verbatim as `/api/status.startedAt`.
    pub started_at_wall_ms: i64,
    pub max_uptime_ms: Option<i64>,
    /// Rule-change notifications for the WebSocket relay; the queue's own
    /// broadcast only carries `request`/`resolve` events.
    pub rules_tx: broadcast::Sender<RuleSet>,
    /// Fired once by `run_shutdown_sequence`, relayed to every open `/ws`
    /// connection as a `shutdown` message.
    pub shutdown_tx: broadcast::Sender<String>,
    /// Set once by whoever spawns the live-mirror watch loop; taken (and
    /// fired) exactly once by graceful shutdown.
    pub watch_stop: Mutex<Option<oneshot::Sender<()>>>,
    /// Join handle for that same watch loop, awaited by graceful shutdown
    /// before the final authoritative `fullSync` runs.
    pub watch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    pub fn uptime_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    pub fn remaining_ms(&self) -> Option<i64> {
        self.max_uptime_ms.map(|max| (max - self.uptime_ms()).max(0))
    }
}
