//! `serve`: wire up every broker behind a shared `AppState`, bring the
//! live mirror up, optionally run the network proxy inline, and serve the
//! control plane until a shutdown trigger fires.
//!
//! Tracing setup follows the teacher's `codex-exec` pattern exactly
//! (`EnvFilter::try_from_default_env().or_else(...).unwrap_or_else(...)`,
//! writer pinned to stderr so stdout stays free for any piped output).

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use mediator_config::ConfigStore;
use mediator_exec::ExecBroker;
use mediator_exec::PackageBroker;
use mediator_protocol::SandboxConfig;
use mediator_queue::AuditLog;
use mediator_queue::PermissionQueue;
use mediator_server::AppState;
use mediator_sync::FileSyncBroker;
use mediator_sync::GitSync;
use mediator_sync::LiveMirror;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use crate::cli::ServeArgs;

const DEFAULT_LOG_LEVEL: &str = "info";

pub async fn run(args: ServeArgs) -> Result<()> {
    init_tracing();

    let max_uptime_ms = match &args.max_uptime {
        Some(raw) => Some(
            mediator_server::parse_duration(raw)
                .ok_or_else(|| anyhow::anyhow!("invalid --max-uptime value: {raw}"))?,
        ),
        None => None,
    };

    let config = Arc::new(ConfigStore::load(
        args.config,
        args.git_staging_repo.display().to_string(),
    ));
    let SandboxConfig {
        git_staging_repo, ..
    } = config.get();

    let audit = AuditLog::new(args.audit_file);
    let queue = Arc::new(PermissionQueue::new(args.queue_file, audit));
    queue.init().await;

    let exec = Arc::new(ExecBroker::new(Arc::clone(&queue), Arc::clone(&config)));
    let packages = Arc::new(PackageBroker::new(Arc::clone(&queue), Arc::clone(&config)));
    let file_sync = Arc::new(FileSyncBroker::new(
        args.workspace.clone(),
        args.host_project.clone(),
        Arc::clone(&config),
        Arc::clone(&queue),
    ));
    let git_sync = Arc::new(GitSync::new(
        git_staging_repo,
        Arc::clone(&config),
        Arc::clone(&queue),
    ));
    let mirror = Arc::new(LiveMirror::new(
        args.workspace.clone(),
        args.host_project.clone(),
    ));

    let (rules_tx, _) = broadcast::channel(64);
    let (shutdown_tx, _) = broadcast::channel(16);

    let state = Arc::new(AppState {
        queue: Arc::clone(&queue),
        config: Arc::clone(&config),
        exec,
        packages,
        file_sync,
        git_sync,
        mirror: Arc::clone(&mirror),
        workspace: args.workspace.clone(),
        started_at: Instant::now(),
        started_at_wall_ms: now_ms(),
        max_uptime_ms,
        rules_tx,
        shutdown_tx,
        watch_stop: Mutex::new(None),
        watch_handle: Mutex::new(None),
    });

    if args.proxy_inline {
        let proxy = mediator_proxy::ProxyServer::new(Arc::clone(&config), Arc::clone(&queue));
        let proxy_addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.proxy_port));
        tokio::spawn(async move {
            if let Err(err) = proxy.run(proxy_addr).await {
                tracing::error!(%err, "network proxy exited");
            }
        });
        tracing::info!(port = args.proxy_port, "network proxy listening inline");
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    {
        #[allow(clippy::unwrap_used)]
        let mut guard = state.watch_stop.lock().unwrap();
        *guard = Some(stop_tx);
    }
    let watch_mirror = Arc::clone(&mirror);
    let watch_handle = tokio::spawn(async move {
        watch_mirror.wait_for_readiness().await;
        if let Err(err) = watch_mirror.full_sync().await {
            tracing::error!(%err, "initial full_sync failed");
        }
        watch_mirror.watch_until(stop_rx).await;
    });
    {
        #[allow(clippy::unwrap_used)]
        let mut guard = state.watch_handle.lock().unwrap();
        *guard = Some(watch_handle);
    }

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.server_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control plane listening");

    let router = mediator_server::router(Arc::clone(&state));
    axum::serve(listener, router)
        .with_graceful_shutdown(mediator_server::shutdown_signal(state, max_uptime_ms))
        .await?;

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
