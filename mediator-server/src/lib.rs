//! Control plane (§4.10): the `axum` REST + WebSocket surface, the
//! max-uptime timer, and the graceful-shutdown sequence. The binary that
//! assembles the rest of the mediator (`mediator-cli`'s `serve`
//! subcommand) builds an [`AppState`] and hands it to [`router`].

mod duration;
mod routes;
mod state;
mod ws;

pub use duration::parse_duration;
pub use state::AppState;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use tower_http::trace::TraceLayer;

/// Assemble every route over a shared [`AppState`], with request tracing
/// layered on top the way the teacher wraps its JSON-RPC dispatch in a
/// tracing span per message.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/queue", get(routes::get_queue).post(routes::post_queue))
        .route("/api/queue/bulk", post(routes::post_bulk))
        .route("/api/queue/{id}/approve", post(routes::post_approve))
        .route("/api/queue/{id}/deny", post(routes::post_deny))
        .route("/api/config", get(routes::get_config))
        .route("/api/config/propose", post(routes::post_config_propose))
        .route(
            "/api/rules",
            get(routes::get_rules)
                .post(routes::post_rules)
                .delete(routes::delete_rules),
        )
        .route(
            "/api/sync/files",
            get(routes::get_sync_files).post(routes::post_sync_files),
        )
        .route(
            "/api/sync/git",
            get(routes::get_sync_git).post(routes::post_sync_git),
        )
        .route("/api/exec", post(routes::post_exec))
        .route("/api/exec/{id}", get(routes::get_exec))
        .route("/api/packages", post(routes::post_packages))
        .route("/api/packages/{id}", get(routes::get_package))
        .route("/api/audit", get(routes::get_audit))
        .route("/api/status", get(routes::get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Race SIGTERM/SIGINT against the max-uptime timer, whichever fires
/// first. Returns the reason string used in the `shutdown` broadcast.
async fn wait_for_shutdown_trigger(max_uptime_ms: Option<i64>) -> String {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sigterm) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else {
            std::future::pending::<()>().await;
            unreachable!();
        };
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let uptime = async {
        match max_uptime_ms {
            Some(ms) if ms >= 0 => tokio::time::sleep(Duration::from_millis(ms as u64)).await,
            _ => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => "SIGINT".to_string(),
        _ = terminate => "SIGTERM".to_string(),
        _ = uptime => "max uptime reached".to_string(),
    }
}

/// Stop the live-mirror watch loop, run one more authoritative full sync,
/// deny every pending request, then broadcast `shutdown`. Strictly
/// sequential per §4.10/§5: no agent waiter survives a clean shutdown.
async fn run_shutdown_sequence(state: &Arc<AppState>, reason: String) {
    tracing::info!(reason = %reason, "graceful shutdown starting");

    let stop_tx = {
        #[allow(clippy::unwrap_used)]
        state.watch_stop.lock().unwrap().take()
    };
    if let Some(stop_tx) = stop_tx {
        let _ = stop_tx.send(());
    }
    let watch_handle = {
        #[allow(clippy::unwrap_used)]
        state.watch_handle.lock().unwrap().take()
    };
    if let Some(handle) = watch_handle {
        let _ = handle.await;
    }

    match state.mirror.full_sync().await {
        Ok(count) => tracing::info!(count, "final full sync complete"),
        Err(err) => tracing::warn!(error = %err, "final full sync failed"),
    }

    let denied = state.queue.deny_all_pending();
    tracing::info!(denied, "denied all pending requests for shutdown");

    let _ = state.shutdown_tx.send(reason);
}

/// The future handed to `axum::serve(...).with_graceful_shutdown(...)`.
/// Waiting for the trigger *inside* this future (rather than before
/// calling `axum::serve`) means already-open WebSocket connections are
/// still being served concurrently when the `shutdown` broadcast fires,
/// so every connected client actually observes it before the listener
/// stops accepting new connections.
pub async fn shutdown_signal(state: Arc<AppState>, max_uptime_ms: Option<i64>) {
    let reason = wait_for_shutdown_trigger(max_uptime_ms).await;
    run_shutdown_sequence(&state, reason).await;
}
