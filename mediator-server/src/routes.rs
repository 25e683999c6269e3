//! REST handler surface (§6). Every handler shares `AppState` behind the
//! `axum::extract::State` the same way the teacher's MCP server shares one
//! `Codex` session across JSON-RPC method handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use mediator_config::RuleKind;
use mediator_protocol::Category;
use mediator_protocol::PermissionRequest;
use mediator_protocol::RequestStatus;
use mediator_protocol::ResolvedBy;
use mediator_protocol::RuleSet;
use mediator_protocol::SandboxConfig;
use mediator_queue::PermissionQueue;
use mediator_rules::Decision;
use mediator_rules::evaluate;
use mediator_rules::generate;
use mediator_sync::apply_filesystem_request;
use serde::Deserialize;
use serde::Serialize;

use crate::state::AppState;

/// Every handler failure collapses to this shape: `{"ok": false, "error":
/// "..."}` with a status code chosen by the call site.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"ok": false, "error": self.message})),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct QueueSubmission {
    category: Category,
    action: String,
    description: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    metadata: mediator_protocol::Metadata,
}

#[derive(Debug, Serialize)]
pub struct QueueListResponse {
    pending: Vec<PermissionRequest>,
    recent: Vec<PermissionRequest>,
}

pub async fn get_queue(State(state): State<Arc<AppState>>) -> Json<QueueListResponse> {
    Json(QueueListResponse {
        pending: state.queue.pending(),
        recent: state.queue.recent(50),
    })
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    id: String,
}

pub async fn post_queue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueueSubmission>,
) -> (StatusCode, Json<IdResponse>) {
    let (id, _waiter) = state.queue.request(
        body.category,
        body.action,
        body.description,
        body.reason,
        body.metadata,
    );
    (StatusCode::CREATED, Json(IdResponse { id }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResolveBody {
    #[serde(default)]
    resolved_by: Option<ResolvedBy>,
    #[serde(default)]
    always_allow: Option<bool>,
    #[serde(default)]
    always_deny: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    ok: bool,
}

pub async fn post_approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Json<OkResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    approve_request(&state, &id, body.resolved_by, body.always_allow).await?;
    Ok(Json(OkResponse { ok: true }))
}

pub async fn post_deny(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ResolveBody>>,
) -> ApiResult<Json<OkResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    deny_request(&state, &id, body.resolved_by, body.always_deny).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Shared by the REST handler and the WebSocket relay (§4.10 approve flow).
/// 1. filesystem requests apply at approval time, denying+409 on staleness.
/// 2. `queue.approve`.
/// 3. a `sandbox` proposal is written into the config and saved.
/// 4. `alwaysAllow` synthesizes and inserts a rule, broadcasts it, then
///    auto-resolves every other pending request the new rule now matches.
pub async fn approve_request(
    state: &Arc<AppState>,
    id: &str,
    resolved_by: Option<ResolvedBy>,
    always_allow: Option<bool>,
) -> ApiResult<()> {
    let request = state.queue.get(id).ok_or_else(|| ApiError::not_found("request"))?;

    if request.category == Category::Filesystem && request.tool_name().is_some() {
        if let Err(err) = apply_filesystem_request(&request, &state.workspace).await {
            state.queue.deny(id, resolved_by);
            return Err(ApiError::new(StatusCode::CONFLICT, err.to_string()));
        }
    }

    state.queue.approve(id, resolved_by);

    if request.category == Category::Sandbox {
        apply_sandbox_proposal(state, &request)?;
    }

    if always_allow == Some(true) {
        synthesize_rule(state, RuleKind::Allow, request.category, &request.action)?;
    }

    Ok(())
}

pub async fn deny_request(
    state: &Arc<AppState>,
    id: &str,
    resolved_by: Option<ResolvedBy>,
    always_deny: Option<bool>,
) -> ApiResult<()> {
    let request = state.queue.get(id).ok_or_else(|| ApiError::not_found("request"))?;
    state.queue.deny(id, resolved_by);

    if always_deny == Some(true) {
        synthesize_rule(state, RuleKind::Deny, request.category, &request.action)?;
    }

    Ok(())
}

fn apply_sandbox_proposal(state: &Arc<AppState>, request: &PermissionRequest) -> ApiResult<()> {
    let Some(proposal) = request.metadata.get("proposal") else {
        return Ok(());
    };
    let path = proposal
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "proposal is missing `path`"))?;
    let value = proposal.get("value").cloned().unwrap_or(serde_json::Value::Null);
    let reason = request.reason.as_deref();

    state
        .config
        .apply_config_change(path, value, reason)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    state
        .config
        .save()
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(())
}

/// Synthesize a rule from the resolved request's action, insert it, save,
/// broadcast the change, then auto-resolve every other pending request of
/// the same category whose verdict the new rule now settles.
fn synthesize_rule(state: &Arc<AppState>, kind: RuleKind, category: Category, action: &str) -> ApiResult<()> {
    let rule = generate(category, action);
    if !state.config.add_rule(kind, &rule) {
        return Ok(());
    }
    state
        .config
        .save()
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let _ = state.rules_tx.send(state.config.rules());
    auto_resolve_matching(state, category);
    Ok(())
}

fn auto_resolve_matching(state: &Arc<AppState>, category: Category) {
    let ruleset = state.config.rules();
    for req in state.queue.pending() {
        if req.category != category {
            continue;
        }
        match evaluate(&ruleset, category, &req.action) {
            Some(Decision::Allow) => {
                state.queue.approve(&req.id, Some(ResolvedBy::Auto));
            }
            Some(Decision::Deny) => {
                state.queue.deny(&req.id, Some(ResolvedBy::Auto));
            }
            None => {}
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkBody {
    category: Category,
    status: RequestStatus,
    #[serde(default)]
    resolved_by: Option<ResolvedBy>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    count: usize,
}

pub async fn post_bulk(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkBody>,
) -> ApiResult<Json<CountResponse>> {
    if body.status == RequestStatus::Pending {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bulk status must be approved or denied",
        ));
    }
    let count = state
        .queue
        .bulk_resolve(body.category, body.status, body.resolved_by);
    Ok(Json(CountResponse { count }))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SandboxConfig> {
    Json(state.config.get())
}

#[derive(Debug, Deserialize)]
pub struct ConfigProposal {
    path: String,
    value: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

pub async fn post_config_propose(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigProposal>,
) -> (StatusCode, Json<IdResponse>) {
    let mut metadata = mediator_protocol::Metadata::new();
    metadata.insert(
        "proposal".to_string(),
        serde_json::json!({"path": body.path, "value": body.value}),
    );
    let (id, _waiter) = state.queue.request(
        Category::Sandbox,
        format!("set {}", body.path),
        format!("Propose {} = {}", body.path, body.value),
        body.reason,
        metadata,
    );
    (StatusCode::CREATED, Json(IdResponse { id }))
}

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    rules: RuleSet,
}

pub async fn get_rules(State(state): State<Arc<AppState>>) -> Json<RulesResponse> {
    Json(RulesResponse {
        rules: state.config.rules(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RuleBody {
    #[serde(rename = "type")]
    kind: String,
    rule: String,
}

#[derive(Debug, Serialize)]
pub struct RuleMutationResponse {
    added: bool,
    rules: RuleSet,
}

pub async fn post_rules(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<RuleMutationResponse>> {
    let kind = parse_rule_kind(&body.kind)?;
    let added = state.config.add_rule(kind, &body.rule);
    if added {
        let _ = state.config.save();
        let _ = state.rules_tx.send(state.config.rules());
    }
    Ok(Json(RuleMutationResponse {
        added,
        rules: state.config.rules(),
    }))
}

#[derive(Debug, Serialize)]
pub struct RuleRemovalResponse {
    removed: bool,
    rules: RuleSet,
}

pub async fn delete_rules(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RuleBody>,
) -> ApiResult<Json<RuleRemovalResponse>> {
    let kind = parse_rule_kind(&body.kind)?;
    let removed = state.config.remove_rule(kind, &body.rule);
    if removed {
        let _ = state.config.save();
        let _ = state.rules_tx.send(state.config.rules());
    }
    Ok(Json(RuleRemovalResponse {
        removed,
        rules: state.config.rules(),
    }))
}

fn parse_rule_kind(s: &str) -> ApiResult<RuleKind> {
    match s {
        "allow" => Ok(RuleKind::Allow),
        "deny" => Ok(RuleKind::Deny),
        other => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown rule type `{other}`"),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct SyncFilesResponse {
    files: Vec<mediator_sync::SyncFile>,
}

pub async fn get_sync_files(State(state): State<Arc<AppState>>) -> Json<SyncFilesResponse> {
    Json(SyncFilesResponse {
        files: state.file_sync.list_files().await,
    })
}

#[derive(Debug, Deserialize, Default)]
pub struct SyncFilesBody {
    #[serde(default)]
    paths: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct SyncFilesResultResponse {
    results: std::collections::HashMap<String, bool>,
}

pub async fn post_sync_files(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SyncFilesBody>>,
) -> Json<SyncFilesResultResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let paths = match body.paths {
        Some(paths) => paths,
        None => state
            .file_sync
            .list_files()
            .await
            .into_iter()
            .map(|f| f.path)
            .collect(),
    };
    let results = state.file_sync.request_file_sync(paths).await;
    Json(SyncFilesResultResponse { results })
}

#[derive(Debug, Serialize)]
pub struct GitBranchesResponse {
    branches: Vec<mediator_sync::BranchDiff>,
}

pub async fn get_sync_git(State(state): State<Arc<AppState>>) -> ApiResult<Json<GitBranchesResponse>> {
    let branches = state
        .git_sync
        .list_branch_diffs()
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(GitBranchesResponse { branches }))
}

#[derive(Debug, Deserialize)]
pub struct GitSyncBody {
    branch: String,
}

#[derive(Debug, Serialize)]
pub struct GitSyncResponse {
    branch: String,
    approved: bool,
}

pub async fn post_sync_git(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GitSyncBody>,
) -> Json<GitSyncResponse> {
    let outcome = state.git_sync.request_git_sync(&body.branch).await;
    Json(GitSyncResponse {
        branch: body.branch,
        approved: outcome == mediator_sync::GitSyncOutcome::Pushed,
    })
}

#[derive(Debug, Deserialize)]
pub struct ExecSubmission {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

pub async fn post_exec(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecSubmission>,
) -> (StatusCode, Json<IdResponse>) {
    let record = state
        .exec
        .submit_exec(body.command, body.cwd, body.reason, body.timeout)
        .await;
    (StatusCode::CREATED, Json(IdResponse { id: record.id }))
}

pub async fn get_exec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<mediator_protocol::ExecRequest>> {
    state.exec.get(&id).map(Json).ok_or_else(|| ApiError::not_found("exec request"))
}

#[derive(Debug, Deserialize)]
pub struct PackageSubmission {
    manager: String,
    packages: Vec<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
}

pub async fn post_packages(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PackageSubmission>,
) -> (StatusCode, Json<IdResponse>) {
    let record = state
        .packages
        .submit(
            body.manager,
            body.packages,
            body.action,
            body.cwd,
            body.reason,
            body.timeout,
        )
        .await;
    (StatusCode::CREATED, Json(IdResponse { id: record.id }))
}

pub async fn get_package(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<mediator_protocol::PackageRequest>> {
    state
        .packages
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("package request"))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn get_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<mediator_protocol::AuditEntry>> {
    let limit = query.limit.unwrap_or(100);
    Json(state.queue.audit_log().read(limit).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    started_at: i64,
    uptime: i64,
    max_uptime_ms: Option<i64>,
    remaining_ms: Option<i64>,
    pending: usize,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        started_at: state.started_at_wall_ms,
        uptime: state.uptime_ms(),
        max_uptime_ms: state.max_uptime_ms,
        remaining_ms: state.remaining_ms(),
        pending: state.queue.pending().len(),
    })
}
