//! Wire and storage data model for the sandbox mediator.
//!
//! These types have no I/O of their own: they are shared between the rules
//! engine, the permission queue, the mediation subsystems, and the control
//! plane so that every component agrees on the shape of a request, a rule,
//! and a config without depending on each other's internals.

use std::collections::HashMap;
use serde::Deserialize;
use serde::Serialize;

pub mod rule;

pub use rule::ParsedRule;

/// One of the six mediation buckets every intercepted action is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Network,
    Filesystem,
    Git,
    Packages,
    Sandbox,
    Exec,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Network,
        Category::Filesystem,
        Category::Git,
        Category::Packages,
        Category::Sandbox,
        Category::Exec,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Network => "network",
            Category::Filesystem => "filesystem",
            Category::Git => "git",
            Category::Packages => "packages",
            Category::Sandbox => "sandbox",
            Category::Exec => "exec",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        match s {
            "network" => Some(Category::Network),
            "filesystem" => Some(Category::Filesystem),
            "git" => Some(Category::Git),
            "packages" => Some(Category::Packages),
            "sandbox" => Some(Category::Sandbox),
            "exec" => Some(Category::Exec),
            _ => None,
        }
    }

    /// `exec` and `packages` are hardened: mode is locked to `approve-each`
    /// and blanket allow rules are ignored by the rule evaluator.
    pub fn is_hardened(&self) -> bool {
        matches!(self, Category::Exec | Category::Packages)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryMode {
    ApproveEach,
    ApproveBulk,
    AllowAll,
    DenyAll,
}

impl Default for CategoryMode {
    fn default() -> Self {
        CategoryMode::ApproveEach
    }
}

/// Lifecycle status of a `PermissionRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

/// Who resolved a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    Cli,
    Web,
    Auto,
}

impl std::fmt::Display for ResolvedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolvedBy::Cli => "cli",
            ResolvedBy::Web => "web",
            ResolvedBy::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Open key/value bag attached to a request. Kept as untyped JSON because the
/// shape depends on the category: filesystem requests carry
/// `toolName`/`targetFile`/`writeContent`/`editContext`, sandbox requests
/// carry `proposal`, exec/package requests carry the command inputs.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single mediated action awaiting or past human/automatic decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub category: Category,
    /// Short machine-readable verb + target, e.g. `"CONNECT host:port"`.
    pub action: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: RequestStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolvedBy>,
}

impl PermissionRequest {
    pub fn target_file(&self) -> Option<&str> {
        self.metadata.get("targetFile")?.as_str()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.get("toolName")?.as_str()
    }
}

/// Ordered allow/deny rule strings, as persisted in `SandboxConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSet {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Persisted sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default)]
    pub allowed_endpoints: Vec<String>,
    pub git_staging_repo: String,
    pub categories: HashMap<Category, CategoryMode>,
    #[serde(default)]
    pub rules: RuleSet,
}

impl SandboxConfig {
    /// Built-in defaults used when no config file exists, or when the
    /// existing one fails to parse.
    pub fn default_for(git_staging_repo: impl Into<String>) -> Self {
        let mut categories = HashMap::new();
        for cat in Category::ALL {
            categories.insert(cat, CategoryMode::ApproveEach);
        }
        SandboxConfig {
            allowed_endpoints: Vec::new(),
            git_staging_repo: git_staging_repo.into(),
            categories,
            rules: RuleSet::default(),
        }
    }
}

/// One line of the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: i64,
    pub id: String,
    pub category: Category,
    pub action: String,
    pub decision: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolvedBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Outcome of a single `exec`/`package` subprocess invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Pending,
    Approved,
    Running,
    Completed,
    Failed,
    Denied,
}

/// Parallel lifecycle record owned by the exec broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: BrokerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub created_at: i64,
}

/// Parallel lifecycle record owned by the package broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRequest {
    pub id: String,
    pub manager: String,
    pub action: String,
    pub packages: Vec<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: BrokerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub created_at: i64,
}

/// Messages broadcast over `/ws` to every connected client. Adjacently
/// tagged so the wire shape is `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Init {
        pending: Vec<PermissionRequest>,
        config: SandboxConfig,
        rules: RuleSet,
    },
    Request(PermissionRequest),
    Resolve(PermissionRequest),
    Rules(RuleSet),
    Shutdown { reason: String },
}

/// Commands a client sends over `/ws`. Internally tagged with no `data`
/// wrapper, matching the flat `{"type": "approve", "id": ..., "alwaysAllow":
/// ...}` shape documented for the control-plane's WebSocket contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    #[serde(rename_all = "camelCase")]
    Approve {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        always_allow: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Deny {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        always_deny: Option<bool>,
    },
}
