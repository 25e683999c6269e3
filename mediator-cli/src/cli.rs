//! Clap derive surface (§6 CLI surface), laid out the way the teacher's
//! `codex-cli` multitool groups its subcommands.

use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;

#[derive(Debug, Parser)]
#[command(name = "sandbox-mediator", author, version, about = "Policy-gated mediation service for an agent sandbox")]
pub struct Cli {
    /// Base URL of the control plane's REST API.
    #[arg(long, global = true, env = "MEDIATOR_API", default_value = "http://127.0.0.1:3700")]
    pub api: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Boot the control plane, network proxy, and live file mirror.
    Serve(ServeArgs),
    /// Print pending permission requests.
    List,
    /// Approve one or more pending requests, or every pending request in a category.
    Approve(ResolveArgs),
    /// Deny one or more pending requests, or every pending request in a category.
    Deny(ResolveArgs),
    /// Connect to the control plane's WebSocket, print events, and accept
    /// interactive approve/deny commands.
    Watch,
    /// List configured allow/deny rules.
    Rules,
    /// Add an allow rule, e.g. `allow "network(*.example.com)"`.
    Allow {
        /// Rule string, e.g. `network(*.example.com)` or bare `git`.
        rule: String,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, env = "SERVER_PORT", default_value_t = 3700)]
    pub server_port: u16,
    #[arg(long, env = "PROXY_PORT", default_value_t = 3701)]
    pub proxy_port: u16,
    /// Whether `serve` starts the network proxy listener in-process.
    #[arg(long, env = "PROXY_INLINE", default_value_t = true)]
    pub proxy_inline: bool,
    /// Duration grammar `Nd? Nh? Nm? Ns? Nms?`, or bare digits as milliseconds.
    #[arg(long, env = "MAX_UPTIME")]
    pub max_uptime: Option<String>,
    #[arg(long, env = "WORKSPACE", default_value = "/workspace/merged")]
    pub workspace: PathBuf,
    #[arg(long, env = "HOST_PROJECT", default_value = "/workspace/lower")]
    pub host_project: PathBuf,
    #[arg(long, default_value = "sandbox.config.json")]
    pub config: PathBuf,
    #[arg(long, default_value = "data/queue.json")]
    pub queue_file: PathBuf,
    #[arg(long, default_value = "data/audit.log")]
    pub audit_file: PathBuf,
    /// Seed value for `SandboxConfig.gitStagingRepo` when no config file
    /// exists yet; once persisted, the config file's value wins.
    #[arg(long, default_value = "staging.git")]
    pub git_staging_repo: PathBuf,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Request ids to resolve.
    pub ids: Vec<String>,
    /// Resolve every pending request in this category instead of specific ids.
    #[arg(long = "all", value_name = "CATEGORY")]
    pub all: Option<String>,
}
