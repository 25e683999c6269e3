//! Package broker: parses a package-manager command into a structured
//! request, evaluates rules against `packages`, then denies, auto-runs,
//! or queues it the same way the exec broker does. `packages` is always
//! hardened, so a blanket allow rule never short-circuits the queue.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use mediator_config::ConfigStore;
use mediator_protocol::BrokerStatus;
use mediator_protocol::Category;
use mediator_protocol::Metadata;
use mediator_protocol::PackageRequest;
use mediator_queue::PermissionQueue;
use mediator_rules::Decision;
use mediator_rules::evaluate;

use crate::runner::DEFAULT_TIMEOUT;
use crate::runner::run_shell;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Flags that do not change which packages end up installed, only how:
/// dev-only placement, exact version pinning, or global scope. Anything
/// else in the command is treated as a package name/spec argument.
const PASSTHROUGH_FLAGS: &[&str] = &[
    "-D",
    "--dev",
    "--save-dev",
    "-E",
    "--exact",
    "-g",
    "--global",
    "--save",
    "--save-exact",
];

/// A package command parsed into manager/action/package list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPackageCommand {
    pub manager: String,
    pub action: String,
    pub packages: Vec<String>,
    pub flags: Vec<String>,
}

/// Parse a shell command line into a manager/action/packages/flags tuple.
/// Returns `None` if the command does not look like a recognized package
/// manager invocation (`bun`, `npm`, `pip`/`pip3`, or `cargo`).
pub fn parse_package_command(command: &str) -> Option<ParsedPackageCommand> {
    let tokens = shlex::split(command)?;
    let mut iter = tokens.into_iter();
    let manager_raw = iter.next()?;
    let manager = match manager_raw.as_str() {
        "bun" => "bun",
        "npm" => "npm",
        "pip" | "pip3" => "pip",
        "cargo" => "cargo",
        _ => return None,
    }
    .to_string();

    let action_raw = iter.next()?;
    let action = normalize_action(&manager, &action_raw)?;

    let mut packages = Vec::new();
    let mut flags = Vec::new();
    for tok in iter {
        if tok.starts_with('-') {
            if PASSTHROUGH_FLAGS.contains(&tok.as_str()) {
                flags.push(tok);
            }
            // Unrecognized flags are dropped rather than rejected: the
            // command is still evaluated and run by its original text,
            // this parse only feeds the structured request metadata.
        } else {
            packages.push(tok);
        }
    }

    if packages.is_empty() {
        return None;
    }

    Some(ParsedPackageCommand {
        manager,
        action,
        packages,
        flags,
    })
}

/// The string rule evaluation matches against: `"<manager> <action>
/// <pkg1> <pkg2>..."` using the normalized action (`install`/`remove`),
/// not the manager's native verb. This is distinct from the literal
/// command `build_command` produces for execution.
pub fn match_target(parsed: &ParsedPackageCommand) -> String {
    format!(
        "{} {} {}",
        parsed.manager,
        parsed.action,
        parsed.packages.join(" ")
    )
}

fn normalize_action(manager: &str, action: &str) -> Option<String> {
    let normalized = match (manager, action) {
        ("bun", "add") | ("npm", "install") | ("npm", "i") | ("pip", "install")
        | ("cargo", "add") => "install",
        ("bun", "remove") | ("bun", "rm") | ("npm", "uninstall") | ("npm", "un")
        | ("pip", "uninstall") | ("cargo", "remove") | ("cargo", "rm") => "remove",
        _ => return None,
    };
    Some(normalized.to_string())
}

/// Rebuild the literal command the runner will execute from a parsed
/// request, so the broker never has to keep the original user-supplied
/// string around once it has been classified.
pub fn build_command(parsed: &ParsedPackageCommand) -> String {
    let verb = match (parsed.manager.as_str(), parsed.action.as_str()) {
        ("bun", "install") => "add",
        ("bun", "remove") => "remove",
        ("npm", "install") => "install",
        ("npm", "remove") => "uninstall",
        ("pip", "install") => "install",
        ("pip", "remove") => "uninstall",
        ("cargo", "install") => "add",
        ("cargo", "remove") => "remove",
        _ => parsed.action.as_str(),
    };

    let mut parts = vec![parsed.manager.clone(), verb.to_string()];
    parts.extend(parsed.flags.iter().cloned());
    parts.extend(parsed.packages.iter().cloned());
    parts.join(" ")
}

pub struct PackageBroker {
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
    records: Arc<Mutex<HashMap<String, PackageRequest>>>,
}

impl PackageBroker {
    pub fn new(queue: Arc<PermissionQueue>, config: Arc<ConfigStore>) -> Self {
        PackageBroker {
            queue,
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: &str) -> Option<PackageRequest> {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().get(id).cloned()
    }

    fn store(&self, record: PackageRequest) {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    /// Parse `command`; if it doesn't look like a package-manager
    /// invocation, returns `None` rather than guessing.
    pub async fn submit_package_request(
        &self,
        command: String,
        cwd: Option<String>,
        reason: Option<String>,
        timeout_ms: Option<u64>,
    ) -> Option<PackageRequest> {
        let parsed = parse_package_command(&command)?;
        Some(self.submit_parsed(parsed, cwd, reason, timeout_ms).await)
    }

    /// Structured counterpart to [`Self::submit_package_request`] for
    /// callers (the REST surface, the CLI) that already know the manager,
    /// action and package list rather than a raw shell command line.
    pub async fn submit(
        &self,
        manager: String,
        packages: Vec<String>,
        action: Option<String>,
        cwd: Option<String>,
        reason: Option<String>,
        timeout_ms: Option<u64>,
    ) -> PackageRequest {
        let parsed = ParsedPackageCommand {
            manager,
            action: action.unwrap_or_else(|| "install".to_string()),
            packages,
            flags: Vec::new(),
        };
        self.submit_parsed(parsed, cwd, reason, timeout_ms).await
    }

    async fn submit_parsed(
        &self,
        parsed: ParsedPackageCommand,
        cwd: Option<String>,
        reason: Option<String>,
        timeout_ms: Option<u64>,
    ) -> PackageRequest {
        let rebuilt = build_command(&parsed);
        let target = match_target(&parsed);

        let ruleset = self.config.rules();
        let verdict = evaluate(&ruleset, Category::Packages, &target);

        let record = match verdict {
            Some(Decision::Deny) => {
                let record = PackageRequest {
                    id: format!("pkg-denied-{}", now_ms()),
                    manager: parsed.manager,
                    action: parsed.action,
                    packages: parsed.packages,
                    command: rebuilt,
                    cwd,
                    reason,
                    status: BrokerStatus::Denied,
                    permission_request_id: None,
                    exit_code: None,
                    stdout: None,
                    stderr: None,
                    created_at: now_ms(),
                };
                self.store(record.clone());
                record
            }
            Some(Decision::Allow) => {
                let mut record = PackageRequest {
                    id: format!("pkg-auto-{}", now_ms()),
                    manager: parsed.manager,
                    action: parsed.action,
                    packages: parsed.packages,
                    command: rebuilt.clone(),
                    cwd: cwd.clone(),
                    reason,
                    status: BrokerStatus::Running,
                    permission_request_id: None,
                    exit_code: None,
                    stdout: None,
                    stderr: None,
                    created_at: now_ms(),
                };
                self.store(record.clone());
                run_to_completion(&mut record, &rebuilt, cwd.as_deref(), timeout_ms).await;
                self.store(record.clone());
                record
            }
            None => {
                let mut metadata = Metadata::new();
                metadata.insert("command".to_string(), serde_json::json!(rebuilt));
                metadata.insert("manager".to_string(), serde_json::json!(parsed.manager));
                metadata.insert(
                    "packages".to_string(),
                    serde_json::json!(parsed.packages),
                );

                let (request_id, waiter) = self.queue.request(
                    Category::Packages,
                    rebuilt.clone(),
                    format!("{} {}: {}", parsed.manager, parsed.action, parsed.packages.join(", ")),
                    reason.clone(),
                    metadata,
                );

                let record = PackageRequest {
                    id: request_id.clone(),
                    manager: parsed.manager,
                    action: parsed.action,
                    packages: parsed.packages,
                    command: rebuilt.clone(),
                    cwd: cwd.clone(),
                    reason,
                    status: BrokerStatus::Pending,
                    permission_request_id: Some(request_id.clone()),
                    exit_code: None,
                    stdout: None,
                    stderr: None,
                    created_at: now_ms(),
                };
                self.store(record.clone());

                let records = Arc::clone(&self.records);
                let id = request_id;
                tokio::spawn(async move {
                    let approved = waiter.wait().await;
                    let mut updated = {
                        #[allow(clippy::unwrap_used)]
                        let guard = records.lock().unwrap();
                        guard.get(&id).cloned()
                    };
                    let Some(updated) = updated.as_mut() else {
                        return;
                    };
                    if approved {
                        updated.status = BrokerStatus::Running;
                        run_to_completion(updated, &rebuilt, cwd.as_deref(), timeout_ms).await;
                    } else {
                        updated.status = BrokerStatus::Denied;
                    }
                    #[allow(clippy::unwrap_used)]
                    records.lock().unwrap().insert(id, updated.clone());
                });

                record
            }
        };

        record
    }
}

async fn run_to_completion(
    record: &mut PackageRequest,
    command: &str,
    cwd: Option<&str>,
    timeout_ms: Option<u64>,
) {
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);
    let output = run_shell(command, cwd.map(Path::new), timeout).await;
    record.exit_code = Some(output.exit_code);
    record.stdout = Some(output.stdout);
    record.stderr = Some(output.stderr);
    record.status = if output.timed_out || output.spawn_failed {
        BrokerStatus::Failed
    } else {
        BrokerStatus::Completed
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_config::ConfigStore;
    use mediator_config::RuleKind;
    use mediator_queue::AuditLog;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn parses_npm_install_with_dev_flag() {
        let parsed = parse_package_command("npm install --save-dev left-pad").unwrap();
        assert_eq!(parsed.manager, "npm");
        assert_eq!(parsed.action, "install");
        assert_eq!(parsed.packages, vec!["left-pad".to_string()]);
        assert_eq!(parsed.flags, vec!["--save-dev".to_string()]);
    }

    #[test]
    fn parses_bun_remove() {
        let parsed = parse_package_command("bun remove lodash").unwrap();
        assert_eq!(parsed.manager, "bun");
        assert_eq!(parsed.action, "remove");
        assert_eq!(parsed.packages, vec!["lodash".to_string()]);
    }

    #[test]
    fn drops_unrecognized_flags_but_keeps_packages() {
        let parsed = parse_package_command("pip install --no-cache-dir requests").unwrap();
        assert_eq!(parsed.manager, "pip");
        assert!(parsed.flags.is_empty());
        assert_eq!(parsed.packages, vec!["requests".to_string()]);
    }

    #[test]
    fn rejects_unknown_manager() {
        assert!(parse_package_command("brew install wget").is_none());
    }

    #[test]
    fn build_command_round_trips_to_canonical_verb() {
        let parsed = ParsedPackageCommand {
            manager: "npm".to_string(),
            action: "remove".to_string(),
            packages: vec!["left-pad".to_string()],
            flags: vec![],
        };
        assert_eq!(build_command(&parsed), "npm uninstall left-pad");
    }

    fn broker() -> (tempfile::TempDir, PackageBroker) {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let queue = Arc::new(PermissionQueue::new(dir.path().join("queue.json"), audit));
        let config = Arc::new(ConfigStore::load(
            dir.path().join("sandbox.config.json"),
            dir.path().join("staging.git").to_string_lossy().to_string(),
        ));
        (dir, PackageBroker::new(queue, config))
    }

    #[tokio::test]
    async fn non_package_command_returns_none() {
        let (_dir, broker) = broker();
        assert!(
            broker
                .submit_package_request("echo hi".to_string(), None, None, None)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn denied_by_rule_short_circuits() {
        let (_dir, broker) = broker();
        broker
            .config
            .add_rule(RuleKind::Deny, "packages(npm install left-pad)");
        let record = broker
            .submit_package_request("npm install left-pad".to_string(), None, None, None)
            .await
            .unwrap();
        assert_eq!(record.status, BrokerStatus::Denied);
    }

    #[tokio::test]
    async fn blanket_allow_does_not_bypass_the_queue() {
        let (_dir, broker) = broker();
        broker.config.add_rule(RuleKind::Allow, "packages(*)");
        let record = broker
            .submit_package_request("npm install left-pad".to_string(), None, None, None)
            .await
            .unwrap();
        assert_eq!(record.status, BrokerStatus::Pending);
    }

    #[tokio::test]
    async fn unmatched_command_queues_then_runs_on_approval() {
        let (_dir, broker) = broker();
        let record = broker
            .submit_package_request("cargo add serde".to_string(), None, None, None)
            .await
            .unwrap();
        assert_eq!(record.status, BrokerStatus::Pending);
        let request_id = record.permission_request_id.clone().unwrap();

        broker.queue.deny(&request_id, None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resolved = broker.get(&request_id).unwrap();
        assert_eq!(resolved.status, BrokerStatus::Denied);
    }
}
