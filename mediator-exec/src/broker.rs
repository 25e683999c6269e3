//! Exec broker: evaluate rules against `exec`, then either deny,
//! auto-run, or queue for human approval. The `exec` category mode is
//! always `approve-each` (hardened), so a `null` rule verdict always
//! falls through to the queue.

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
use mediator_protocol::ExecRequest;
use mediator_protocol::Metadata;
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

pub struct ExecBroker {
    queue: Arc<PermissionQueue>,
    config: Arc<ConfigStore>,
    records: Arc<Mutex<HashMap<String, ExecRequest>>>,
}

impl ExecBroker {
    pub fn new(queue: Arc<PermissionQueue>, config: Arc<ConfigStore>) -> Self {
        ExecBroker {
            queue,
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get(&self, id: &str) -> Option<ExecRequest> {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().get(id).cloned()
    }

    fn store(&self, record: ExecRequest) {
        #[allow(clippy::unwrap_used)]
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    pub async fn submit_exec(
        &self,
        command: String,
        cwd: Option<String>,
        reason: Option<String>,
        timeout_ms: Option<u64>,
    ) -> ExecRequest {
        let ruleset = self.config.rules();
        let verdict = evaluate(&ruleset, Category::Exec, &command);

        match verdict {
            Some(Decision::Deny) => {
                let record = ExecRequest {
                    id: format!("exec-denied-{}", now_ms()),
                    command,
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
                let id = format!("exec-auto-{}", now_ms());
                let mut record = ExecRequest {
                    id: id.clone(),
                    command: command.clone(),
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
                run_to_completion(&mut record, &command, cwd.as_deref(), timeout_ms).await;
                self.store(record.clone());
                record
            }
            None => {
                let mut metadata = Metadata::new();
                metadata.insert("command".to_string(), serde_json::json!(command));
                if let Some(ref cwd) = cwd {
                    metadata.insert("cwd".to_string(), serde_json::json!(cwd));
                }

                let (request_id, waiter) = self.queue.request(
                    Category::Exec,
                    command.clone(),
                    format!("Run command: {command}"),
                    reason.clone(),
                    metadata,
                );

                let record = ExecRequest {
                    id: request_id.clone(),
                    command: command.clone(),
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
                        run_to_completion(updated, &command, cwd.as_deref(), timeout_ms).await;
                    } else {
                        updated.status = BrokerStatus::Denied;
                    }
                    #[allow(clippy::unwrap_used)]
                    records.lock().unwrap().insert(id, updated.clone());
                });

                record
            }
        }
    }
}

async fn run_to_completion(
    record: &mut ExecRequest,
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
