//! Decision pipeline shared by the CONNECT tunnel path and the
//! absolute-form HTTP forward path (§4.5): bypass list, then rules, then
//! category mode, then (for `approve-each`) the permission queue.

use std::sync::Arc;

use mediator_config::ConfigStore;
use mediator_protocol::Category;
use mediator_protocol::CategoryMode;
use mediator_protocol::Metadata;
use mediator_queue::PermissionQueue;
use mediator_rules::Decision;
use mediator_rules::evaluate;

/// Outcome of the decision pipeline for a single proxied request.
#[derive(Debug, Clone)]
pub enum ProxyVerdict {
    Allow,
    Deny { request_id: Option<String> },
}

/// Decide whether a network request to `host` (extracted from the
/// CONNECT authority or the absolute-form URI) should proceed. `action`
/// is the rule-matching/queue-display string, e.g. `"CONNECT
/// host:port"` or `"GET https://host/path"`.
pub async fn decide(
    host: &str,
    action: &str,
    config: &Arc<ConfigStore>,
    queue: &Arc<PermissionQueue>,
) -> ProxyVerdict {
    if config.is_endpoint_allowed(host) {
        tracing::debug!(host, "network request allowed by bypass list");
        return ProxyVerdict::Allow;
    }

    let ruleset = config.rules();
    match evaluate(&ruleset, Category::Network, host) {
        Some(Decision::Deny) => return ProxyVerdict::Deny { request_id: None },
        Some(Decision::Allow) => return ProxyVerdict::Allow,
        None => {}
    }

    match config.get_category_mode(Category::Network) {
        CategoryMode::AllowAll => ProxyVerdict::Allow,
        CategoryMode::DenyAll => ProxyVerdict::Deny { request_id: None },
        // Bulk approval is made through the UI, not per-connection: the
        // proxy path treats it as pass-through (§9 open question).
        CategoryMode::ApproveBulk => ProxyVerdict::Allow,
        CategoryMode::ApproveEach => {
            let mut metadata = Metadata::new();
            metadata.insert("host".to_string(), serde_json::json!(host));
            let (id, waiter) = queue.request(
                Category::Network,
                action.to_string(),
                format!("Network request to {host}"),
                None,
                metadata,
            );
            if waiter.wait().await {
                ProxyVerdict::Allow
            } else {
                ProxyVerdict::Deny {
                    request_id: Some(id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_config::RuleKind;
    use mediator_protocol::ResolvedBy;
    use mediator_queue::AuditLog;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn deps() -> (tempfile::TempDir, Arc<ConfigStore>, Arc<PermissionQueue>) {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path().join("audit.log"));
        let queue = Arc::new(PermissionQueue::new(dir.path().join("queue.json"), audit));
        let config = Arc::new(ConfigStore::load(
            dir.path().join("sandbox.config.json"),
            dir.path().join("staging.git").to_string_lossy().to_string(),
        ));
        (dir, config, queue)
    }

    #[tokio::test]
    async fn bypass_list_allows_without_queueing() {
        let (_dir, config, queue) = deps();
        config.add_allowed_endpoint("example.com");
        let verdict = decide("api.example.com", "CONNECT api.example.com:443", &config, &queue).await;
        assert!(matches!(verdict, ProxyVerdict::Allow));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn deny_rule_short_circuits() {
        let (_dir, config, queue) = deps();
        config.add_rule(RuleKind::Deny, "network(evil.example.com)");
        let verdict = decide("evil.example.com", "CONNECT evil.example.com:443", &config, &queue).await;
        assert!(matches!(verdict, ProxyVerdict::Deny { request_id: None }));
    }

    #[tokio::test]
    async fn allow_all_mode_skips_the_queue() {
        let (_dir, config, queue) = deps();
        config.set_category_mode(Category::Network, CategoryMode::AllowAll);
        let verdict = decide("anything.example.com", "CONNECT anything.example.com:443", &config, &queue).await;
        assert!(matches!(verdict, ProxyVerdict::Allow));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn deny_all_mode_denies_without_request_id() {
        let (_dir, config, queue) = deps();
        config.set_category_mode(Category::Network, CategoryMode::DenyAll);
        let verdict = decide("anything.example.com", "CONNECT anything.example.com:443", &config, &queue).await;
        assert!(matches!(verdict, ProxyVerdict::Deny { request_id: None }));
    }

    #[tokio::test]
    async fn approve_bulk_mode_is_pass_through() {
        let (_dir, config, queue) = deps();
        config.set_category_mode(Category::Network, CategoryMode::ApproveBulk);
        let verdict = decide("anything.example.com", "CONNECT anything.example.com:443", &config, &queue).await;
        assert!(matches!(verdict, ProxyVerdict::Allow));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn approve_each_queues_and_waits_for_decision() {
        let (_dir, config, queue) = deps();
        let queue_for_task = Arc::clone(&queue);
        let config_for_task = Arc::clone(&config);
        let handle = tokio::spawn(async move {
            decide(
                "new.example.com",
                "CONNECT new.example.com:443",
                &config_for_task,
                &queue_for_task,
            )
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        queue.approve(&pending[0].id, Some(ResolvedBy::Web));

        let verdict = handle.await.unwrap();
        assert!(matches!(verdict, ProxyVerdict::Allow));
    }

    #[tokio::test]
    async fn approve_each_denial_carries_the_request_id() {
        let (_dir, config, queue) = deps();
        let queue_for_task = Arc::clone(&queue);
        let config_for_task = Arc::clone(&config);
        let handle = tokio::spawn(async move {
            decide(
                "new.example.com",
                "CONNECT new.example.com:443",
                &config_for_task,
                &queue_for_task,
            )
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pending = queue.pending();
        queue.deny(&pending[0].id, Some(ResolvedBy::Web));

        let verdict = handle.await.unwrap();
        match verdict {
            ProxyVerdict::Deny { request_id } => assert_eq!(request_id, Some(pending[0].id.clone())),
            ProxyVerdict::Allow => panic!("expected denial"),
        }
    }
}
