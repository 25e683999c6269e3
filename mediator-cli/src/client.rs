//! Thin REST client over the control plane's `/api/*` surface. Grounded on
//! the teacher's `reqwest::Client::new()` + builder-chain usage in
//! `codex-login` for talking to an external HTTP API.

use anyhow::Context;
use anyhow::Result;
use mediator_protocol::PermissionRequest;
use mediator_protocol::RuleSet;
use serde::Deserialize;
use serde_json::json;

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct QueueListResponse {
    pub pending: Vec<PermissionRequest>,
    #[allow(dead_code)]
    pub recent: Vec<PermissionRequest>,
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    rules: RuleSet,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct RuleMutationResponse {
    added: bool,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        ApiClient {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base.trim_end_matches('/'))
    }

    /// `http(s)://host[:port]` rewritten to `ws(s)://host[:port]/ws`.
    pub fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base.clone()
        };
        format!("{}/ws", ws_base.trim_end_matches('/'))
    }

    pub async fn queue(&self) -> Result<QueueListResponse> {
        self.http
            .get(self.url("/api/queue"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("decoding /api/queue response")
    }

    pub async fn approve(&self, id: &str) -> Result<()> {
        self.http
            .post(self.url(&format!("/api/queue/{id}/approve")))
            .json(&json!({"resolvedBy": "cli"}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn deny(&self, id: &str) -> Result<()> {
        self.http
            .post(self.url(&format!("/api/queue/{id}/deny")))
            .json(&json!({"resolvedBy": "cli"}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn bulk(&self, category: &str, status: &str) -> Result<usize> {
        let resp: CountResponse = self
            .http
            .post(self.url("/api/queue/bulk"))
            .json(&json!({"category": category, "status": status, "resolvedBy": "cli"}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.count)
    }

    pub async fn rules(&self) -> Result<RuleSet> {
        let resp: RulesResponse = self
            .http
            .get(self.url("/api/rules"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.rules)
    }

    pub async fn add_allow_rule(&self, rule: &str) -> Result<bool> {
        let resp: RuleMutationResponse = self
            .http
            .post(self.url("/api/rules"))
            .json(&json!({"type": "allow", "rule": rule}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.added)
    }
}
