//! End-to-end tests driving the real listener: a client configured to use
//! the proxy sends absolute-form HTTP requests and CONNECT tunnels
//! through it, and we assert on what actually reaches (or doesn't reach)
//! the upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use mediator_config::ConfigStore;
use mediator_protocol::Category;
use mediator_protocol::CategoryMode;
use mediator_proxy::ProxyServer;
use mediator_queue::AuditLog;
use mediator_queue::PermissionQueue;
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

async fn spawn_proxy(mode: CategoryMode) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let audit = AuditLog::new(dir.path().join("audit.log"));
    let queue = Arc::new(PermissionQueue::new(dir.path().join("queue.json"), audit));
    let config = Arc::new(ConfigStore::load(
        dir.path().join("sandbox.config.json"),
        dir.path().join("staging.git").to_string_lossy().to_string(),
    ));
    config.set_category_mode(Category::Network, mode);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = ProxyServer::new(config, queue);
    tokio::spawn(async move {
        let _ = server.run(addr).await;
    });
    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    (addr, dir)
}

#[tokio::test]
async fn allow_all_mode_forwards_absolute_form_request() {
    #![allow(clippy::unwrap_used)]

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let (proxy_addr, _dir) = spawn_proxy(CategoryMode::AllowAll).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap();

    let resp = client
        .get(format!("{}/hello", upstream.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn deny_all_mode_returns_403_for_forward_path() {
    #![allow(clippy::unwrap_used)]

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (proxy_addr, _dir) = spawn_proxy(CategoryMode::DenyAll).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap();

    let resp = client
        .get(format!("{}/hello", upstream.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn deny_all_mode_closes_connect_tunnel_with_403() {
    #![allow(clippy::unwrap_used)]

    let (proxy_addr, _dir) = spawn_proxy(CategoryMode::DenyAll).await;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::https(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap();

    // The target host doesn't need to exist: the proxy must deny the
    // CONNECT before ever dialing it.
    let result = client.get("https://deny.invalid.example/").send().await;
    assert!(result.is_err(), "expected the CONNECT tunnel to be refused");
}
