//! TCP listener plus hyper http1 connection driver. Each inbound
//! connection gets its own `service_fn` that dispatches to the CONNECT
//! tunnel handler or the absolute-form forward handler depending on the
//! request method; both share the same decision pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::Method;
use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use mediator_config::ConfigStore;
use mediator_queue::PermissionQueue;
use tokio::net::TcpListener;

use crate::connect::handle_connect;
use crate::forward::handle_forward;

/// The inbound network proxy listener (default port 3701 at the control
/// plane layer; this crate just takes whatever `SocketAddr` it is given).
pub struct ProxyServer {
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
}

impl ProxyServer {
    pub fn new(config: Arc<ConfigStore>, queue: Arc<PermissionQueue>) -> Self {
        ProxyServer { config, queue }
    }

    /// Bind `addr` and serve forever, one task per accepted connection.
    /// Returns only on a listener bind/accept error.
    pub async fn run(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "network proxy listening");
        let client: Client<HttpConnector, Incoming> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let config = Arc::clone(&self.config);
            let queue = Arc::clone(&self.queue);
            let client = client.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let config = Arc::clone(&config);
                    let queue = Arc::clone(&queue);
                    let client = client.clone();
                    async move {
                        if req.method() == Method::CONNECT {
                            handle_connect(req, config, queue).await
                        } else {
                            handle_forward(req, config, queue, &client).await
                        }
                    }
                });

                let conn = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(err) = conn.await {
                    tracing::debug!(%peer, error = %err, "proxy connection closed with error");
                }
            });
        }
    }
}
