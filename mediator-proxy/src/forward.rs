//! Absolute-form HTTP forwarding: the agent's HTTP proxy sends requests
//! with a full `http://host/path` request line rather than hijacking the
//! socket, so a denial can be answered with a plain 403 response.

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use mediator_config::ConfigStore;
use mediator_queue::PermissionQueue;

use crate::body::BoxBody;
use crate::body::denied_body;
use crate::body::empty_body;
use crate::body::response_with;
use crate::policy::ProxyVerdict;
use crate::policy::decide;

pub async fn handle_forward(
    req: Request<Incoming>,
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
    client: &Client<HttpConnector, Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let Some(host) = req.uri().host().map(str::to_string) else {
        return Ok(response_with(StatusCode::BAD_REQUEST, denied_body(None)));
    };

    let action = format!("{} {}", req.method(), req.uri());
    match decide(&host, &action, &config, &queue).await {
        ProxyVerdict::Deny { request_id } => Ok(response_with(
            StatusCode::FORBIDDEN,
            denied_body(request_id.as_deref()),
        )),
        ProxyVerdict::Allow => match client.request(req).await {
            Ok(resp) => Ok(resp.map(|body| body.boxed())),
            Err(err) => {
                tracing::warn!(host, error = %err, "upstream request failed");
                Ok(response_with(StatusCode::BAD_GATEWAY, empty_body()))
            }
        },
    }
}
