//! CONNECT tunneling: once approved, hijack the client connection and
//! pipe bytes bidirectionally to the target for the lifetime of the
//! tunnel. A denial returns a clean 403 instead of ever touching the
//! socket past the initial request line.

use std::sync::Arc;

use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::Uri;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use mediator_config::ConfigStore;
use mediator_queue::PermissionQueue;
use tokio::net::TcpStream;

use crate::body::BoxBody;
use crate::body::denied_body;
use crate::body::empty_body;
use crate::body::response_with;
use crate::policy::ProxyVerdict;
use crate::policy::decide;

/// Parse `host[:port]` out of a CONNECT request's authority-form URI,
/// defaulting to port 443.
pub fn target_addr(uri: &Uri) -> Option<(String, u16)> {
    let authority = uri.authority()?;
    let host = authority.host().to_string();
    let port = authority.port_u16().unwrap_or(443);
    Some((host, port))
}

pub async fn handle_connect(
    req: Request<Incoming>,
    config: Arc<ConfigStore>,
    queue: Arc<PermissionQueue>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let Some((host, port)) = target_addr(req.uri()) else {
        return Ok(response_with(StatusCode::BAD_REQUEST, denied_body(None)));
    };

    let action = format!("CONNECT {host}:{port}");
    match decide(&host, &action, &config, &queue).await {
        ProxyVerdict::Deny { request_id } => Ok(response_with(
            StatusCode::FORBIDDEN,
            denied_body(request_id.as_deref()),
        )),
        ProxyVerdict::Allow => {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => {
                        if let Err(err) = tunnel(upgraded, &host, port).await {
                            tracing::warn!(host, port, error = %err, "CONNECT tunnel failed");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "CONNECT upgrade failed"),
                }
            });
            Ok(Response::new(empty_body()))
        }
    }
}

async fn tunnel(upgraded: Upgraded, host: &str, port: u16) -> std::io::Result<()> {
    let mut server = TcpStream::connect((host, port)).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_host_and_explicit_port() {
        let uri: Uri = "example.com:8443".parse().unwrap();
        assert_eq!(target_addr(&uri), Some(("example.com".to_string(), 8443)));
    }

    #[test]
    fn defaults_to_443_when_port_omitted() {
        let uri: Uri = "example.com".parse().unwrap();
        assert_eq!(target_addr(&uri), Some(("example.com".to_string(), 443)));
    }
}
