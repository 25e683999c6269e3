//! `watch`: connect to the control plane's WebSocket, print events, and
//! accept stdin commands `a <id> | d <id> | A <cat> | D <cat> | q`.
//!
//! Grounded on the WebSocket client loop in the pack's
//! `alfredjeanlab-oddjobs` daemon (`adapters/agent/docker/ws.rs`):
//! `futures_util::StreamExt::split`, a `tokio::select!` over the socket
//! and a second input source. Reconnects with exponential backoff on
//! drop, since an operator's terminal watching a long-running mediator
//! session is the primary use of this subcommand.

use std::time::Duration;

use anyhow::Result;
use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::stream::SplitSink;
use mediator_protocol::WsClientMessage;
use mediator_protocol::WsMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::client::ApiClient;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

enum StdinCommand {
    Quit,
    Approve(String),
    Deny(String),
    BulkApprove(String),
    BulkDeny(String),
}

pub async fn run(client: &ApiClient) -> Result<()> {
    let ws_url = client.ws_url();
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match run_once(client, &ws_url).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                eprintln!("watch: connection lost ({err}), reconnecting in {backoff:?}...");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn run_once(client: &ApiClient, ws_url: &str) -> Result<()> {
    let (ws_stream, _) = connect_async(ws_url).await?;
    println!("connected to {ws_url}");
    let (mut write, mut read) = ws_stream.split();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => print_event(&text),
                    Some(Ok(Message::Close(_))) | None => anyhow::bail!("server closed the connection"),
                    Some(Err(err)) => return Err(err.into()),
                    _ => {}
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                match parse_stdin_command(line.trim()) {
                    Some(StdinCommand::Quit) => return Ok(()),
                    Some(StdinCommand::Approve(id)) => {
                        send_ws(&mut write, WsClientMessage::Approve { id, always_allow: None }).await?;
                    }
                    Some(StdinCommand::Deny(id)) => {
                        send_ws(&mut write, WsClientMessage::Deny { id, always_deny: None }).await?;
                    }
                    Some(StdinCommand::BulkApprove(category)) => {
                        match client.bulk(&category, "approved").await {
                            Ok(n) => println!("approved {n} {category} request(s)"),
                            Err(err) => eprintln!("bulk approve failed: {err}"),
                        }
                    }
                    Some(StdinCommand::BulkDeny(category)) => {
                        match client.bulk(&category, "denied").await {
                            Ok(n) => println!("denied {n} {category} request(s)"),
                            Err(err) => eprintln!("bulk deny failed: {err}"),
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

fn parse_stdin_command(line: &str) -> Option<StdinCommand> {
    let mut parts = line.splitn(2, ' ');
    let verb = parts.next()?;
    let arg = parts.next().unwrap_or("").trim().to_string();
    match verb {
        "q" => Some(StdinCommand::Quit),
        "a" if !arg.is_empty() => Some(StdinCommand::Approve(arg)),
        "d" if !arg.is_empty() => Some(StdinCommand::Deny(arg)),
        "A" if !arg.is_empty() => Some(StdinCommand::BulkApprove(arg)),
        "D" if !arg.is_empty() => Some(StdinCommand::BulkDeny(arg)),
        _ => None,
    }
}

fn print_event(text: &str) {
    let Ok(msg) = serde_json::from_str::<WsMessage>(text) else {
        return;
    };
    match msg {
        WsMessage::Init { pending, .. } => {
            println!("connected; {} pending request(s)", pending.len());
            for req in pending {
                println!("  {} {} {}", req.id, req.category, req.action);
            }
        }
        WsMessage::Request(req) => println!("+ {} {} {}", req.id, req.category, req.action),
        WsMessage::Resolve(req) => {
            let by = req.resolved_by.map(|b| b.to_string()).unwrap_or_default();
            println!("= {} {:?} ({by})", req.id, req.status);
        }
        WsMessage::Rules(_) => println!("* rules updated"),
        WsMessage::Shutdown { reason } => println!("! server shutting down: {reason}"),
    }
}

async fn send_ws(write: &mut WsWrite, msg: WsClientMessage) -> Result<()> {
    let text = serde_json::to_string(&msg)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}
