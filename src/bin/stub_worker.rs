//! Protocol-conformant stand-in for the native translation worker.
//!
//! Serves the gateway's websocket wire protocol and "translates" by wrapping
//! the input in angle brackets (`hi` -> `<hi>`), which lets tests assert
//! exactly which spans went through a worker. Behavior knobs for failure
//! injection come from the environment so the gateway spawns it exactly like
//! the real binary:
//!
//! - `STUB_WORKER_WARMUP_MS`: report `ready=false` for this long after start.
//! - `STUB_WORKER_TRANS_DELAY_MS`: sleep before answering each `trans`.
//! - `STUB_WORKER_FAIL_ONCE_FILE`: the first process to claim this marker
//!   file answers its first `trans` with `code=503` ("Translation engine not
//!   ready"); replacement processes find the marker and behave normally.
//! - `STUB_WORKER_RECORD_FILE`: append one line per received frame.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use transgate::worker::protocol::{ExitRequest, TransRequest, WsMessage, WsResponse};

/// Accepts the real worker's full CLI surface; flags the stub has no use
/// for are still parsed so the gateway can spawn it unmodified.
#[derive(Parser, Debug)]
#[command(name = "stub-worker", about = "Echo translation worker for tests")]
#[allow(dead_code)]
struct Args {
    #[arg(long)]
    host: String,

    #[arg(long)]
    port: u16,

    #[arg(long, default_value = "warning")]
    log_level: String,

    #[arg(long)]
    model_dir: Option<PathBuf>,

    #[arg(long)]
    model_path: Option<PathBuf>,

    #[arg(long)]
    lexical_shortlist_path: Option<PathBuf>,

    #[arg(long)]
    vocabulary_path: Vec<PathBuf>,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    enable_grpc: bool,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    enable_http: bool,

    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    enable_websocket: bool,

    #[arg(long)]
    grpc_unix_socket: Option<String>,
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

fn record_frame(kind: &str, detail: &str) {
    let Ok(path) = std::env::var("STUB_WORKER_RECORD_FILE") else {
        return;
    };
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "{kind}\t{detail}");
    }
}

/// Claim the fail-once marker. Returns true for the single process instance
/// that should fail its first trans request.
fn claim_fail_once() -> bool {
    let Ok(path) = std::env::var("STUB_WORKER_FAIL_ONCE_FILE") else {
        return false;
    };
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .is_ok()
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    if !args.enable_websocket {
        eprintln!("websocket disabled, nothing to serve");
        std::process::exit(2);
    }

    let started = Instant::now();
    let warmup = env_millis("STUB_WORKER_WARMUP_MS").unwrap_or(Duration::ZERO);
    let fail_first_trans = claim_fail_once();

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    println!("stub worker listening on {}:{}", args.host, args.port);

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(handle_connection(
            stream,
            started,
            warmup,
            fail_first_trans,
        ));
    }
}

async fn handle_connection(
    stream: TcpStream,
    started: Instant,
    warmup: Duration,
    mut fail_first_trans: bool,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    while let Some(msg) = ws.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let Ok(frame) = serde_json::from_str::<WsMessage>(&text) else {
            continue;
        };

        let (resp, exit_after) = match frame.msg_type.as_str() {
            "health" => {
                record_frame("health", "");
                let ready = started.elapsed() >= warmup;
                (
                    WsResponse {
                        msg_type: "health".to_string(),
                        code: 200,
                        msg: "success".to_string(),
                        data: Some(json!({ "ready": ready })),
                    },
                    None,
                )
            }
            "trans" => {
                let req: TransRequest =
                    serde_json::from_value(frame.data).unwrap_or(TransRequest {
                        text: String::new(),
                        html: false,
                    });
                record_frame("trans", &req.text);

                if let Some(delay) = env_millis("STUB_WORKER_TRANS_DELAY_MS") {
                    tokio::time::sleep(delay).await;
                }

                if fail_first_trans {
                    fail_first_trans = false;
                    (
                        WsResponse {
                            msg_type: "trans".to_string(),
                            code: 503,
                            msg: "Translation engine not ready".to_string(),
                            data: None,
                        },
                        None,
                    )
                } else if req.text.is_empty() {
                    (
                        WsResponse {
                            msg_type: "trans".to_string(),
                            code: 400,
                            msg: "text is required".to_string(),
                            data: None,
                        },
                        None,
                    )
                } else {
                    (
                        WsResponse {
                            msg_type: "trans".to_string(),
                            code: 200,
                            msg: "success".to_string(),
                            data: Some(json!({ "translated_text": format!("<{}>", req.text) })),
                        },
                        None,
                    )
                }
            }
            "exit" => {
                let req: ExitRequest =
                    serde_json::from_value(frame.data).unwrap_or(ExitRequest {
                        time: 0,
                        force: true,
                    });
                record_frame("exit", &format!("time={} force={}", req.time, req.force));
                let delay = if req.force { 0 } else { req.time.max(0) as u64 };
                (
                    WsResponse {
                        msg_type: "exit".to_string(),
                        code: 200,
                        msg: "success".to_string(),
                        data: Some(json!({ "message": "shutting down" })),
                    },
                    Some(Duration::from_secs(delay)),
                )
            }
            other => (
                WsResponse {
                    msg_type: other.to_string(),
                    code: 400,
                    msg: format!("unknown message type: {other}"),
                    data: None,
                },
                None,
            ),
        };

        let Ok(encoded) = serde_json::to_string(&resp) else {
            continue;
        };
        if ws.send(Message::Text(encoded)).await.is_err() {
            break;
        }

        if let Some(delay) = exit_after {
            tokio::time::sleep(delay).await;
            std::process::exit(0);
        }
    }
}
