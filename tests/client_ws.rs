//! Transport client tests against in-process websocket servers.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use transgate::worker::protocol::{ExitRequest, TransRequest, WsMessage, WsResponse};
use transgate::worker::{ClientError, WsClient};

type ServerWs = WebSocketStream<TcpStream>;

/// Bind an ephemeral websocket server that hands the accepted connection to
/// `handler`, and return the client URL.
async fn mock_ws_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await
            && let Ok(ws) = accept_async(stream).await
        {
            handler(ws).await;
        }
    });

    format!("ws://{addr}/ws")
}

async fn read_frame(ws: &mut ServerWs) -> Option<WsMessage> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn send_response(ws: &mut ServerWs, resp: WsResponse) {
    let encoded = serde_json::to_string(&resp).unwrap();
    let _ = ws.send(Message::Text(encoded)).await;
}

async fn handle_echo(mut ws: ServerWs) {
    while let Some(msg) = read_frame(&mut ws).await {
        send_response(
            &mut ws,
            WsResponse {
                msg_type: msg.msg_type,
                code: 200,
                msg: "success".to_string(),
                data: Some(msg.data),
            },
        )
        .await;
    }
}

async fn handle_health(mut ws: ServerWs, ready: bool) {
    if read_frame(&mut ws).await.is_some() {
        send_response(
            &mut ws,
            WsResponse {
                msg_type: "health".to_string(),
                code: 200,
                msg: "success".to_string(),
                data: Some(json!({ "ready": ready })),
            },
        )
        .await;
    }
}

async fn handle_trans(mut ws: ServerWs) {
    while let Some(msg) = read_frame(&mut ws).await {
        let req: TransRequest = serde_json::from_value(msg.data).unwrap_or(TransRequest {
            text: String::new(),
            html: false,
        });

        let resp = if req.text.is_empty() {
            WsResponse {
                msg_type: "trans".to_string(),
                code: 400,
                msg: "text is required".to_string(),
                data: None,
            }
        } else {
            WsResponse {
                msg_type: "trans".to_string(),
                code: 200,
                msg: "success".to_string(),
                data: Some(json!({ "translated_text": format!("translated: {}", req.text) })),
            }
        };
        send_response(&mut ws, resp).await;
    }
}

#[tokio::test]
async fn connect_succeeds() {
    let url = mock_ws_server(handle_echo).await;
    let client = WsClient::new(url);

    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.close().await;
}

#[tokio::test]
async fn connect_twice_is_idempotent() {
    let url = mock_ws_server(handle_echo).await;
    let client = WsClient::new(url);

    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.close().await;
}

#[tokio::test]
async fn health_ready() {
    let url = mock_ws_server(|ws| handle_health(ws, true)).await;
    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let ready = client.health(&token).await.unwrap();
    assert!(ready);
    client.close().await;
}

#[tokio::test]
async fn health_not_ready() {
    let url = mock_ws_server(|ws| handle_health(ws, false)).await;
    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let ready = client.health(&token).await.unwrap();
    assert!(!ready);
    client.close().await;
}

#[tokio::test]
async fn health_engine_error_carries_code() {
    let url = mock_ws_server(|mut ws: ServerWs| async move {
        if read_frame(&mut ws).await.is_some() {
            send_response(
                &mut ws,
                WsResponse {
                    msg_type: "health".to_string(),
                    code: 503,
                    msg: "Translation engine not ready".to_string(),
                    data: None,
                },
            )
            .await;
        }
    })
    .await;

    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let err = client.health(&token).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("code 503"), "message: {msg}");
    assert!(msg.contains("Translation engine not ready"), "message: {msg}");
    client.close().await;
}

#[tokio::test]
async fn trans_returns_translated_text() {
    let url = mock_ws_server(handle_trans).await;
    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let result = client
        .trans(
            &token,
            TransRequest {
                text: "Hello".to_string(),
                html: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(result, "translated: Hello");
    client.close().await;
}

#[tokio::test]
async fn trans_empty_text_surfaces_worker_error() {
    let url = mock_ws_server(handle_trans).await;
    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let err = client
        .trans(
            &token,
            TransRequest {
                text: String::new(),
                html: false,
            },
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("text is required"));
    client.close().await;
}

#[tokio::test]
async fn request_timeout_disconnects_client() {
    // Server accepts but never answers.
    let url = mock_ws_server(|_ws: ServerWs| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let client = WsClient::with_timeout(url, Duration::from_millis(100));
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    match client.health(&token).await {
        Err(ClientError::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn cancellation_disconnects_client() {
    let url = mock_ws_server(|_ws: ServerWs| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    match client.health(&token).await {
        Err(ClientError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn request_without_connect_is_not_connected() {
    let client = WsClient::new("ws://127.0.0.1:1/ws");

    let token = CancellationToken::new();
    match client.health(&token).await {
        Err(ClientError::NotConnected) => {}
        other => panic!("expected NotConnected, got {other:?}"),
    }
}

#[tokio::test]
async fn exit_returns_message() {
    let url = mock_ws_server(|mut ws: ServerWs| async move {
        if read_frame(&mut ws).await.is_some() {
            send_response(
                &mut ws,
                WsResponse {
                    msg_type: "exit".to_string(),
                    code: 200,
                    msg: "success".to_string(),
                    data: Some(json!({ "message": "Shutdown initiated" })),
                },
            )
            .await;
        }
    })
    .await;

    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    let resp = client
        .exit(&token, ExitRequest { time: 0, force: true })
        .await
        .unwrap();

    assert_eq!(resp.message, "Shutdown initiated");
    client.close().await;
}

#[tokio::test]
async fn multiple_requests_on_one_connection() {
    let url = mock_ws_server(handle_trans).await;
    let client = WsClient::new(url);
    client.connect().await.unwrap();

    let token = CancellationToken::new();
    for i in 1..=3 {
        let result = client
            .trans(
                &token,
                TransRequest {
                    text: format!("Test {i}"),
                    html: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(result, format!("translated: Test {i}"));
    }
    client.close().await;
}
