//! Websocket client for the worker wire protocol.
//!
//! One client owns one duplex text-framed connection. The protocol carries no
//! correlation IDs: exactly one response follows each request, in order, so
//! the connection mutex is held across the write and the read of a single
//! request. Concurrency comes from pooling managers, not from multiplexing
//! one connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::{
    ExitRequest, ExitResponse, HealthResponse, TransRequest, TransResponse, WsMessage, WsResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport-level errors. The display strings double as the classification
/// surface for connection-error detection, so they are stable.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to marshal request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("failed to read response: {0}")]
    Read(String),

    #[error("request timeout")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("{op} failed (code {code}): {msg}")]
    Status {
        op: &'static str,
        code: i64,
        msg: String,
    },
}

/// Client for one worker connection.
pub struct WsClient {
    url: String,
    timeout: Duration,
    conn: tokio::sync::Mutex<Option<WsStream>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl WsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the websocket connection. Calling this on an already-connected
    /// client is a no-op success.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut conn = self.conn.lock().await;
        if self.connected.load(Ordering::SeqCst) && conn.is_some() {
            return Ok(());
        }

        let (stream, _) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ClientError::Connect("handshake timeout".to_string()))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        *conn = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the connection. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut stream) = self.conn.lock().await.take() {
            let _ = stream.close(None).await;
        }
    }

    /// Send one request frame and read one response frame under the
    /// connection lock. Any I/O failure, timeout, or cancellation flips the
    /// client to not-connected; the manager treats that as a worker loss.
    async fn send_request(
        &self,
        token: &CancellationToken,
        msg_type: &str,
        data: Value,
    ) -> Result<WsResponse, ClientError> {
        let frame = serde_json::to_string(&WsMessage {
            msg_type: msg_type.to_string(),
            data,
        })
        .map_err(ClientError::Encode)?;

        eprintln!("DEBUG: send_request start, connected={}", self.connected.load(Ordering::SeqCst));
        let mut conn = self.conn.lock().await;
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let stream = conn.as_mut().ok_or(ClientError::NotConnected)?;

        let exchange = async {
            stream
                .send(Message::Text(frame))
                .await
                .map_err(|e| ClientError::Send(e.to_string()))?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<WsResponse>(&text)
                            .map_err(|e| ClientError::Read(format!("invalid frame: {e}")));
                    }
                    Some(Ok(Message::Close(c))) => { eprintln!("DEBUG: got close frame: {c:?}"); return Err(ClientError::Read("connection closed".to_string())); }
                    None => { eprintln!("DEBUG: stream ended (None)"); return Err(ClientError::Read("connection closed".to_string())); }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => { eprintln!("DEBUG: stream.next() errored: {e:?}"); return Err(ClientError::Read(e.to_string())); },
                }
            }
        };

        let result = tokio::select! {
            _ = token.cancelled() => Err(ClientError::Cancelled),
            res = tokio::time::timeout(self.timeout, exchange) => {
                res.unwrap_or(Err(ClientError::Timeout))
            }
        };

        if result.is_err() {
            // The response for this request may still be in flight, so the
            // connection can no longer be correlated; drop it.
            self.connected.store(false, Ordering::SeqCst);
        }

        result
    }

    /// Probe the worker: `code == 200` means the transport is alive, `ready`
    /// reports whether the translation engine is loaded.
    pub async fn health(&self, token: &CancellationToken) -> Result<bool, ClientError> {
        let resp = self
            .send_request(token, "health", Value::Object(Default::default()))
            .await?;

        if resp.code != 200 {
            return Err(ClientError::Status {
                op: "health check",
                code: resp.code,
                msg: resp.msg,
            });
        }

        let result: HealthResponse = match resp.data {
            Some(data) => serde_json::from_value(data)
                .map_err(|e| ClientError::Read(format!("invalid health payload: {e}")))?,
            None => HealthResponse::default(),
        };

        Ok(result.ready)
    }

    /// Translate one piece of text.
    pub async fn trans(
        &self,
        token: &CancellationToken,
        req: TransRequest,
    ) -> Result<String, ClientError> {
        debug!(text_len = req.text.len(), html = req.html, "sending trans request");
        let data = serde_json::to_value(&req).map_err(ClientError::Encode)?;
        let resp = self.send_request(token, "trans", data).await?;

        if resp.code != 200 {
            return Err(ClientError::Status {
                op: "trans",
                code: resp.code,
                msg: resp.msg,
            });
        }

        let result: TransResponse = match resp.data {
            Some(data) => serde_json::from_value(data)
                .map_err(|e| ClientError::Read(format!("invalid trans payload: {e}")))?,
            None => TransResponse::default(),
        };

        Ok(result.translated_text)
    }

    /// Ask the worker to shut itself down.
    pub async fn exit(
        &self,
        token: &CancellationToken,
        req: ExitRequest,
    ) -> Result<ExitResponse, ClientError> {
        let data = serde_json::to_value(&req).map_err(ClientError::Encode)?;
        let resp = self.send_request(token, "exit", data).await?;

        if resp.code != 200 {
            return Err(ClientError::Status {
                op: "exit",
                code: resp.code,
                msg: resp.msg,
            });
        }

        let result = match resp.data {
            Some(data) => serde_json::from_value(data)
                .map_err(|e| ClientError::Read(format!("invalid exit payload: {e}")))?,
            None => ExitResponse { message: resp.msg },
        };

        Ok(result)
    }
}
