//! Minimal HTTP surface over the dispatcher.
//!
//! One JSON translate endpoint plus health and language listing; vendor
//! compatibility layers live outside this crate. Shutdown is orderly: the
//! server drains on SIGINT/SIGTERM and the worker pools are cleaned up
//! before the process exits.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::error::TranslateError;

#[derive(Debug, Deserialize)]
pub struct TranslatePayload {
    #[serde(default = "default_from")]
    pub from: String,
    pub to: String,
    pub text: String,
    #[serde(default)]
    pub html: bool,
}

fn default_from() -> String {
    "auto".to_string()
}

#[derive(Debug, Serialize)]
pub struct TranslateReply {
    pub result: String,
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    error: String,
}

/// Build the gateway router.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/translate", post(translate))
        .route("/health", get(health))
        .route("/languages", get(languages))
        .with_state(dispatcher)
}

/// Run the HTTP server until a termination signal, then clean up the pools.
pub async fn serve(settings: Arc<Settings>, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let app = router(Arc::clone(&dispatcher));
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(addr = %addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, cleaning up workers");
    dispatcher.cleanup_all().await;

    Ok(())
}

async fn translate(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(payload): Json<TranslatePayload>,
) -> Response {
    if payload.text.is_empty() {
        return error_response(&TranslateError::InvalidRequest(
            "text is required".to_string(),
        ));
    }

    let token = CancellationToken::new();
    match dispatcher
        .translate(&token, &payload.from, &payload.to, &payload.text, payload.html)
        .await
    {
        Ok(result) => Json(TranslateReply { result }).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn languages(State(dispatcher): State<Arc<Dispatcher>>) -> Json<Vec<String>> {
    Json(dispatcher.supported_languages().into_iter().collect())
}

fn error_response(e: &TranslateError) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorReply {
            error: e.to_string(),
        }),
    )
        .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_defaults() {
        let payload: TranslatePayload =
            serde_json::from_str(r#"{"to":"de","text":"hello"}"#).unwrap();
        assert_eq!(payload.from, "auto");
        assert_eq!(payload.to, "de");
        assert!(!payload.html);
    }

    #[test]
    fn error_statuses_map_to_http() {
        let resp = error_response(&TranslateError::InvalidRequest("empty".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = error_response(&TranslateError::ModelMissing {
            from: "de".into(),
            to: "fr".into(),
        });
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = error_response(&TranslateError::InsufficientMemory {
            available_mb: 1024,
            required_mb: 6144,
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = error_response(&TranslateError::StartTimeout);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
