//! Worker lifecycle manager.
//!
//! A [`WorkerManager`] composes one [`WorkerDaemon`] and one [`WsClient`] and
//! layers a state machine on top:
//!
//! ```text
//! Stopped -> Starting -> Running -> Restarting -> Running
//!                 \          \            \
//!                  +----------+------------+--> Stopped
//! ```
//!
//! The manager is `Running` only while the daemon process is alive, the
//! client is connected, and the last readiness probe succeeded. Connection
//! failures trigger an in-place restart on the same port; while restarting,
//! translate calls fail fast with a transient error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{is_connection_error_message, TranslateError};

use super::client::{ClientError, WsClient};
use super::daemon::{DaemonError, WorkerArgs, WorkerDaemon};
use super::protocol::TransRequest;

const START_TIMEOUT: Duration = Duration::from_secs(10);
const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);
const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(200);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PORT_RELEASE_DELAY: Duration = Duration::from_secs(1);

/// Manager lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Stopped => write!(f, "stopped"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Restarting => write!(f, "restarting"),
        }
    }
}

struct Inner {
    state: WorkerState,
    daemon: Arc<WorkerDaemon>,
    client: Option<Arc<WsClient>>,
    closed: bool,
}

/// One worker subprocess plus the policy that keeps it serving.
pub struct WorkerManager {
    url: String,
    args: WorkerArgs,
    inner: Mutex<Inner>,
    // Size-1 token: the wire protocol correlates responses by order, so at
    // most one request may be in flight per client connection. A semaphore
    // rather than a mutex so queued callers observe cancellation.
    task_token: Semaphore,
}

impl fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerManager")
            .field("url", &self.url)
            .field("port", &self.args.port)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl WorkerManager {
    pub fn new(args: WorkerArgs) -> Arc<Self> {
        let url = format!("ws://{}:{}/ws", args.host, args.port);
        let daemon = Arc::new(WorkerDaemon::new(args.clone()));
        Arc::new(Self {
            url,
            args,
            inner: Mutex::new(Inner {
                state: WorkerState::Stopped,
                daemon,
                client: None,
                closed: false,
            }),
            task_token: Semaphore::new(1),
        })
    }

    /// The worker endpoint. Stable across restarts: a replacement worker is
    /// always started on the same port.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.args.port
    }

    pub fn status(&self) -> WorkerState {
        self.inner.lock().state
    }

    /// Snapshot of the underlying worker's captured output.
    pub fn logs(&self) -> Vec<String> {
        let daemon = Arc::clone(&self.inner.lock().daemon);
        daemon.logs()
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == WorkerState::Running
            && inner.daemon.is_running()
            && inner
                .client
                .as_ref()
                .map(|c| c.is_connected())
                .unwrap_or(false)
    }

    /// Spawn the worker and gate on readiness within a 10 s budget.
    pub async fn start(&self) -> Result<(), TranslateError> {
        let daemon = {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Stopped {
                return Err(TranslateError::InvalidState);
            }
            inner.state = WorkerState::Starting;
            Arc::clone(&inner.daemon)
        };

        if let Err(e) = daemon.start() {
            self.inner.lock().state = WorkerState::Stopped;
            return Err(TranslateError::WorkerFatal(e.to_string()));
        }

        match self
            .await_ready(&daemon, START_TIMEOUT, START_POLL_INTERVAL)
            .await
        {
            Some(client) => {
                let mut inner = self.inner.lock();
                inner.client = Some(client);
                inner.state = WorkerState::Running;
                Ok(())
            }
            None => {
                let _ = self.stop().await;
                Err(TranslateError::StartTimeout)
            }
        }
    }

    /// Poll until the daemon is up, the client connects, and a health probe
    /// reports ready. Returns the connected client, or None on timeout.
    async fn await_ready(
        &self,
        daemon: &WorkerDaemon,
        budget: Duration,
        interval: Duration,
    ) -> Option<Arc<WsClient>> {
        let deadline = Instant::now() + budget;
        let mut ticker = tokio::time::interval(interval);
        let mut client: Option<Arc<WsClient>> = None;

        loop {
            ticker.tick().await;

            if Instant::now() >= deadline {
                return None;
            }

            if !daemon.is_running() {
                continue;
            }

            let c = match &client {
                Some(c) => Arc::clone(c),
                None => {
                    let c = Arc::new(WsClient::new(self.url.clone()));
                    client = Some(Arc::clone(&c));
                    c
                }
            };

            if !c.is_connected() && c.connect().await.is_err() {
                // Keep retrying silently until the worker starts listening.
                continue;
            }

            if probe_health(&c).await {
                return Some(c);
            }
        }
    }

    /// Translate one request through the worker.
    ///
    /// Serialized per manager by the size-1 task token; a connection-class
    /// failure triggers an asynchronous in-place restart and surfaces as a
    /// transient error the dispatcher may retry elsewhere.
    pub async fn translate(
        self: &Arc<Self>,
        token: &CancellationToken,
        req: TransRequest,
    ) -> Result<String, TranslateError> {
        if self.inner.lock().state != WorkerState::Running {
            return Err(TranslateError::NotRunning);
        }

        let _permit = tokio::select! {
            permit = self.task_token.acquire() => {
                permit.map_err(|_| TranslateError::NotRunning)?
            }
            _ = token.cancelled() => return Err(TranslateError::Cancelled),
        };

        // Recheck after the (possibly long) queue wait.
        let client = {
            let inner = self.inner.lock();
            if inner.closed || inner.state != WorkerState::Running {
                return Err(TranslateError::NotRunning);
            }
            inner.client.clone()
        };

        let client = match client {
            Some(client) => client,
            None => {
                error!(port = self.args.port, "client not initialized while running");
                self.trigger_restart_async();
                return Err(TranslateError::WorkerTransient(
                    "client not initialized".to_string(),
                ));
            }
        };

        match client.trans(token, req).await {
            Ok(result) => Ok(result),
            Err(ClientError::Cancelled) => Err(TranslateError::Cancelled),
            Err(e) => {
                let msg = e.to_string();
                debug!(port = self.args.port, error = %msg, "trans failed");

                let is_connection_error =
                    !client.is_connected() || is_connection_error_message(&msg);

                if is_connection_error {
                    self.trigger_restart_async();
                    Err(TranslateError::WorkerTransient(msg))
                } else {
                    Err(TranslateError::WorkerFatal(msg))
                }
            }
        }
    }

    /// Move `Running -> Restarting` and restart in the background. No-op if
    /// a restart is already in flight or the manager is stopped, so repeated
    /// concurrent failure reports collapse onto one restart.
    pub fn trigger_restart_async(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, WorkerState::Restarting | WorkerState::Stopped) {
                return;
            }
            inner.state = WorkerState::Restarting;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            info!(port = manager.args.port, "async restart triggered for worker");
            if let Err(e) = manager.restart_worker().await {
                error!(port = manager.args.port, error = %e, "async restart failed");
                manager.inner.lock().state = WorkerState::Stopped;
            } else {
                info!(port = manager.args.port, "async restart completed");
            }
        });
    }

    /// Kill-and-replace on the same port. The old daemon and client are
    /// detached first; nothing may reuse them after this point.
    pub async fn restart_worker(&self) -> Result<(), TranslateError> {
        let old_daemon = {
            let mut inner = self.inner.lock();
            if let Some(client) = inner.client.take() {
                tokio::spawn(async move { client.close().await });
            }
            Arc::clone(&inner.daemon)
        };

        info!(port = self.args.port, "stopping old worker");
        old_daemon.cleanup().await;

        // Give the OS time to release the port before rebinding it.
        tokio::time::sleep(PORT_RELEASE_DELAY).await;

        // The exited instance is unusable; build a fresh daemon on the same
        // args (and therefore the same port).
        let new_daemon = Arc::new(WorkerDaemon::new(self.args.clone()));
        self.inner.lock().daemon = Arc::clone(&new_daemon);

        info!(port = self.args.port, "starting replacement worker");
        new_daemon
            .start()
            .map_err(|e| TranslateError::WorkerFatal(e.to_string()))?;

        match self
            .await_ready(&new_daemon, RESTART_TIMEOUT, RESTART_POLL_INTERVAL)
            .await
        {
            Some(client) => {
                let mut inner = self.inner.lock();
                inner.client = Some(client);
                inner.state = WorkerState::Running;
                Ok(())
            }
            None => {
                if let Err(e) = new_daemon.stop().await {
                    warn!(port = self.args.port, error = %e, "failed to stop unready worker");
                }
                self.inner.lock().state = WorkerState::Stopped;
                Err(TranslateError::RestartTimeout)
            }
        }
    }

    /// Current readiness as reported by the worker itself.
    pub async fn health(&self, token: &CancellationToken) -> Result<bool, TranslateError> {
        let client = self
            .inner
            .lock()
            .client
            .clone()
            .ok_or(TranslateError::NotRunning)?;

        match client.health(token).await {
            Ok(ready) => Ok(ready),
            Err(ClientError::Cancelled) => Err(TranslateError::Cancelled),
            Err(e) => Err(TranslateError::WorkerTransient(e.to_string())),
        }
    }

    /// Stop the worker and drop the client.
    pub async fn stop(&self) -> Result<(), TranslateError> {
        let (client, daemon) = {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Stopped;
            (inner.client.take(), Arc::clone(&inner.daemon))
        };

        if let Some(client) = client {
            client.close().await;
        }

        match daemon.stop().await {
            Ok(()) | Err(DaemonError::NotRunning) => Ok(()),
            Err(e) => Err(TranslateError::WorkerFatal(format!(
                "failed to stop worker: {e}"
            ))),
        }
    }

    /// Full teardown: stop, close, and join the daemon's capture tasks.
    /// Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let (client, daemon) = {
            let mut inner = self.inner.lock();
            inner.state = WorkerState::Stopped;
            inner.closed = true;
            (inner.client.take(), Arc::clone(&inner.daemon))
        };

        if let Some(client) = client {
            client.close().await;
        }

        daemon.cleanup().await;
    }
}

/// Run one health probe with its own 1 s sub-deadline. The probe's
/// cancellation is observed inside the client so the connection state stays
/// coherent even when the deadline fires mid-request.
async fn probe_health(client: &WsClient) -> bool {
    let token = CancellationToken::new();
    let probe = client.health(&token);
    tokio::pin!(probe);

    tokio::select! {
        res = &mut probe => matches!(res, Ok(true)),
        _ = tokio::time::sleep(HEALTH_PROBE_TIMEOUT) => {
            token.cancel();
            let _ = probe.await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_manager() -> Arc<WorkerManager> {
        let mut args = WorkerArgs::new(PathBuf::from("/nonexistent/worker"));
        args.port = 9107;
        WorkerManager::new(args)
    }

    #[test]
    fn url_is_derived_from_args() {
        let manager = test_manager();
        assert_eq!(manager.url(), "ws://127.0.0.1:9107/ws");
        assert_eq!(manager.port(), 9107);
    }

    #[test]
    fn starts_stopped() {
        let manager = test_manager();
        assert_eq!(manager.status(), WorkerState::Stopped);
        assert_eq!(manager.status().to_string(), "stopped");
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn translate_rejected_when_stopped() {
        let manager = test_manager();
        let token = CancellationToken::new();
        let req = TransRequest {
            text: "hello".to_string(),
            html: false,
        };
        match manager.translate(&token, req).await {
            Err(TranslateError::NotRunning) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_with_missing_binary_reverts_to_stopped() {
        let manager = test_manager();
        match manager.start().await {
            Err(TranslateError::WorkerFatal(msg)) => {
                assert!(msg.contains("not found"));
            }
            other => panic!("expected WorkerFatal, got {other:?}"),
        }
        assert_eq!(manager.status(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn second_start_while_starting_is_invalid() {
        let manager = test_manager();
        manager.inner.lock().state = WorkerState::Starting;
        match manager.start().await {
            Err(TranslateError::InvalidState) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn trigger_restart_is_noop_when_stopped() {
        let manager = test_manager();
        manager.trigger_restart_async();
        assert_eq!(manager.status(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let manager = test_manager();
        manager.cleanup().await;
        manager.cleanup().await;
        assert_eq!(manager.status(), WorkerState::Stopped);
    }
}
