//! Worker subprocess supervision.
//!
//! A [`WorkerDaemon`] owns exactly one child process running the native
//! translation worker binary. Starting it launches three cooperative tasks:
//! two line readers that capture stdout/stderr into a bounded ring buffer,
//! and a wait-monitor that observes process exit and flips the running flag.
//! Stop is graceful-then-forced: SIGTERM, a 100 ms poll loop, and a kill
//! after the budget expires.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_LOG_LINES: usize = 1000;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RESTART_DELAY: Duration = Duration::from_millis(500);
const KILL_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Errors from subprocess lifecycle operations.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("worker already running")]
    AlreadyRunning,

    #[error("worker binary not found at {0}")]
    BinaryMissing(PathBuf),

    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker stop timeout, forced kill")]
    StopTimeout,

    #[error("worker not running")]
    NotRunning,
}

/// Spawn parameters for a worker subprocess: what binary to run, where, and
/// which wire surfaces to enable. The websocket channel must stay on; it is
/// the only transport the gateway speaks.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub host: String,
    pub port: u16,
    pub work_dir: PathBuf,
    pub model_dir: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub lexical_path: Option<PathBuf>,
    pub vocab_paths: Vec<PathBuf>,
    pub enable_grpc: bool,
    pub enable_http: bool,
    pub enable_websocket: bool,
    pub grpc_unix_socket: Option<String>,
    pub log_level: String,
    pub binary_path: PathBuf,
}

impl WorkerArgs {
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8988,
            work_dir: PathBuf::from("."),
            model_dir: None,
            model_path: None,
            lexical_path: None,
            vocab_paths: Vec::new(),
            enable_grpc: false,
            enable_http: false,
            enable_websocket: true,
            grpc_unix_socket: None,
            log_level: "warning".to_string(),
            binary_path,
        }
    }

    /// Build the worker command line. Model files are passed either as one
    /// `--model-dir` or as explicit model/lexical/vocabulary paths.
    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];

        if let Some(dir) = &self.model_dir {
            args.push("--model-dir".to_string());
            args.push(dir.display().to_string());
        } else if let Some(model) = &self.model_path {
            args.push("--model-path".to_string());
            args.push(model.display().to_string());
            if let Some(lex) = &self.lexical_path {
                args.push("--lexical-shortlist-path".to_string());
                args.push(lex.display().to_string());
            }
            for vocab in &self.vocab_paths {
                args.push("--vocabulary-path".to_string());
                args.push(vocab.display().to_string());
            }
        }

        args.push("--enable-grpc".to_string());
        args.push(self.enable_grpc.to_string());
        args.push("--enable-http".to_string());
        args.push(self.enable_http.to_string());
        args.push("--enable-websocket".to_string());
        args.push(self.enable_websocket.to_string());

        if let Some(socket) = &self.grpc_unix_socket {
            args.push("--grpc-unix-socket".to_string());
            args.push(socket.clone());
        }

        args
    }
}

/// Coarse process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    NotStarted,
    Running,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonStatus::NotStarted => write!(f, "not_started"),
            DaemonStatus::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Default)]
struct ProcState {
    running: bool,
    pid: Option<u32>,
}

/// Bounded log buffer with oldest-eviction; readers take snapshot copies.
struct LogRing {
    lines: VecDeque<String>,
    max: usize,
}

impl LogRing {
    fn new(max: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max),
            max,
        }
    }

    fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max {
            self.lines.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// One supervised worker subprocess.
pub struct WorkerDaemon {
    args: WorkerArgs,
    id: String,
    proc: Arc<Mutex<ProcState>>,
    logs: Arc<Mutex<LogRing>>,
    done: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerDaemon {
    pub fn new(args: WorkerArgs) -> Self {
        let id = format!("mt-worker-{}", args.port);
        Self {
            args,
            id,
            proc: Arc::new(Mutex::new(ProcState::default())),
            logs: Arc::new(Mutex::new(LogRing::new(MAX_LOG_LINES))),
            done: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn args(&self) -> &WorkerArgs {
        &self.args
    }

    /// Spawn the worker process and begin log capture.
    pub fn start(&self) -> Result<(), DaemonError> {
        let mut proc = self.proc.lock();
        if proc.running {
            return Err(DaemonError::AlreadyRunning);
        }

        if !self.args.binary_path.is_file() {
            return Err(DaemonError::BinaryMissing(self.args.binary_path.clone()));
        }

        debug!(worker = %self.id, port = self.args.port, "starting worker");

        let mut cmd = Command::new(&self.args.binary_path);
        cmd.args(self.args.build_args())
            .current_dir(&self.args.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(DaemonError::Spawn)?;

        let stdout = match child.stdout.take() {
            Some(pipe) => pipe,
            None => {
                let _ = child.start_kill();
                return Err(DaemonError::Spawn(std::io::Error::other(
                    "stdout pipe unavailable",
                )));
            }
        };
        let stderr = match child.stderr.take() {
            Some(pipe) => pipe,
            None => {
                let _ = child.start_kill();
                return Err(DaemonError::Spawn(std::io::Error::other(
                    "stderr pipe unavailable",
                )));
            }
        };

        let pid = child.id();
        proc.running = true;
        proc.pid = pid;
        drop(proc);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(collect_logs(
            stdout,
            "INFO",
            Arc::clone(&self.logs),
            self.done.clone(),
        )));
        tasks.push(tokio::spawn(collect_logs(
            stderr,
            "ERROR",
            Arc::clone(&self.logs),
            self.done.clone(),
        )));
        tasks.push(tokio::spawn(monitor_process(
            child,
            self.id.clone(),
            Arc::clone(&self.proc),
        )));

        debug!(worker = %self.id, pid = ?pid, "worker started");
        Ok(())
    }

    /// Graceful stop: SIGTERM, poll every 100 ms for up to 10 s, then kill.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        let pid = {
            let proc = self.proc.lock();
            match (proc.running, proc.pid) {
                (true, Some(pid)) => pid,
                _ => return Err(DaemonError::NotRunning),
            }
        };

        debug!(worker = %self.id, "stopping worker");
        if let Err(e) = terminate(pid) {
            warn!(worker = %self.id, error = %e, "failed to send SIGTERM to worker");
        }

        self.await_exit(pid, STOP_TIMEOUT).await
    }

    /// Stop (errors logged, not fatal), a settling delay, then start again.
    pub async fn restart(&self) -> Result<(), DaemonError> {
        if let Err(e) = self.stop().await {
            warn!(worker = %self.id, error = %e, "failed to stop worker during restart");
        }

        tokio::time::sleep(RESTART_DELAY).await;

        self.start()
    }

    pub fn status(&self) -> DaemonStatus {
        let proc = self.proc.lock();
        if proc.running && proc.pid.is_some() {
            DaemonStatus::Running
        } else {
            DaemonStatus::NotStarted
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == DaemonStatus::Running
    }

    /// Snapshot of recently captured output lines.
    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().snapshot()
    }

    /// Stop the process if needed (5 s budget before force kill), then join
    /// the log and monitor tasks. Safe to call more than once.
    pub async fn cleanup(&self) {
        let pid = {
            let proc = self.proc.lock();
            if proc.running { proc.pid } else { None }
        };

        if let Some(pid) = pid {
            debug!(worker = %self.id, "stopping worker during cleanup");
            if let Err(e) = terminate(pid) {
                warn!(worker = %self.id, error = %e, "failed to send SIGTERM during cleanup");
            }
            if let Err(e) = self.await_exit(pid, CLEANUP_STOP_TIMEOUT).await {
                warn!(worker = %self.id, error = %e, "worker did not exit cleanly during cleanup");
            }
        } else {
            debug!(worker = %self.id, "worker not running during cleanup");
        }

        // Cancellation is idempotent, so repeated cleanup calls are safe.
        self.done.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Poll the running flag until the monitor observes exit, force-killing
    /// once the budget is exhausted.
    async fn await_exit(&self, pid: u32, budget: Duration) -> Result<(), DaemonError> {
        let deadline = Instant::now() + budget;
        let mut ticker = tokio::time::interval(STOP_POLL_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if !self.proc.lock().running {
                debug!(worker = %self.id, "worker stopped");
                return Ok(());
            }

            if Instant::now() >= deadline {
                let still_running = self.proc.lock().running;
                if still_running {
                    warn!(worker = %self.id, "worker stop timeout, forcing kill");
                    if let Err(e) = kill(pid) {
                        warn!(worker = %self.id, error = %e, "failed to kill worker");
                    }
                }
                tokio::time::sleep(KILL_SETTLE_DELAY).await;
                return Err(DaemonError::StopTimeout);
            }
        }
    }
}

async fn collect_logs<R: AsyncRead + Unpin>(
    pipe: R,
    level: &'static str,
    logs: Arc<Mutex<LogRing>>,
    done: CancellationToken,
) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let stamped = format!(
                        "[{}] [{}] {}",
                        Local::now().format("%Y-%m-%d %H:%M:%S"),
                        level,
                        line
                    );
                    logs.lock().push(stamped);
                }
                // Channel closed or read error: the process is gone.
                Ok(None) | Err(_) => return,
            }
        }
    }
}

async fn monitor_process(mut child: Child, id: String, proc: Arc<Mutex<ProcState>>) {
    let status = child.wait().await;

    let mut p = proc.lock();
    if p.running {
        p.running = false;
        p.pid = None;
        match status {
            Ok(s) if s.success() => debug!(worker = %id, "worker process exited normally"),
            Ok(s) => warn!(worker = %id, status = %s, "worker process exited unexpectedly"),
            Err(e) => warn!(worker = %id, error = %e, "failed to wait on worker process"),
        }
    }
}

#[cfg(unix)]
fn signal_process(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> std::io::Result<()> {
    signal_process(pid, libc::SIGTERM)
}

#[cfg(unix)]
fn kill(pid: u32) -> std::io::Result<()> {
    signal_process(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::other("graceful terminate not supported on this platform"))
}

#[cfg(not(unix))]
fn kill(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::other("kill not supported on this platform"))
}
