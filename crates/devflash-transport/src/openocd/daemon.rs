//! Daemon subprocess lifecycle
//!
//! Owns one OpenOCD process per adapter: spawn with a generated argument
//! list, detect startup by the control port opening, and shut down either
//! gracefully through the control client or by killing the process. Restarts
//! of the same adapter are throttled with a randomized gap because some
//! probes wedge when re-opened too quickly.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::telnet::ControlClient;
use crate::DAEMON_STARTUP_TIMEOUT;

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Bounds of the randomized stop-to-start gap.
pub const MIN_RESTART_GAP: Duration = Duration::from_secs(1);

/// Upper bound of the randomized stop-to-start gap.
pub const MAX_RESTART_GAP: Duration = Duration::from_secs(3);

/// Lifecycle state of the daemon subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No process
    Stopped,
    /// Spawned, control port not yet open
    Starting,
    /// Control port answered
    Running,
    /// Shutdown in progress
    Stopping,
}

/// Shared per-adapter record of the last daemon stop, for restart throttling.
pub type RestartGate = Arc<Mutex<Option<Instant>>>;

/// One OpenOCD subprocess.
pub struct OpenOcdDaemon {
    binary: PathBuf,
    control_port: u16,
    state: DaemonState,
    child: Option<Child>,
    restart_gate: RestartGate,
    startup_timeout: Duration,
}

impl OpenOcdDaemon {
    /// Daemon bound to one control port, sharing a restart gate with other
    /// daemons for the same adapter.
    pub fn new(binary: impl Into<PathBuf>, control_port: u16, restart_gate: RestartGate) -> Self {
        Self {
            binary: binary.into(),
            control_port,
            state: DaemonState::Stopped,
            child: None,
            restart_gate,
            startup_timeout: DAEMON_STARTUP_TIMEOUT,
        }
    }

    /// Shorten the startup detection window (used by tests).
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Control port this daemon listens on.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Spawn the daemon and wait for its control port to open.
    pub async fn start(&mut self, args: &[String]) -> Result<(), TransportError> {
        if self.state != DaemonState::Stopped {
            return Err(TransportError::ControlProtocol(format!(
                "daemon start requested in state {:?}",
                self.state
            )));
        }

        self.throttle_restart().await;
        self.state = DaemonState::Starting;

        debug!(binary = %self.binary.display(), ?args, "Starting daemon");
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                self.state = DaemonState::Stopped;
                TransportError::OpenFailed {
                    device: self.binary.display().to_string(),
                    reason: err.to_string(),
                }
            })?;
        self.child = Some(child);

        // Collect stderr in the background so exit diagnostics are useful.
        let stderr_buffer = Arc::new(std::sync::Mutex::new(String::new()));
        if let Some(stderr) = self.child.as_mut().and_then(|c| c.stderr.take()) {
            let buffer = Arc::clone(&stderr_buffer);
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut stderr = stderr;
                let mut collected = String::new();
                let _ = stderr.read_to_string(&mut collected).await;
                if let Ok(mut guard) = buffer.lock() {
                    *guard = collected;
                }
            });
        }

        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    self.state = DaemonState::Stopped;
                    self.record_stop().await;
                    let stderr = stderr_buffer
                        .lock()
                        .map(|guard| guard.clone())
                        .unwrap_or_default();
                    return Err(TransportError::DaemonExitedUnexpectedly {
                        status: format!("{status}: {}", stderr.trim()),
                    });
                }
            }

            if TcpStream::connect(("127.0.0.1", self.control_port)).await.is_ok() {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(port = self.control_port, "Daemon startup timed out");
                self.kill_and_wait().await;
                self.record_stop().await;
                return Err(TransportError::DaemonStartTimeout {
                    port: self.control_port,
                    timeout: self.startup_timeout,
                });
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }

        self.state = DaemonState::Running;
        info!(port = self.control_port, "Daemon running");
        Ok(())
    }

    /// Stop the daemon: through the control client when it is connected and
    /// idle, by signal otherwise. Always waits for the process to exit.
    pub async fn stop(&mut self, client: Option<&mut ControlClient>) -> Result<(), TransportError> {
        if self.child.is_none() {
            self.state = DaemonState::Stopped;
            return Ok(());
        }
        self.state = DaemonState::Stopping;

        let mut graceful = false;
        if let Some(client) = client {
            if client.is_idle() {
                debug!("Requesting daemon shutdown over the control connection");
                graceful = client.send_line("shutdown").await.is_ok();
            }
            client.disconnect().await;
        }

        if !graceful {
            if let Some(child) = self.child.as_mut() {
                let _ = child.start_kill();
            }
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Daemon exited"),
                Ok(Err(err)) => warn!(%err, "Waiting for daemon exit failed"),
                Err(_) => {
                    warn!("Daemon ignored shutdown; killing it");
                    let _ = child.kill().await;
                }
            }
        }

        self.record_stop().await;
        self.state = DaemonState::Stopped;
        Ok(())
    }

    async fn kill_and_wait(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.state = DaemonState::Stopped;
    }

    async fn record_stop(&self) {
        *self.restart_gate.lock().await = Some(Instant::now());
    }

    /// Sleep out the randomized minimum gap since this adapter's last
    /// daemon stop.
    async fn throttle_restart(&self) {
        let last_stop = *self.restart_gate.lock().await;
        if let Some(last_stop) = last_stop {
            let gap_ms = rand::thread_rng()
                .gen_range(MIN_RESTART_GAP.as_millis() as u64..=MAX_RESTART_GAP.as_millis() as u64);
            let gap = Duration::from_millis(gap_ms);
            let elapsed = last_stop.elapsed();
            if elapsed < gap {
                let wait = gap - elapsed;
                debug!(?wait, "Throttling daemon restart");
                tokio::time::sleep(wait).await;
            }
        }
    }
}
