//! Server Process Management
//!
//! Spawns the server binary, captures its stdio into bounded tail
//! buffers for diagnostics, waits for the readiness line, and tears the
//! process down by signal on dispose.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ServerOptions;

use super::ClientError;

/// How much of each stdio stream to retain for diagnostics.
const STDIO_TAIL_BYTES: usize = 8 * 1024;

/// How long the server gets to report readiness.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL on dispose.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Bounded byte buffer keeping the most recent output.
pub(crate) struct TailBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl TailBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.data.len() == self.capacity {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.data.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

/// A spawned and monitored server process.
pub struct ServerProcess {
    child: Child,
    port: u16,
    stdout_tail: Arc<Mutex<TailBuffer>>,
    stderr_tail: Arc<Mutex<TailBuffer>>,
}

impl ServerProcess {
    /// Spawn the server binary and wait for its readiness line.
    pub async fn spawn(
        binary: impl AsRef<Path>,
        options: &ServerOptions,
    ) -> Result<Self, ClientError> {
        let options_json = serde_json::to_string(options)
            .map_err(|e| ClientError::SpawnFailed(format!("failed to encode options: {e}")))?;

        let mut command = Command::new(binary.as_ref());
        // Argv compatibility: extension path first when present, then
        // the options JSON.
        if let Some(extension) = &options.gdx_extension_path {
            command.arg(extension);
        }
        command
            .arg(&options_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ClientError::SpawnFailed(e.to_string()))?;
        debug!("Spawned server process (pid {:?})", child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::SpawnFailed("stderr not captured".to_string()))?;

        let stdout_tail = Arc::new(Mutex::new(TailBuffer::new(STDIO_TAIL_BYTES)));
        let stderr_tail = Arc::new(Mutex::new(TailBuffer::new(STDIO_TAIL_BYTES)));

        let (ready_tx, ready_rx) = oneshot::channel::<u16>();
        let stdout_buffer = stdout_tail.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_buffer.lock().push(line.as_bytes());
                stdout_buffer.lock().push(b"\n");
                if let Some(tx) = ready_tx.take() {
                    match parse_ready_line(&line) {
                        Some(port) => {
                            let _ = tx.send(port);
                        }
                        None => ready_tx = Some(tx),
                    }
                }
            }
        });

        let stderr_buffer = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_buffer.lock().push(line.as_bytes());
                stderr_buffer.lock().push(b"\n");
            }
        });

        // An exit before ready closes stdout, which drops the sender;
        // no separate wait on the child is needed here.
        let port = match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(port)) => port,
            Ok(Err(_)) => {
                let _ = child.start_kill();
                return Err(ClientError::StartupFailed {
                    stderr: stderr_tail.lock().contents(),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(ClientError::ReadyTimeout);
            }
        };

        debug!("Server ready on port {}", port);
        Ok(Self {
            child,
            port,
            stdout_tail,
            stderr_tail,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Recent stderr output, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().contents()
    }

    /// Recent stdout output, for diagnostics.
    pub fn stdout_tail(&self) -> String {
        self.stdout_tail.lock().contents()
    }

    /// Stop the server: SIGTERM, then SIGKILL after a grace period.
    pub async fn dispose(mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(status) => debug!("Server exited: {:?}", status),
            Err(_) => {
                warn!("Server did not exit within {:?}, killing", TERM_GRACE);
                let _ = self.child.kill().await;
            }
        }
    }
}

fn parse_ready_line(line: &str) -> Option<u16> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    if value.get("type")?.as_str()? != "ready" {
        return None;
    }
    u16::try_from(value.get("port")?.as_u64()?).ok()
}
