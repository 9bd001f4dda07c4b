//! Plain-subprocess fallback backend for shell sessions.
//!
//! Used when the PTY backend is unavailable. The shell runs with piped
//! stdio, so there is no terminal geometry and console-style shells do not
//! echo input on the driving pipe; this backend echoes locally for those and
//! normalizes line endings per shell family.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::backend::{ChannelRole, ShellFamily};
use super::{SessionError, SessionRouter};

/// Buffer size for reading from the child's pipes.
const READ_BUFFER_SIZE: usize = 4096;

/// Parts handed to the pump tasks when the read loop starts.
struct PumpParts {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    exit_tx: watch::Sender<Option<i32>>,
}

/// A shell process driven over plain pipes.
pub struct SubprocessProcess {
    family: ShellFamily,
    stdin: Mutex<ChildStdin>,
    running: Arc<AtomicBool>,
    kill_token: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
    parts: std::sync::Mutex<Option<PumpParts>>,
    router: OnceLock<SessionRouter>,
}

impl SubprocessProcess {
    /// Spawns the shell with piped stdio.
    pub fn spawn(
        shell: &str,
        working_directory: &str,
        role: ChannelRole,
        family: ShellFamily,
    ) -> Result<Self, SessionError> {
        let mut child = Command::new(shell)
            .current_dir(working_directory)
            .env("TERMHUB_CHANNEL", role.env_value())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("missing stderr pipe".to_string()))?;

        let (exit_tx, exit_rx) = watch::channel(None);

        Ok(Self {
            family,
            stdin: Mutex::new(stdin),
            running: Arc::new(AtomicBool::new(true)),
            kill_token: CancellationToken::new(),
            exit_rx,
            parts: std::sync::Mutex::new(Some(PumpParts {
                child,
                stdout,
                stderr,
                exit_tx,
            })),
            router: OnceLock::new(),
        })
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes input to the shell, normalizing line endings for the target
    /// family and locally echoing for console-style shells.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let normalized = normalize_input(data, self.family);

        // Console-style shells do not echo input arriving on a pipe, so the
        // presentation layer would show nothing the user typed.
        if self.family == ShellFamily::Cmd {
            if let Some(router) = self.router.get() {
                router.deliver(&normalized);
            }
        }

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&normalized)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Starts the pump tasks: stdout and stderr are forwarded to the router
    /// in read order, and the exit code is delivered once both pipes drain.
    pub fn start_read_loop(&self, router: SessionRouter) {
        let Some(parts) = self
            .parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::warn!("subprocess read loop already started");
            return;
        };

        let _ = self.router.set(router.clone());

        let stdout_task = tokio::spawn(pump_pipe(parts.stdout, router.clone()));
        let stderr_task = tokio::spawn(pump_pipe(parts.stderr, router.clone()));

        let running = Arc::clone(&self.running);
        let token = self.kill_token.clone();
        let mut child = parts.child;
        let exit_tx = parts.exit_tx;

        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
                }
            };

            // Drain remaining buffered output before announcing the exit so
            // subscribers never observe Exit ahead of the final chunks.
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            running.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(Some(code));
            router.deliver_exit(code);
        });
    }

    /// Kills the process and returns its exit code.
    pub async fn kill(&self) -> Result<i32, SessionError> {
        self.running.store(false, Ordering::SeqCst);
        self.kill_token.cancel();

        let mut exit_rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *exit_rx.borrow_and_update() {
                return Ok(code);
            }
            if exit_rx.changed().await.is_err() {
                return Err(SessionError::KillFailed(
                    "exit watcher dropped before reporting".to_string(),
                ));
            }
        }
    }
}

/// Forwards one pipe to the router until EOF.
async fn pump_pipe<R>(mut pipe: R, router: SessionRouter)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => router.deliver(&buffer[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "subprocess pipe read ended");
                break;
            }
        }
    }
}

/// Normalizes input line endings for the target shell family.
///
/// Cmd-style shells require `\r\n`; POSIX shells and PowerShell read `\n`
/// from a pipe, so carriage returns sent by terminal-style frontends are
/// rewritten.
pub(crate) fn normalize_input(data: &[u8], family: ShellFamily) -> Vec<u8> {
    match family {
        ShellFamily::Cmd => {
            let mut out = Vec::with_capacity(data.len() + 2);
            let mut i = 0;
            while i < data.len() {
                match data[i] {
                    b'\r' if data.get(i + 1) == Some(&b'\n') => {
                        out.extend_from_slice(b"\r\n");
                        i += 2;
                    }
                    b'\r' | b'\n' => {
                        out.extend_from_slice(b"\r\n");
                        i += 1;
                    }
                    byte => {
                        out.push(byte);
                        i += 1;
                    }
                }
            }
            out
        }
        ShellFamily::Posix | ShellFamily::PowerShell => {
            let mut out = Vec::with_capacity(data.len());
            let mut i = 0;
            while i < data.len() {
                match data[i] {
                    b'\r' if data.get(i + 1) == Some(&b'\n') => {
                        out.push(b'\n');
                        i += 2;
                    }
                    b'\r' => {
                        out.push(b'\n');
                        i += 1;
                    }
                    byte => {
                        out.push(byte);
                        i += 1;
                    }
                }
            }
            out
        }
    }
}
