//! PTY backend for shell sessions.
//!
//! Spawns a shell under a pseudo-terminal pair and pumps its output to the
//! session router from a blocking read loop. This is the primary backend;
//! when PTY spawning is unavailable the manager falls back to the
//! subprocess backend permanently for the rest of the process lifetime.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;

use super::backend::ChannelRole;
use super::{SessionError, SessionRouter};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Initial terminal geometry before the presentation layer resizes.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// A shell process attached to a pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle, used for resize and reader cloning.
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,

    /// Input writer toward the shell.
    writer: Mutex<Box<dyn Write + Send>>,

    /// The child process, shared with the blocking wait in the read loop.
    child: Arc<std::sync::Mutex<Box<dyn Child + Send + Sync>>>,

    /// Whether the process is still considered running.
    running: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawns a shell under a fresh PTY pair.
    pub fn spawn(
        shell: &str,
        working_directory: &str,
        role: ChannelRole,
    ) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(working_directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("TERMHUB_CHANNEL", role.env_value());

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            master: std::sync::Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Arc::new(std::sync::Mutex::new(child)),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes input bytes to the shell. PTY shells echo on their own, so no
    /// normalization or local echo is applied here.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Starts the blocking read loop that pumps PTY output into the router.
    ///
    /// The loop runs until EOF or a read error, then resolves the exit code
    /// and reports it through the router.
    pub fn start_read_loop(&self, router: SessionRouter) {
        let reader = {
            let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
            match master.try_clone_reader() {
                Ok(reader) => reader,
                Err(e) => {
                    tracing::error!(error = %e, "failed to clone PTY reader");
                    self.running.store(false, Ordering::SeqCst);
                    router.deliver_exit(-1);
                    return;
                }
            }
        };

        let running = Arc::clone(&self.running);
        let child = Arc::clone(&self.child);

        tokio::spawn(async move {
            let reader = Arc::new(std::sync::Mutex::new(reader));

            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let reader_clone = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader_clone.lock().unwrap_or_else(|e| e.into_inner());
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None),
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        router.deliver(&data);
                    }
                    Ok(Ok(None)) => {
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(Err(e)) => {
                        if running.load(Ordering::SeqCst) {
                            tracing::debug!(error = %e, "PTY read ended");
                        }
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "PTY read task panicked");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }

            let code = tokio::task::spawn_blocking(move || wait_exit_code(&child))
                .await
                .unwrap_or(-1);
            router.deliver_exit(code);
        });
    }

    /// Kills the process and returns its exit code.
    pub async fn kill(&self) -> Result<i32, SessionError> {
        self.running.store(false, Ordering::SeqCst);

        let child = Arc::clone(&self.child);
        tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                // Already-exited processes report an error here; fall through
                // to wait for the real status.
                tracing::debug!(error = %e, "kill signal failed");
            }
            child
                .wait()
                .map(|status| status.exit_code() as i32)
                .map_err(|e| SessionError::KillFailed(e.to_string()))
        })
        .await
        .map_err(|e| SessionError::KillFailed(e.to_string()))?
    }
}

/// Resolves the exit code after EOF. The process has usually been reaped by
/// the time the reader sees EOF, so poll briefly before a blocking wait.
fn wait_exit_code(child: &std::sync::Mutex<Box<dyn Child + Send + Sync>>) -> i32 {
    let mut child = child.lock().unwrap_or_else(|e| e.into_inner());

    for _ in 0..200 {
        match child.try_wait() {
            Ok(Some(status)) => return status.exit_code() as i32,
            Ok(None) => std::thread::sleep(std::time::Duration::from_millis(10)),
            Err(_) => return -1,
        }
    }

    child
        .wait()
        .map(|status| status.exit_code() as i32)
        .unwrap_or(-1)
}
