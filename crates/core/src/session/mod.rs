//! Shell session management.
//!
//! This module owns the lifecycle of shell-backed channels: backend
//! selection (PTY vs subprocess fallback), spawning, input routing, resize,
//! capture, and teardown. Output is pushed to the presentation layer through
//! a single multiplexed event channel keyed by session id.

pub mod backend;
pub mod manager;
pub mod pty;
pub mod subprocess;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;

pub use backend::{BackendKind, BackendSelector, ChannelRole, ShellFamily};
pub use manager::{SessionInfo, ShellSessionManager};

/// Unique identifier for a shell session, assigned by the caller.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A live session already exists under this id.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The session limit from configuration was reached.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// Failed to spawn the session's process on every available backend.
    #[error("failed to spawn session process: {0}")]
    SpawnFailed(String),

    /// Failed to write to the session's input.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),
}

/// Events pushed to the presentation layer.
///
/// All sessions share one broadcast channel; events carry the session id.
/// Delivery is fire-and-forget: a lagging subscriber drops the oldest events
/// rather than stalling the producing read loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A chunk of output produced by the session's process.
    Output { id: SessionId, data: String },
    /// The session's process terminated.
    Exit { id: SessionId, code: i32 },
}

/// Retention cap for the capture buffer. Older bytes are trimmed from the
/// front so capture can never stall or bloat a long-lived session.
const CAPTURE_RETENTION_BYTES: usize = 1024 * 1024;

/// Optional accumulation of a session's output, independent of live event
/// delivery. Volatile and local to the session's lifetime.
#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    data: Vec<u8>,
    capturing: bool,
}

impl CaptureBuffer {
    /// Appends a chunk if capturing is enabled, trimming to the retention cap.
    fn append(&mut self, chunk: &[u8]) {
        if !self.capturing {
            return;
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() > CAPTURE_RETENTION_BYTES {
            let excess = self.data.len() - CAPTURE_RETENTION_BYTES;
            self.data.drain(..excess);
        }
    }

    /// Starts capturing, clearing any prior content.
    pub(crate) fn start(&mut self) {
        self.data.clear();
        self.capturing = true;
    }

    /// Stops capturing and returns the accumulated text, clearing the buffer.
    pub(crate) fn stop(&mut self) -> String {
        self.capturing = false;
        let data = std::mem::take(&mut self.data);
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Returns the accumulated text without clearing it.
    pub(crate) fn peek(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.capturing
    }
}

/// Per-session output router.
///
/// Fans every chunk from the backend out to the shared event channel and,
/// independently, into the capture buffer. Neither path may block the
/// emitting read loop: the broadcast send never waits and the capture lock
/// is only held for an append.
#[derive(Clone)]
pub(crate) struct SessionRouter {
    id: SessionId,
    events: broadcast::Sender<SessionEvent>,
    capture: Arc<Mutex<CaptureBuffer>>,
    exit_delivered: Arc<AtomicBool>,
}

impl SessionRouter {
    pub(crate) fn new(
        id: SessionId,
        events: broadcast::Sender<SessionEvent>,
        capture: Arc<Mutex<CaptureBuffer>>,
    ) -> Self {
        Self {
            id,
            events,
            capture,
            exit_delivered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delivers an output chunk to subscribers and the capture buffer.
    pub(crate) fn deliver(&self, chunk: &[u8]) {
        {
            let mut capture = self.capture.lock().unwrap_or_else(|e| e.into_inner());
            capture.append(chunk);
        }

        // A send error only means there are no subscribers right now.
        let _ = self.events.send(SessionEvent::Output {
            id: self.id.clone(),
            data: String::from_utf8_lossy(chunk).into_owned(),
        });
    }

    /// Delivers the exit event exactly once.
    pub(crate) fn deliver_exit(&self, code: i32) {
        if self.exit_delivered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.id, code, "session exited");
        let _ = self.events.send(SessionEvent::Exit {
            id: self.id.clone(),
            code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_ignores_chunks_when_disabled() {
        let mut capture = CaptureBuffer::default();
        capture.append(b"dropped");
        assert_eq!(capture.peek(), "");
        assert!(!capture.is_capturing());
    }

    #[test]
    fn test_capture_start_clears_prior_content() {
        let mut capture = CaptureBuffer::default();
        capture.start();
        capture.append(b"first");
        capture.start();
        capture.append(b"second");
        assert_eq!(capture.peek(), "second");
    }

    #[test]
    fn test_capture_stop_returns_and_clears() {
        let mut capture = CaptureBuffer::default();
        capture.start();
        capture.append(b"hello ");
        capture.append(b"world");

        assert_eq!(capture.stop(), "hello world");
        assert_eq!(capture.peek(), "");
        assert!(!capture.is_capturing());

        // After stop, further chunks are ignored again.
        capture.append(b"late");
        assert_eq!(capture.peek(), "");
    }

    #[test]
    fn test_capture_trims_to_retention_cap() {
        let mut capture = CaptureBuffer::default();
        capture.start();
        let chunk = vec![b'x'; CAPTURE_RETENTION_BYTES / 2];
        capture.append(&chunk);
        capture.append(&chunk);
        capture.append(b"tail");

        let text = capture.stop();
        assert_eq!(text.len(), CAPTURE_RETENTION_BYTES);
        assert!(text.ends_with("tail"));
    }

    #[test]
    fn test_router_delivers_to_events_and_capture() {
        let (tx, mut rx) = broadcast::channel(16);
        let capture = Arc::new(Mutex::new(CaptureBuffer::default()));
        capture.lock().unwrap().start();

        let router = SessionRouter::new("s1".to_string(), tx, Arc::clone(&capture));
        router.deliver(b"chunk");

        match rx.try_recv().unwrap() {
            SessionEvent::Output { id, data } => {
                assert_eq!(id, "s1");
                assert_eq!(data, "chunk");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(capture.lock().unwrap().peek(), "chunk");
    }

    #[test]
    fn test_router_exit_delivered_once() {
        let (tx, mut rx) = broadcast::channel(16);
        let capture = Arc::new(Mutex::new(CaptureBuffer::default()));
        let router = SessionRouter::new("s1".to_string(), tx, capture);

        router.deliver_exit(0);
        router.deliver_exit(9);

        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::Exit { code: 0, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_router_send_without_subscribers_is_ok() {
        let (tx, _) = broadcast::channel(16);
        let capture = Arc::new(Mutex::new(CaptureBuffer::default()));
        let router = SessionRouter::new("s1".to_string(), tx, capture);
        router.deliver(b"nobody listening");
    }
}
