//! Shell session manager.
//!
//! Thread-safe registry of shell sessions keyed by caller-supplied ids.
//! Each session owns its process handle exclusively; output is routed to a
//! single multiplexed event channel shared by all sessions, plus an optional
//! per-session capture buffer.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::backend::{
    resolve_shell, shell_family, BackendKind, BackendSelector, ChannelRole, ShellFamily,
};
use super::pty::PtyProcess;
use super::subprocess::SubprocessProcess;
use super::{CaptureBuffer, SessionError, SessionEvent, SessionId, SessionRouter};
use crate::config::SettingsHandle;

/// Capacity of the shared session event channel. Lagging subscribers drop
/// the oldest events instead of stalling the read loops.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The process behind a session, chosen once at creation.
enum ShellBackend {
    Pty(PtyProcess),
    Subprocess(SubprocessProcess),
}

impl ShellBackend {
    fn kind(&self) -> BackendKind {
        match self {
            ShellBackend::Pty(_) => BackendKind::Pty,
            ShellBackend::Subprocess(_) => BackendKind::Subprocess,
        }
    }

    fn is_running(&self) -> bool {
        match self {
            ShellBackend::Pty(p) => p.is_running(),
            ShellBackend::Subprocess(p) => p.is_running(),
        }
    }
}

/// A registry entry binding a caller-chosen id to a live shell process and
/// its capture state.
struct ShellSession {
    backend: ShellBackend,
    role: ChannelRole,
    working_directory: String,
    shell_path: String,
    capture: Arc<Mutex<CaptureBuffer>>,
}

/// Information about a session, as reported to the presentation layer.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Backend the session was created on.
    pub backend: BackendKind,
    /// Channel flavor requested at creation.
    pub role: ChannelRole,
    /// Working directory recorded at creation.
    pub working_directory: String,
    /// Shell executable driving the session.
    pub shell_path: String,
    /// Whether the process is still running.
    pub running: bool,
    /// Whether output capture is currently enabled.
    pub capturing: bool,
}

/// Thread-safe shell session manager.
///
/// The presentation layer serializes calls per session id; the manager
/// itself is safe for concurrent use across different ids.
pub struct ShellSessionManager {
    sessions: Arc<DashMap<SessionId, Arc<ShellSession>>>,
    events: broadcast::Sender<SessionEvent>,
    selector: BackendSelector,
    settings: SettingsHandle,
}

impl ShellSessionManager {
    /// Creates a new manager.
    ///
    /// The backend selector is injected so a transient PTY failure in one
    /// test cannot downgrade every other test in the process.
    pub fn new(settings: SettingsHandle, selector: BackendSelector) -> Self {
        let (events, janitor_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sessions: Arc<DashMap<SessionId, Arc<ShellSession>>> = Arc::new(DashMap::new());

        // Sessions that exit on their own are removed from the registry once
        // their exit event fires. `remove_if` guards against racing a restart
        // that re-created the id with a live process.
        let janitor_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut rx = janitor_rx;
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Exit { id, .. }) => {
                        janitor_sessions.remove_if(&id, |_, session| !session.backend.is_running());
                    }
                    Ok(SessionEvent::Output { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            sessions,
            events,
            selector,
            settings,
        }
    }

    /// Subscribes to the multiplexed output/exit event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Creates a new session under the given id.
    ///
    /// A second create on a live id is rejected; a dead entry that has not
    /// been pruned yet is replaced. Returns the backend the session landed
    /// on. Fails only when the id is taken, the session limit is reached, or
    /// both backends fail to spawn.
    pub async fn create(
        &self,
        id: &str,
        working_directory: &str,
        role: ChannelRole,
        shell_override: Option<&str>,
    ) -> Result<BackendKind, SessionError> {
        if let Some(existing) = self.sessions.get(id) {
            if existing.backend.is_running() {
                return Err(SessionError::AlreadyExists(id.to_string()));
            }
            drop(existing);
            self.sessions.remove(id);
        }

        let config = self.settings.snapshot();
        if self.sessions.len() >= config.session.max_sessions {
            return Err(SessionError::LimitReached(self.sessions.len()));
        }

        let shell_path = resolve_shell(shell_override, &config.session.default_shell);
        let family = shell_family(&shell_path);

        let capture = Arc::new(Mutex::new(CaptureBuffer::default()));
        let router = SessionRouter::new(id.to_string(), self.events.clone(), Arc::clone(&capture));

        let backend = self.spawn_backend(&shell_path, working_directory, role, family)?;
        let kind = backend.kind();

        match &backend {
            ShellBackend::Pty(p) => p.start_read_loop(router),
            ShellBackend::Subprocess(p) => p.start_read_loop(router),
        }

        self.sessions.insert(
            id.to_string(),
            Arc::new(ShellSession {
                backend,
                role,
                working_directory: working_directory.to_string(),
                shell_path: shell_path.clone(),
                capture,
            }),
        );

        tracing::info!(
            session_id = %id,
            backend = ?kind,
            shell = %shell_path,
            cwd = %working_directory,
            "created session"
        );

        Ok(kind)
    }

    /// Spawns the session process, preferring the PTY backend while the
    /// selector allows it. The first PTY failure latches the downgrade.
    fn spawn_backend(
        &self,
        shell: &str,
        working_directory: &str,
        role: ChannelRole,
        family: ShellFamily,
    ) -> Result<ShellBackend, SessionError> {
        if self.selector.pty_available() {
            match PtyProcess::spawn(shell, working_directory, role) {
                Ok(pty) => return Ok(ShellBackend::Pty(pty)),
                Err(e) => {
                    tracing::warn!(error = %e, "PTY spawn failed");
                    self.selector.disable_pty();
                }
            }
        }

        SubprocessProcess::spawn(shell, working_directory, role, family)
            .map(ShellBackend::Subprocess)
    }

    /// Writes input to a session. Unknown ids are a documented no-op.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get(id).map(|entry| Arc::clone(&entry)) else {
            return Ok(());
        };

        match &session.backend {
            ShellBackend::Pty(p) => p.write(data).await,
            ShellBackend::Subprocess(p) => p.write(data).await,
        }
    }

    /// Resizes a session's terminal. A no-op unless the session exists and
    /// runs on the PTY backend; the subprocess fallback has no geometry.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get(id).map(|entry| Arc::clone(&entry)) else {
            return Ok(());
        };

        match &session.backend {
            ShellBackend::Pty(p) => p.resize(cols, rows),
            ShellBackend::Subprocess(_) => Ok(()),
        }
    }

    /// Kills a session and removes it from the registry.
    ///
    /// Returns false when the id is unknown.
    pub async fn kill(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };

        let result = match &session.backend {
            ShellBackend::Pty(p) => p.kill().await,
            ShellBackend::Subprocess(p) => p.kill().await,
        };

        match result {
            Ok(code) => tracing::info!(session_id = %id, code, "killed session"),
            Err(e) => tracing::warn!(session_id = %id, error = %e, "kill reported error"),
        }

        true
    }

    /// Restarts a session: kill, then create under the same id and role.
    ///
    /// The capture buffer is not preserved and a fresh process handle is
    /// issued.
    pub async fn restart(
        &self,
        id: &str,
        working_directory: &str,
        shell_override: Option<&str>,
    ) -> Result<BackendKind, SessionError> {
        let role = self
            .sessions
            .get(id)
            .map(|session| session.role)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        self.kill(id).await;
        self.create(id, working_directory, role, shell_override)
            .await
    }

    /// Returns a session's recorded working directory.
    ///
    /// `None` means the session does not exist; callers use this as a
    /// liveness probe.
    pub fn get_cwd(&self, id: &str) -> Option<String> {
        self.sessions
            .get(id)
            .map(|session| session.working_directory.clone())
    }

    /// Starts capturing a session's output, clearing any prior capture.
    ///
    /// Returns false when the id is unknown.
    pub fn start_capture(&self, id: &str) -> bool {
        let Some(session) = self.sessions.get(id) else {
            return false;
        };
        session
            .capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .start();
        true
    }

    /// Stops capturing and returns the accumulated text, clearing the buffer.
    pub fn stop_capture(&self, id: &str) -> Option<String> {
        let session = self.sessions.get(id)?;
        let text = session
            .capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stop();
        Some(text)
    }

    /// Returns the capture buffer contents without clearing them.
    pub fn get_capture(&self, id: &str) -> Option<String> {
        let session = self.sessions.get(id)?;
        let text = session
            .capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peek();
        Some(text)
    }

    /// Lists all registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo {
                id: entry.key().clone(),
                backend: entry.backend.kind(),
                role: entry.role,
                working_directory: entry.working_directory.clone(),
                shell_path: entry.shell_path.clone(),
                running: entry.backend.is_running(),
                capturing: entry
                    .capture
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_capturing(),
            })
            .collect()
    }

    /// Kills every session. Used only at process shutdown.
    pub async fn dispose(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.kill(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SettingsHandle};

    fn manager() -> ShellSessionManager {
        ShellSessionManager::new(SettingsHandle::new(Config::default()), BackendSelector::new())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_and_get_cwd() {
        let manager = manager();
        manager
            .create("t1", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await
            .unwrap();

        assert_eq!(manager.get_cwd("t1"), Some("/tmp".to_string()));
        assert!(manager.kill("t1").await);
        assert_eq!(manager.get_cwd("t1"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let manager = manager();
        manager
            .create("dup", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await
            .unwrap();

        let second = manager
            .create("dup", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await;
        assert!(matches!(second, Err(SessionError::AlreadyExists(_))));

        manager.kill("dup").await;
    }

    #[tokio::test]
    async fn test_create_fails_when_both_backends_fail() {
        let manager = manager();
        let result = manager
            .create(
                "ghost",
                "/tmp",
                ChannelRole::Terminal,
                Some("/definitely/not/a/shell"),
            )
            .await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        // The failed PTY attempt latched the downgrade.
        assert!(!manager.selector.pty_available());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forced_subprocess_fallback() {
        let selector = BackendSelector::new();
        selector.disable_pty();
        let manager =
            ShellSessionManager::new(SettingsHandle::new(Config::default()), selector);

        let kind = manager
            .create("fb", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await
            .unwrap();
        assert_eq!(kind, BackendKind::Subprocess);

        // Resize is a documented no-op on the fallback backend.
        assert!(manager.resize("fb", 120, 40).is_ok());

        manager.kill("fb").await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_limit_enforced() {
        let mut config = Config::default();
        config.session.max_sessions = 1;
        let manager =
            ShellSessionManager::new(SettingsHandle::new(config), BackendSelector::new());

        manager
            .create("one", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await
            .unwrap();
        let second = manager
            .create("two", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await;
        assert!(matches!(second, Err(SessionError::LimitReached(_))));

        manager.dispose().await;
    }

    #[tokio::test]
    async fn test_write_and_resize_unknown_id_are_noops() {
        let manager = manager();
        assert!(manager.write("missing", b"data").await.is_ok());
        assert!(manager.resize("missing", 80, 24).is_ok());
        assert!(!manager.kill("missing").await);
        assert!(!manager.start_capture("missing"));
        assert!(manager.stop_capture("missing").is_none());
        assert!(manager.get_capture("missing").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_requires_existing_session() {
        let manager = manager();
        let result = manager.restart("nope", "/tmp", None).await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_reports_sessions() {
        let manager = manager();
        manager
            .create("a", "/tmp", ChannelRole::Terminal, Some("/bin/sh"))
            .await
            .unwrap();
        manager
            .create("b", "/tmp", ChannelRole::Agent, Some("/bin/sh"))
            .await
            .unwrap();

        let mut infos = manager.list();
        infos.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "a");
        assert_eq!(infos[0].role, ChannelRole::Terminal);
        assert_eq!(infos[1].role, ChannelRole::Agent);

        manager.dispose().await;
        assert!(manager.list().is_empty());
    }
}
