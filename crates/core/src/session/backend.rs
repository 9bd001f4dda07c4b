//! Backend selection for shell sessions.
//!
//! A session is backed either by a real pseudo-terminal or by a plain
//! subprocess with piped stdio. The backend is chosen once at session
//! creation and recorded on the session; it is never re-probed per call.
//! The first PTY spawn failure flips a process-scoped latch that downgrades
//! every later session to the subprocess backend.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The execution mechanism backing a shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Pseudo-terminal backend (full terminal semantics, resizable).
    Pty,
    /// Plain subprocess with piped stdio (no terminal geometry).
    Subprocess,
}

/// The flavor of channel a session was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// A plain interactive terminal pane.
    Terminal,
    /// An agent-driven channel.
    Agent,
}

impl ChannelRole {
    /// Environment marker value spawned into the session's process.
    pub(crate) fn env_value(self) -> &'static str {
        match self {
            ChannelRole::Terminal => "terminal",
            ChannelRole::Agent => "agent",
        }
    }
}

/// Shell family, derived from the shell executable name.
///
/// Determines input line-ending normalization and whether the subprocess
/// backend must echo input locally (console-style shells do not echo on the
/// driving pipe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    /// sh, bash, zsh, fish, and friends.
    Posix,
    /// cmd.exe style console shell.
    Cmd,
    /// PowerShell (powershell.exe / pwsh).
    PowerShell,
}

/// Classifies a shell path into its family.
pub fn shell_family(shell_path: &str) -> ShellFamily {
    let name = Path::new(shell_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell_path)
        .to_ascii_lowercase();

    match name.as_str() {
        "cmd" => ShellFamily::Cmd,
        "powershell" | "pwsh" => ShellFamily::PowerShell,
        _ => ShellFamily::Posix,
    }
}

/// Discovers the platform default shell.
///
/// Pure lookup with no side effects, in order of preference:
/// 1. `%COMSPEC%` on Windows, falling back to `cmd.exe`
/// 2. `$SHELL` on Unix
/// 3. `/bin/sh` as the final fallback
pub fn default_shell() -> String {
    if cfg!(windows) {
        return std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Resolves the shell for a new session.
///
/// An explicit override wins, then the configured default, then platform
/// discovery. Bare program names are resolved on `PATH`.
pub fn resolve_shell(override_shell: Option<&str>, configured: &str) -> String {
    let candidate = match override_shell {
        Some(shell) if !shell.is_empty() => shell.to_string(),
        _ if !configured.is_empty() => configured.to_string(),
        _ => default_shell(),
    };

    // Bare names like "bash" are resolved so the spawn error surface stays
    // on the backend, not on a missing-file lookup inside it.
    if !candidate.contains(std::path::MAIN_SEPARATOR) {
        if let Ok(found) = which::which(&candidate) {
            return found.to_string_lossy().into_owned();
        }
    }

    candidate
}

/// Process-scoped backend fallback latch.
///
/// Single writer (the first failed PTY spawn), many readers. Once the PTY
/// backend is judged unusable it is never retried for new sessions within the
/// process lifetime; the latch is injected into the session manager so tests
/// can construct a fresh one per case.
#[derive(Debug, Clone, Default)]
pub struct BackendSelector {
    pty_disabled: Arc<AtomicBool>,
}

impl BackendSelector {
    /// Creates a selector with the PTY backend enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the PTY backend may still be attempted.
    pub fn pty_available(&self) -> bool {
        !self.pty_disabled.load(Ordering::SeqCst)
    }

    /// Permanently downgrades to the subprocess backend.
    pub fn disable_pty(&self) {
        if !self.pty_disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("PTY backend disabled; falling back to subprocess for new sessions");
        }
    }

    /// Re-enables the PTY backend. Test hook only; production code never
    /// reverts the latch.
    pub fn reset(&self) {
        self.pty_disabled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_family_posix() {
        assert_eq!(shell_family("/bin/sh"), ShellFamily::Posix);
        assert_eq!(shell_family("/usr/bin/zsh"), ShellFamily::Posix);
        assert_eq!(shell_family("bash"), ShellFamily::Posix);
    }

    #[test]
    fn test_shell_family_cmd() {
        assert_eq!(shell_family("cmd.exe"), ShellFamily::Cmd);
        assert_eq!(shell_family("C:\\Windows\\System32\\cmd.exe"), ShellFamily::Cmd);
    }

    #[test]
    fn test_shell_family_powershell() {
        assert_eq!(shell_family("powershell.exe"), ShellFamily::PowerShell);
        assert_eq!(shell_family("pwsh"), ShellFamily::PowerShell);
    }

    #[test]
    fn test_default_shell_not_empty() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn test_resolve_shell_override_wins() {
        let resolved = resolve_shell(Some("/bin/custom"), "/bin/configured");
        assert_eq!(resolved, "/bin/custom");
    }

    #[test]
    fn test_resolve_shell_configured_beats_discovery() {
        let resolved = resolve_shell(None, "/bin/configured");
        assert_eq!(resolved, "/bin/configured");
    }

    #[test]
    fn test_selector_latch_is_one_way() {
        let selector = BackendSelector::new();
        assert!(selector.pty_available());

        selector.disable_pty();
        assert!(!selector.pty_available());

        // Repeated downgrades are idempotent.
        selector.disable_pty();
        assert!(!selector.pty_available());
    }

    #[test]
    fn test_selector_clones_share_state() {
        let selector = BackendSelector::new();
        let clone = selector.clone();

        selector.disable_pty();
        assert!(!clone.pty_available());
    }

    #[test]
    fn test_selector_reset_for_tests() {
        let selector = BackendSelector::new();
        selector.disable_pty();
        selector.reset();
        assert!(selector.pty_available());
    }
}
