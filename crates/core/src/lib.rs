//! # Termhub Session Core
//!
//! This crate is the concurrent session core of the termhub terminal/agent
//! workbench. It multiplexes independently addressable execution channels:
//! shell sessions backed by a PTY (or a plain-subprocess fallback) and AI
//! chat channels backed by a remote streaming HTTP endpoint. Their
//! asynchronous output is pushed to the presentation layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Presentation layer                       │
//! │        (panes, renderers; outside this crate)                │
//! └───────────────┬──────────────────────────┬───────────────────┘
//!                 │ requests                 │ requests
//! ┌───────────────▼──────────┐  ┌────────────▼───────────────────┐
//! │   ShellSessionManager    │  │          ChatManager           │
//! │  ┌────────┐ ┌─────────┐  │  │  ┌────────────┐ ┌───────────┐  │
//! │  │  PTY   │ │subprocess│ │  │  │ TokenCache │ │ SseDecoder│  │
//! │  │backend │ │ fallback │ │  │  └────────────┘ └───────────┘  │
//! │  └────────┘ └─────────┘  │  │     cancellable chat registry  │
//! │   output/exit events     │  │     delta streams              │
//! └───────────────┬──────────┘  └────────────┬───────────────────┘
//!                 │ broadcast                │ lazy streams
//! └───────────────▼──────────────────────────▼───────────────────┘
//! ```
//!
//! Both managers share one design: a registry of session objects keyed by
//! caller-supplied identifiers, each owning a cancellable asynchronous
//! worker and an output sink. Neither depends on any UI component.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use termhub_core::config::{Config, SettingsHandle};
//! use termhub_core::session::{BackendSelector, ChannelRole, ShellSessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = SettingsHandle::new(Config::load_or_default()?);
//!     let shells = ShellSessionManager::new(settings.clone(), BackendSelector::new());
//!
//!     let mut events = shells.subscribe();
//!     shells.create("t1", "/tmp", ChannelRole::Terminal, None).await?;
//!     shells.write("t1", b"echo hi\n").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: configuration file handling and the shared settings handle
//! - [`session`]: shell session lifecycle, backend selection, output routing
//! - [`chat`]: AI chat requests, streaming decode, cancellation, token cache

pub mod chat;
pub mod config;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError, SettingsHandle};

// Re-export session types for convenience
pub use session::{
    BackendKind, BackendSelector, ChannelRole, SessionError, SessionEvent, SessionId, SessionInfo,
    ShellSessionManager,
};

// Re-export chat types for convenience
pub use chat::{
    ChatDeltaStream, ChatError, ChatManager, ChatMessage, ChatOptions, ChatResponse, TokenCache,
};
