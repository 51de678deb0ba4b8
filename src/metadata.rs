//! Atomically-replaceable workspace metadata and session token (§3).
//!
//! Both slots are written exactly once per supervisor iteration and read
//! from many concurrent handler tasks. Rather than a lock spanning readers
//! and the single writer, each slot is an `arc-swap`-style cell built on
//! `std::sync::RwLock` over an `Option<Arc<T>>` snapshot: writers replace the
//! whole value, readers clone a cheap `Arc` and never block the writer for
//! longer than a pointer swap.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::AgentError;

/// Snapshot of workspace configuration as reported by the control plane.
///
/// Created fresh on every supervisor iteration (§4.1 step 3) and swapped
/// into the slot atomically. Readers that observe a missing slot (first run,
/// before the first successful fetch) get [`AgentError::MetadataNotReady`]
/// rather than blocking.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceMetadata {
    /// Working directory for new sessions.
    pub directory: String,
    /// Environment variables to inject into every child process.
    pub env: HashMap<String, String>,
    /// Path to the MOTD file shown at login-shell startup.
    pub motd_path: String,
    /// Startup script contents, run exactly once per process lifetime.
    pub startup_script: String,
    /// VS Code proxy URI exported to children as `VSCODE_PROXY_URI`.
    pub vscode_proxy_uri: String,
    /// Number of git-auth configs reported; non-zero triggers the
    /// editor-config override side effect (§4.1 step 5).
    pub git_auth_config_count: u32,
}

/// Lock-free-ish replaceable cell holding the latest [`WorkspaceMetadata`].
#[derive(Debug, Default)]
pub struct MetadataSlot {
    inner: RwLock<Option<Arc<WorkspaceMetadata>>>,
}

impl MetadataSlot {
    /// Create an empty slot (pre-first-fetch state).
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(None) }
    }

    /// Replace the slot's contents, returning the previous value.
    ///
    /// The previous value is used by the supervisor to decide whether this
    /// is the first-ever successful fetch (previous was `None`), which gates
    /// the once-per-process startup script run.
    pub fn swap(&self, new: WorkspaceMetadata) -> Option<Arc<WorkspaceMetadata>> {
        let mut guard = self.inner.write().expect("metadata slot lock poisoned");
        guard.replace(Arc::new(new))
    }

    /// Snapshot the current value, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<WorkspaceMetadata>> {
        self.inner.read().expect("metadata slot lock poisoned").clone()
    }

    /// Snapshot the current value or a domain-specific "not ready" error.
    pub fn require(&self) -> Result<Arc<WorkspaceMetadata>, AgentError> {
        self.get().ok_or(AgentError::MetadataNotReady)
    }
}

/// Lock-free-ish replaceable cell holding the latest bearer token obtained
/// via token exchange (§3, §4.4 layer 3).
#[derive(Debug, Default)]
pub struct SessionTokenSlot {
    inner: RwLock<Option<Arc<str>>>,
}

impl SessionTokenSlot {
    /// Create an empty slot (pre-first-exchange state).
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(None) }
    }

    /// Replace the slot's contents with a freshly exchanged token.
    pub fn set(&self, token: String) {
        *self.inner.write().expect("token slot lock poisoned") = Some(Arc::from(token));
    }

    /// Snapshot the current token, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<str>> {
        self.inner.read().expect("token slot lock poisoned").clone()
    }

    /// Snapshot the current token or a domain-specific "not ready" error.
    pub fn require(&self) -> Result<Arc<str>, AgentError> {
        self.get().ok_or(AgentError::TokenNotReady)
    }
}
