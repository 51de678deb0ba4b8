//! Domain-specific error types.
//!
//! Most fallible functions in this crate return `anyhow::Result` and are
//! logged-and-discarded by their caller (transient control-plane failures,
//! per-session I/O errors). The handful of error conditions call sites
//! actually need to match on live here instead.

use thiserror::Error;

/// Errors that a caller may need to branch on, as opposed to simply log.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A handler ran before the supervisor completed its first metadata
    /// fetch. Readers of [`crate::metadata::MetadataSlot`] surface this
    /// rather than blocking.
    #[error("workspace metadata is not ready yet")]
    MetadataNotReady,

    /// A handler needed the current session token before the supervisor's
    /// first token exchange completed.
    #[error("session token is not ready yet")]
    TokenNotReady,

    /// An attach or resize referenced a reconnecting-PTY session id that
    /// does not exist in the registry.
    #[error("no reconnecting-pty session with id {0:?}")]
    SessionNotFound(String),

    /// An SSH child process could not be started or the bridging between
    /// the channel and the child broke down. Distinct from a normal
    /// non-zero exit, which is never an `Err`.
    #[error("agent-level session failure (child could not be started or bridged)")]
    AbnormalExit,
}

/// Magic SSH exit-status sentinel for [`AgentError::AbnormalExit`].
///
/// Chosen high enough to be unambiguous against the 0-128 range a child's
/// own exit code or fatal signal could plausibly produce.
pub const ABNORMAL_EXIT_CODE: u32 = 229;
