//! Error taxonomy for the fuzz harness
//!
//! Every failure the controller can observe maps to one variant here. The
//! important split is reportable vs session-fatal: reportable errors leave the
//! session usable for the next test case, session-fatal errors mean the
//! runtime's internal state can no longer be trusted and the session must be
//! torn down.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FuzzError>;

/// Errors produced by the device-session and dispatch controller.
#[derive(Debug, Error)]
pub enum FuzzError {
    /// Device runtime initialization failed. Fatal: no devices are usable.
    #[error("device runtime initialization failed: {0}")]
    RuntimeInit(String),

    /// The vendor runtime library could not be located or loaded.
    #[error("device runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A low-level runtime call failed in a way no more specific variant
    /// describes. Reportable unless rewrapped by a caller.
    #[error("runtime call `{call}` failed: {reason}")]
    Api { call: &'static str, reason: String },

    /// No agent satisfied the device predicate.
    #[error("no agent matched the device predicate")]
    AgentNotFound,

    /// No memory pool on the agent satisfied the pool predicate.
    #[error("no memory pool matched the predicate on agent `{agent}`")]
    PoolNotFound { agent: String },

    /// Queue creation against the discovered agent failed.
    #[error("queue creation failed on agent `{agent}`: {reason}")]
    QueueCreate { agent: String, reason: String },

    /// The memory pool rejected an allocation request.
    #[error("allocation of {size} bytes rejected: {reason}")]
    Allocation { size: u64, reason: String },

    /// The buffer is not in this session's tracked list.
    #[error("buffer {0} is not tracked by this session")]
    UntrackedBuffer(u64),

    /// The artifact id does not name a loaded executable context.
    #[error("unknown artifact id {0}")]
    UnknownArtifact(usize),

    /// Code object missing at both the primary path and the device-qualified
    /// fallback path.
    #[error("code object not found at {path} (fallback tried: {fallback})")]
    ArtifactNotFound { path: PathBuf, fallback: PathBuf },

    /// Code object reading, executable creation, loading or freezing failed.
    #[error("code object load failed for {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The kernel entry point is absent from the frozen executable.
    #[error("kernel symbol `{name}` not present in executable")]
    SymbolNotFound { name: String },

    /// Kernel arguments do not fit the symbol's kernarg segment.
    #[error("kernel argument layout invalid: {0}")]
    KernargLayout(String),

    /// Packet submission failed. Fatal: the queue state after a bad
    /// submission cannot be trusted.
    #[error("packet submission failed: {0}")]
    Submission(String),

    /// Wait for dispatch completion exceeded its bound. The dispatch may
    /// still complete later; referenced buffers must not be released until
    /// it resolves.
    #[error("wait for dispatch completion timed out after {0:?}")]
    Timeout(Duration),

    /// The session is closing or closed; the operation requires `Ready`.
    #[error("session is not ready (closing or closed)")]
    SessionClosed,

    /// The kernel name is not in the provider's catalog.
    #[error("unknown kernel `{0}`")]
    KernelNotFound(String),

    /// The device compiler invocation failed.
    #[error("kernel compilation failed: {0}")]
    Compilation(String),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FuzzError {
    /// Whether this error invalidates the whole session (or run), as opposed
    /// to being scoped to the call that produced it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            FuzzError::RuntimeInit(_)
                | FuzzError::RuntimeUnavailable(_)
                | FuzzError::Submission(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FuzzError::RuntimeInit("boom".into()).is_session_fatal());
        assert!(FuzzError::Submission("bad packet".into()).is_session_fatal());

        assert!(!FuzzError::AgentNotFound.is_session_fatal());
        assert!(!FuzzError::SymbolNotFound { name: "k".into() }.is_session_fatal());
        assert!(!FuzzError::Timeout(Duration::from_secs(1)).is_session_fatal());
    }
}
