//! Error types for the bundle update client.

/// Top-level error type for the update lifecycle.
///
/// Every failure the core can produce is one of these variants; nothing in
/// the crate panics across the host boundary. "No update available" is a
/// normal outcome (see [`crate::updater::CheckOutcome`]), not an error.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// The preference medium could not be opened or written. Callers should
    /// degrade to the embedded fallback bundle rather than abort.
    #[error("preference store unavailable: {0}")]
    StoreUnavailable(String),

    /// Network failure after exhausting the retry policy.
    #[error("network failure after {attempts} attempt(s): {reason}")]
    NetworkFailure {
        /// Attempts made before giving up.
        attempts: u32,
        /// Description of the final failure.
        reason: String,
    },

    /// A completed payload did not match its expected checksum. Surfaced
    /// once and never retried; a consistently corrupt artifact would
    /// otherwise be re-downloaded forever.
    #[error("integrity failure: expected sha256 {expected}, got {actual}")]
    IntegrityFailure {
        /// Checksum the channel descriptor promised.
        expected: String,
        /// Checksum actually computed over the payload.
        actual: String,
    },

    /// An install is already in flight for this instance. The update itself
    /// has not failed; the caller should retry later.
    #[error("an install is already in flight for this instance")]
    InstallInProgress,

    /// An install step failed before the commit point. The instance's
    /// active-bundle state is guaranteed unchanged.
    #[error("install failed: {0}")]
    InstallFailed(String),

    /// The caller cancelled the operation. Temp files are discarded; no
    /// installer-visible state was changed.
    #[error("update cancelled")]
    Cancelled,

    /// I/O error outside the install path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
