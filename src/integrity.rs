//! Bundle payload integrity verification.
//!
//! Installed bundles and downloaded candidates are verified against the
//! SHA-256 checksum the channel descriptor promised. Corrupt or missing
//! payloads are detected before the host ever loads them, so resolution
//! can heal back to the embedded fallback instead of booting a bad bundle.

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;
use tracing::warn;

/// Result of a payload integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// Payload exists and its digest matches the expected value.
    Valid,
    /// No payload at the given path.
    Missing,
    /// Payload exists but its SHA-256 digest does not match.
    Mismatch,
}

/// Verify a payload file against an expected SHA-256 hex digest.
///
/// Comparison is case-insensitive; channels publish either case. A payload
/// that cannot be read counts as [`IntegrityCheck::Mismatch`].
pub fn verify(path: &Path, expected_sha256: &str) -> IntegrityCheck {
    if !path.is_file() {
        return IntegrityCheck::Missing;
    }

    match sha256_hex(path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected_sha256) => IntegrityCheck::Valid,
        Ok(actual) => {
            warn!(
                path = %path.display(),
                expected = expected_sha256,
                actual = %actual,
                "payload checksum mismatch"
            );
            IntegrityCheck::Mismatch
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read payload for checksum");
            IntegrityCheck::Mismatch
        }
    }
}

/// Compute the SHA-256 hex digest of a file's contents.
///
/// Reads in 64 KiB chunks so large bundles are never loaded into memory
/// all at once.
pub fn sha256_hex(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65_536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

/// SHA-256 hex digest of an in-memory buffer. Test fixtures and the
/// download path (which hashes the streamed file afterwards) share this.
pub fn sha256_hex_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
