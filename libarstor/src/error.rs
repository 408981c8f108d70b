//! CSI error types.
//!
//! All errors in the `libarstor` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric code the ArStor tool embeds in its output when a directory has no
/// room left for another entry.
const NO_SPACE_CODE: &str = "7";

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// An entity with the same name but incompatible attributes exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The requested snapshot was not found.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// The operation is blocked by a dependent entity (snapshot, device).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requested capacity or directory space is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Readiness polling ran past its horizon.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The ArStor tool (or another external command) returned an error.
    /// The payload is the raw text the tool produced.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The RPC is not implemented by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Returns `true` when a backend error carries the array's "directory
    /// full" code.
    ///
    /// The tool reports failures as free text; the first run of digits in
    /// that text is the array's error code.
    pub fn is_no_space(&self) -> bool {
        match self {
            Self::BackendError(text) => first_number(text) == Some(NO_SPACE_CODE),
            _ => false,
        }
    }

    /// Returns `true` for the volume/snapshot lookup failures.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VolumeNotFound(_) | Self::SnapshotNotFound(_))
    }
}

/// Return the first contiguous run of ASCII digits in `text`.
fn first_number(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

impl From<std::io::Error> for CsiError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
    }

    #[test]
    fn no_space_detection_uses_first_number() {
        assert!(CsiError::backend("createfile failed: 7 directory is full").is_no_space());
        assert!(CsiError::backend("error code=7").is_no_space());
        assert!(!CsiError::backend("error 17, 7 retries").is_no_space());
        assert!(!CsiError::backend("permission denied").is_no_space());
        assert!(!CsiError::Internal("7".into()).is_no_space());
    }

    #[test]
    fn not_found_classification() {
        assert!(CsiError::SnapshotNotFound("s".into()).is_not_found());
        assert!(!CsiError::Conflict("c".into()).is_not_found());
    }
}
