//! Error types for cache operations.

use std::path::PathBuf;

/// Errors that can occur in the fingerprint, change-cache, and artifact
/// layers.
///
/// Artifact reads are fail-safe (corruption is a cache miss, not an error);
/// this enum covers the failures that must surface: filesystem problems on
/// files that are supposed to exist, strict-mode lookups of paths that were
/// never precompiled, and snapshot (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A path that was expected to be a regular file is not one.
    #[error("{path} is not a regular file")]
    NotAFile {
        /// The offending path.
        path: PathBuf,
    },

    /// A strict-mode (read-only) lookup found no precompiled entry.
    #[error("asked for {path} but it was not precompiled")]
    PrecompiledEntryMissing {
        /// The path that was requested.
        path: PathBuf,
    },

    /// A snapshot or envelope could not be serialized or deserialized.
    #[error("cache serialization error: {reason}")]
    Serialization {
        /// Description of the failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = CacheError::Io {
            path: PathBuf::from("/tmp/cache/blob"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        };
        let msg = err.to_string();
        assert!(msg.contains("cache I/O error"));
        assert!(msg.contains("blob"));
    }

    #[test]
    fn precompiled_entry_missing_display() {
        let err = CacheError::PrecompiledEntryMissing {
            path: PathBuf::from("/app/src/main.ts"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/app/src/main.ts"));
        assert!(msg.contains("not precompiled"));
    }

    #[test]
    fn not_a_file_display() {
        let err = CacheError::NotAFile {
            path: PathBuf::from("/app/src"),
        };
        assert_eq!(err.to_string(), "/app/src is not a regular file");
    }

    #[test]
    fn serialization_display() {
        let err = CacheError::Serialization {
            reason: "unexpected EOF".to_string(),
        };
        assert!(err.to_string().contains("unexpected EOF"));
    }
}
