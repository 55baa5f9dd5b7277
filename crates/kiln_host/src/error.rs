//! Error types for the compiler host.

use std::path::PathBuf;

use kiln_cache::CacheError;

use crate::transform::TransformError;

/// Errors raised by [`CompilerHost`](crate::CompilerHost) operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// A cache-layer error, including strict-mode misses.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A transform invocation failed; propagated verbatim, never retried.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// No transform is registered for the file and no fallback is configured.
    #[error("no transform found for {path}")]
    NoTransformFound {
        /// The file that could not be dispatched.
        path: PathBuf,
    },

    /// A read-only host was asked for a file whose artifact was never stored.
    #[error("asked to compile {path} in read-only mode, but it was not precompiled")]
    NotPrecompiled {
        /// The file that was requested.
        path: PathBuf,
    },

    /// Recursive compilation produced an intermediate MIME type with no
    /// registered transform.
    #[error("compiling {path} produced MIME type {mime_type}, which has no registered transform")]
    RecursionDeadEnd {
        /// The file being compiled when the cascade dead-ended.
        path: PathBuf,
        /// The unhandled intermediate MIME type.
        mime_type: String,
    },

    /// A transform was used with a host that never built a cache for it.
    #[error("transform '{name}' is not registered with this host")]
    UnregisteredTransform {
        /// The transform's name.
        name: String,
    },

    /// An I/O error outside the cache layers.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The saved configuration document could not be parsed.
    #[error("corrupt configuration at {path}: {reason}")]
    ConfigurationCorrupt {
        /// The configuration file path.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
}
