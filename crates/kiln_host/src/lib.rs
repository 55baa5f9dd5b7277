//! The compiler host: transform registry, cache-or-compile orchestration,
//! and configuration persistence.
//!
//! [`CompilerHost`] is the single public entry point for compiling a file.
//! In read-write mode it drives a get-or-fetch protocol against one artifact
//! cache per transform identity, recursively re-dispatching output that is
//! still in an intermediate form. In read-only mode it replays a previously
//! saved session and never invokes a transform.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod host;
pub mod transform;

pub use config::SavedConfiguration;
pub use error::HostError;
pub use host::{BatchFailure, CompileResult, CompilerHost};
pub use transform::{
    PassthroughTransform, ReadOnlyTransform, Transform, TransformError, TransformIdentity,
    TransformOutput, TransformRegistry,
};
