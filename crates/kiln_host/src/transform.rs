//! The transform capability and its identity.
//!
//! Transforms are external collaborators: the host only needs enough surface
//! to ask "should this file compile, what does it depend on, compile it".
//! A [`TransformIdentity`] is computed once at registration time and carried
//! everywhere a transform must be distinguished; two instances with the same
//! identity share one artifact cache, which is what lets a read-only session
//! resolve the same namespaces without the real implementations present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{mime, ContentHash};
use serde::{Deserialize, Serialize};

/// Errors raised by a transform invocation.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The transform rejected or failed on the input.
    #[error("transform '{name}' failed for {path}: {message}")]
    Failed {
        /// The transform's name.
        name: String,
        /// The file being transformed.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A read-only stand-in was asked to compile.
    #[error("read-only transform stand-ins cannot compile")]
    ReadOnly,
}

/// The result of a transform invocation.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    /// The produced source text.
    pub code: String,

    /// MIME type of the produced text.
    pub mime_type: String,
}

/// An external capability that converts source text of one MIME type into
/// output of another (or the same) MIME type.
///
/// Implementations must be deterministic for a given input: the cache assumes
/// a digest maps to exactly one output per transform identity.
pub trait Transform: Send + Sync {
    /// Stable name identifying the transform implementation.
    fn name(&self) -> &str;

    /// Version string of the underlying compiler.
    fn version(&self) -> String;

    /// MIME types this transform accepts as input.
    fn input_mime_types(&self) -> Vec<String>;

    /// MIME type this transform emits.
    fn output_mime_type(&self) -> String;

    /// Opaque-but-hashable options; part of the cache namespace.
    fn options(&self) -> serde_json::Value;

    /// Returns `false` to decline a file; declined text is returned verbatim
    /// as a valid final state.
    fn should_compile(&self, source: &str, path: &Path) -> bool;

    /// Extra files the transform would consult for this input (imports and
    /// the like); informational only.
    fn dependent_files(&self, source: &str, path: &Path)
        -> Result<Vec<PathBuf>, TransformError>;

    /// Compiles source text.
    fn compile(&self, source: &str, path: &Path) -> Result<TransformOutput, TransformError>;
}

/// Registry handed to the host: input MIME type to transform.
pub type TransformRegistry = HashMap<String, Arc<dyn Transform>>;

/// The value identity of a transform: everything that distinguishes its
/// cache namespace, with no reference to the live instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformIdentity {
    /// Transform name.
    pub name: String,

    /// Accepted input MIME types.
    pub input_mime_types: Vec<String>,

    /// Emitted output MIME type.
    pub output_mime_type: String,

    /// The transform's options.
    #[serde(rename = "compilerOptions")]
    pub options: serde_json::Value,

    /// The underlying compiler version.
    #[serde(rename = "compilerVersion")]
    pub version: String,
}

impl TransformIdentity {
    /// Captures the identity of a live transform.
    pub fn of(transform: &dyn Transform) -> Self {
        Self {
            name: transform.name().to_string(),
            input_mime_types: transform.input_mime_types(),
            output_mime_type: transform.output_mime_type(),
            options: transform.options(),
            version: transform.version(),
        }
    }

    /// Digest naming this identity's artifact-cache directory.
    ///
    /// Computed over name, version, and options only; two instances with
    /// identical identity always share a namespace.
    pub fn namespace_digest(&self) -> ContentHash {
        let mut data = Vec::new();
        data.extend_from_slice(self.name.as_bytes());
        data.push(0);
        data.extend_from_slice(self.version.as_bytes());
        data.push(0);
        // serde_json renders object keys in sorted order, so this is stable.
        data.extend_from_slice(self.options.to_string().as_bytes());
        ContentHash::from_bytes(&data)
    }
}

/// An inert transform stand-in reconstructed from a saved identity.
///
/// Carries identity and versioning only, so artifact-cache namespaces resolve
/// identically in a read-only session; asking it to compile is an error.
#[derive(Debug, Clone)]
pub struct ReadOnlyTransform {
    identity: TransformIdentity,
}

impl ReadOnlyTransform {
    /// Wraps a saved identity.
    pub fn new(identity: TransformIdentity) -> Self {
        Self { identity }
    }
}

impl Transform for ReadOnlyTransform {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn version(&self) -> String {
        self.identity.version.clone()
    }

    fn input_mime_types(&self) -> Vec<String> {
        self.identity.input_mime_types.clone()
    }

    fn output_mime_type(&self) -> String {
        self.identity.output_mime_type.clone()
    }

    fn options(&self) -> serde_json::Value {
        self.identity.options.clone()
    }

    fn should_compile(&self, _source: &str, _path: &Path) -> bool {
        true
    }

    fn dependent_files(
        &self,
        _source: &str,
        _path: &Path,
    ) -> Result<Vec<PathBuf>, TransformError> {
        Ok(Vec::new())
    }

    fn compile(&self, _source: &str, _path: &Path) -> Result<TransformOutput, TransformError> {
        Err(TransformError::ReadOnly)
    }
}

/// The built-in passthrough transform.
///
/// Registered for `text/plain`, it declines every file, so passthrough
/// content (minified, vendored, source-mapped, binary) is stored verbatim in
/// its namespace. Also the usual choice of fallback transform.
#[derive(Debug, Default, Clone)]
pub struct PassthroughTransform;

impl Transform for PassthroughTransform {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn input_mime_types(&self) -> Vec<String> {
        vec![mime::PASSTHROUGH_MIME_TYPE.to_string()]
    }

    fn output_mime_type(&self) -> String {
        mime::PASSTHROUGH_MIME_TYPE.to_string()
    }

    fn options(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn should_compile(&self, _source: &str, _path: &Path) -> bool {
        false
    }

    fn dependent_files(
        &self,
        _source: &str,
        _path: &Path,
    ) -> Result<Vec<PathBuf>, TransformError> {
        Ok(Vec::new())
    }

    fn compile(&self, source: &str, _path: &Path) -> Result<TransformOutput, TransformError> {
        Ok(TransformOutput {
            code: source.to_string(),
            mime_type: mime::PASSTHROUGH_MIME_TYPE.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(name: &str, version: &str, options: serde_json::Value) -> TransformIdentity {
        TransformIdentity {
            name: name.to_string(),
            input_mime_types: vec!["text/typescript".to_string()],
            output_mime_type: "application/javascript".to_string(),
            options,
            version: version.to_string(),
        }
    }

    #[test]
    fn namespace_digest_is_stable() {
        let a = identity("tsc", "5.2.0", json!({"target": "es2020"}));
        let b = identity("tsc", "5.2.0", json!({"target": "es2020"}));
        assert_eq!(a.namespace_digest(), b.namespace_digest());
    }

    #[test]
    fn namespace_digest_distinguishes_name_version_options() {
        let base = identity("tsc", "5.2.0", json!({"target": "es2020"}));
        assert_ne!(
            base.namespace_digest(),
            identity("babel", "5.2.0", json!({"target": "es2020"})).namespace_digest()
        );
        assert_ne!(
            base.namespace_digest(),
            identity("tsc", "5.3.0", json!({"target": "es2020"})).namespace_digest()
        );
        assert_ne!(
            base.namespace_digest(),
            identity("tsc", "5.2.0", json!({"target": "es2021"})).namespace_digest()
        );
    }

    #[test]
    fn read_only_stand_in_shares_the_namespace() {
        let original = identity("tsc", "5.2.0", json!({"strict": true}));
        let stand_in = ReadOnlyTransform::new(original.clone());
        assert_eq!(
            TransformIdentity::of(&stand_in).namespace_digest(),
            original.namespace_digest()
        );
    }

    #[test]
    fn read_only_stand_in_cannot_compile() {
        let stand_in = ReadOnlyTransform::new(identity("tsc", "5.2.0", json!({})));
        let err = stand_in
            .compile("let x = 1;", Path::new("/app/a.ts"))
            .unwrap_err();
        assert!(matches!(err, TransformError::ReadOnly));
    }

    #[test]
    fn passthrough_declines_everything() {
        let t = PassthroughTransform;
        assert!(!t.should_compile("anything", Path::new("/app/a.txt")));
        assert_eq!(t.input_mime_types(), vec!["text/plain".to_string()]);
    }

    #[test]
    fn identity_serializes_in_wire_form() {
        let json = serde_json::to_value(identity("tsc", "5.2.0", json!({"a": 1}))).unwrap();
        assert!(json.get("inputMimeTypes").is_some());
        assert!(json.get("outputMimeType").is_some());
        assert!(json.get("compilerOptions").is_some());
        assert!(json.get("compilerVersion").is_some());
    }
}
