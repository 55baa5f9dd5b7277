//! The orchestrating compiler host.
//!
//! `compile(path)` is the single public entry point. The host resolves the
//! file's fingerprint, selects a transform (passthrough beats a registered
//! transform, which beats the fallback), and drives the artifact cache's
//! get-or-fetch protocol. Output that is not in a final form is re-dispatched
//! through the registry using its MIME type until the cascade terminates or
//! dead-ends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_cache::{
    ArtifactCache, ChangeCache, FetchedOutput, FileContents, FileFingerprint, ResolvedFile,
};
use kiln_common::{mime, paths, task};
use tracing::{debug, warn};

use crate::config::SavedConfiguration;
use crate::error::HostError;
use crate::transform::{ReadOnlyTransform, Transform, TransformIdentity, TransformRegistry};

/// MIME type assumed for library code whose extension is unknown.
const LIBRARY_FALLBACK_MIME: &str = "application/javascript";

/// Marker introducing a source-map reference inside a comment.
const SOURCE_MAP_PREFIX: &str = "sourceMappingURL=";

/// The complete result of compiling one file.
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// MIME type of the output; absent only when a file with an unknown
    /// extension was returned verbatim in read-write mode.
    pub mime_type: Option<String>,

    /// The compiled (or passed-through) payload.
    pub contents: FileContents,

    /// Extra files the producing transform consulted.
    pub dependent_files: Vec<PathBuf>,
}

/// One file's failure inside a batch compile.
#[derive(Debug)]
pub struct BatchFailure {
    /// The file that failed.
    pub path: PathBuf,

    /// Why it failed.
    pub error: HostError,
}

/// Owns the transform registry, one artifact cache per transform identity,
/// and the change cache; orchestrates cache-or-compile for single files and
/// directory batches, in a read-write or read-only session.
pub struct CompilerHost {
    root_cache_dir: PathBuf,
    transforms: TransformRegistry,
    caches: HashMap<String, Arc<ArtifactCache>>,
    change_cache: Arc<ChangeCache>,
    read_only: bool,
    fallback: Option<Arc<dyn Transform>>,
}

impl CompilerHost {
    /// Creates a host over an explicit transform registry.
    ///
    /// One artifact cache is created per distinct transform identity among
    /// the registry and the fallback; transforms sharing an identity share a
    /// cache. In read-only mode no directories are created and cache misses
    /// are fatal.
    pub fn new(
        root_cache_dir: PathBuf,
        transforms: TransformRegistry,
        change_cache: Arc<ChangeCache>,
        read_only: bool,
        fallback: Option<Arc<dyn Transform>>,
    ) -> Result<Self, HostError> {
        if !read_only {
            std::fs::create_dir_all(&root_cache_dir).map_err(|e| HostError::Io {
                path: root_cache_dir.clone(),
                source: e,
            })?;
        }

        let mut caches = HashMap::new();
        for transform in transforms.values().chain(fallback.iter()) {
            let digest = TransformIdentity::of(transform.as_ref())
                .namespace_digest()
                .to_hex();
            if !caches.contains_key(&digest) {
                let cache = ArtifactCache::new(
                    root_cache_dir.join(&digest),
                    Arc::clone(&change_cache),
                    read_only,
                )?;
                caches.insert(digest, Arc::new(cache));
            }
        }

        Ok(Self {
            root_cache_dir,
            transforms,
            caches,
            change_cache,
            read_only,
            fallback,
        })
    }

    /// Recreates a read-only host from a previously saved configuration.
    ///
    /// Every transform becomes an inert [`ReadOnlyTransform`] stand-in with
    /// the saved identity, so artifact-cache namespaces resolve identically
    /// to the write session without the real implementations present.
    pub fn load_read_only(
        root_cache_dir: &Path,
        app_root: Option<&Path>,
        fallback: Option<Arc<dyn Transform>>,
    ) -> Result<Self, HostError> {
        let config = SavedConfiguration::read_from(root_cache_dir)?;
        let change_cache = Arc::new(ChangeCache::restore(
            config.file_change_cache,
            app_root,
            true,
        ));
        let transforms: TransformRegistry = config
            .compilers
            .into_iter()
            .map(|(mime_type, identity)| {
                (
                    mime_type,
                    Arc::new(ReadOnlyTransform::new(identity)) as Arc<dyn Transform>,
                )
            })
            .collect();
        Self::new(
            root_cache_dir.to_path_buf(),
            transforms,
            change_cache,
            true,
            fallback,
        )
    }

    /// Async twin of [`CompilerHost::load_read_only`].
    pub async fn load_read_only_async(
        root_cache_dir: &Path,
        app_root: Option<&Path>,
        fallback: Option<Arc<dyn Transform>>,
    ) -> Result<Self, HostError> {
        let root_cache_dir = root_cache_dir.to_path_buf();
        let app_root = app_root.map(Path::to_path_buf);
        task::run_blocking(move || {
            Self::load_read_only(&root_cache_dir, app_root.as_deref(), fallback)
        })
        .await
    }

    /// Serializes the change cache and every registered transform's identity
    /// to `compiler-info.json.gz` under the root cache directory.
    pub fn save_configuration(&self) -> Result<(), HostError> {
        let compilers = self
            .transforms
            .iter()
            .map(|(mime_type, transform)| {
                (mime_type.clone(), TransformIdentity::of(transform.as_ref()))
            })
            .collect();
        let config = SavedConfiguration {
            file_change_cache: self.change_cache.snapshot(),
            compilers,
        };
        config.write_to(&self.root_cache_dir)
    }

    /// Returns `true` if this host never invokes transforms.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The root directory all artifact caches live under.
    pub fn root_cache_dir(&self) -> &Path {
        &self.root_cache_dir
    }

    /// The change cache owned by this host.
    pub fn change_cache(&self) -> &Arc<ChangeCache> {
        &self.change_cache
    }

    /// Compiles a file, returning cached output when nothing changed.
    pub fn compile(&self, path: &Path) -> Result<CompileResult, HostError> {
        if self.read_only {
            self.compile_read_only(path)
        } else {
            self.full_compile(path)
        }
    }

    /// Async twin of [`CompilerHost::compile`].
    pub async fn compile_async(self: &Arc<Self>, path: &Path) -> Result<CompileResult, HostError> {
        let host = Arc::clone(self);
        let path = path.to_path_buf();
        task::run_blocking(move || host.compile(&path)).await
    }

    /// Async twin of [`CompilerHost::save_configuration`].
    pub async fn save_configuration_async(self: &Arc<Self>) -> Result<(), HostError> {
        let host = Arc::clone(self);
        task::run_blocking(move || host.save_configuration()).await
    }

    /// Compiles every file under a directory, recursively.
    ///
    /// Files rejected by `should_compile` are skipped; the root cache
    /// directory is never descended into. One file's failure does not abort
    /// the batch: failures are reported and returned.
    pub fn compile_all<F>(
        &self,
        root: &Path,
        should_compile: F,
    ) -> Result<Vec<BatchFailure>, HostError>
    where
        F: Fn(&Path) -> bool,
    {
        let mut files = Vec::new();
        self.collect_files(root, &mut files)?;

        let mut failures = Vec::new();
        for path in files {
            if !should_compile(&path) {
                continue;
            }
            if let Err(error) = self.compile(&path) {
                warn!(path = %path.display(), %error, "batch compile failure");
                failures.push(BatchFailure { path, error });
            }
        }
        Ok(failures)
    }

    /// Async twin of [`CompilerHost::compile_all`].
    pub async fn compile_all_async<F>(
        self: &Arc<Self>,
        root: &Path,
        should_compile: F,
    ) -> Result<Vec<BatchFailure>, HostError>
    where
        F: Fn(&Path) -> bool + Send + 'static,
    {
        let host = Arc::clone(self);
        let root = root.to_path_buf();
        task::run_blocking(move || host.compile_all(&root, should_compile)).await
    }

    fn collect_files(&self, dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), HostError> {
        let entries = std::fs::read_dir(dir).map_err(|e| HostError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| HostError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            if path == self.root_cache_dir {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| HostError::Io {
                path: path.clone(),
                source: e,
            })?;
            if file_type.is_dir() {
                self.collect_files(&path, files)?;
            } else if file_type.is_file() {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Read-only compilation: serve from the artifact caches, never compile.
    fn compile_read_only(&self, path: &Path) -> Result<CompileResult, HostError> {
        let sniffed = mime::lookup_path(path);

        // Library code ships verbatim and bypasses every cache.
        if paths::in_library_dir(path) {
            let bytes = std::fs::read(path).map_err(|e| HostError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            return Ok(CompileResult {
                mime_type: Some(sniffed.unwrap_or(LIBRARY_FALLBACK_MIME).to_string()),
                contents: FileContents::from_bytes(bytes),
                dependent_files: Vec::new(),
            });
        }

        let resolved = self.change_cache.resolve(path)?;
        let transform = self
            .select_transform(&resolved.fingerprint, sniffed)
            .ok_or_else(|| HostError::NoTransformFound {
                path: path.to_path_buf(),
            })?;
        let cache = self.cache_for(transform.as_ref())?;

        let lookup = cache.get(path)?;
        match (lookup.payload, lookup.mime_type) {
            (Some(contents), Some(mime_type)) => Ok(CompileResult {
                mime_type: Some(mime_type),
                contents,
                dependent_files: lookup.dependent_files,
            }),
            _ => Err(HostError::NotPrecompiled {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Read-write compilation: get-or-fetch against the selected transform's
    /// artifact cache.
    fn full_compile(&self, path: &Path) -> Result<CompileResult, HostError> {
        debug!(path = %path.display(), "compiling");

        let resolved = self.change_cache.resolve(path)?;
        let sniffed = mime::lookup_path(path);

        if resolved.fingerprint.is_library_code {
            return self.compile_library(path, resolved, sniffed);
        }

        let transform = match self.registered_transform(&resolved.fingerprint, sniffed) {
            Some(transform) => Arc::clone(transform),
            None => {
                debug!(path = %path.display(), "no registered transform, using fallback");
                self.fallback
                    .clone()
                    .ok_or_else(|| HostError::NoTransformFound {
                        path: path.to_path_buf(),
                    })?
            }
        };

        let cache = self.cache_for(transform.as_ref())?;
        let artifact = cache.get_or_fetch(path, |path, resolved| {
            self.compile_uncached(path, resolved, &transform)
        })?;

        Ok(CompileResult {
            mime_type: artifact.mime_type,
            contents: artifact.contents,
            dependent_files: artifact.dependent_files,
        })
    }

    /// Library code in read-write mode: returned verbatim except for the
    /// source-map path rewrite on text.
    fn compile_library(
        &self,
        path: &Path,
        resolved: ResolvedFile,
        sniffed: Option<&'static str>,
    ) -> Result<CompileResult, HostError> {
        let contents = match resolved.contents {
            Some(contents) => contents,
            None => {
                let bytes = std::fs::read(path).map_err(|e| HostError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                FileContents::from_bytes(bytes)
            }
        };
        let contents = match contents {
            FileContents::Text(code) => {
                FileContents::Text(self.fix_library_source_mapping(&code, path))
            }
            binary => binary,
        };
        Ok(CompileResult {
            mime_type: sniffed.map(str::to_string),
            contents,
            dependent_files: Vec::new(),
        })
    }

    /// Invokes the transform, then decides whether its output terminates the
    /// cascade or must be re-dispatched as a new intermediate input.
    fn compile_uncached(
        &self,
        path: &Path,
        resolved: &ResolvedFile,
        transform: &Arc<dyn Transform>,
    ) -> Result<FetchedOutput, HostError> {
        let input_mime = mime::lookup_path(path);

        if resolved.fingerprint.is_binary {
            let bytes = match &resolved.contents {
                Some(FileContents::Binary(bytes)) => bytes.clone(),
                _ => std::fs::read(path).map_err(|e| HostError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })?,
            };
            return Ok(FetchedOutput {
                contents: FileContents::Binary(bytes),
                mime_type: input_mime.map(str::to_string),
                dependent_files: Vec::new(),
            });
        }

        let code = match resolved.contents.as_ref().and_then(FileContents::as_text) {
            Some(text) => text.to_string(),
            None => std::fs::read_to_string(path).map_err(|e| HostError::Io {
                path: path.to_path_buf(),
                source: e,
            })?,
        };

        if !transform.should_compile(&code, path) {
            debug!(path = %path.display(), "transform declined, returning source verbatim");
            return Ok(FetchedOutput {
                contents: FileContents::Text(code),
                mime_type: input_mime.map(str::to_string),
                dependent_files: Vec::new(),
            });
        }

        let dependent_files = transform.dependent_files(&code, path)?;
        let output = transform.compile(&code, path)?;

        // An HTML result nobody asked for is an inline-markup upgrade and
        // must keep cascading; everything else in a final form terminates.
        let inline_html_upgrade =
            input_mime != Some("text/html") && output.mime_type == "text/html";
        let kept_input_mime = input_mime == Some(output.mime_type.as_str());
        let is_passthrough = output.mime_type == mime::PASSTHROUGH_MIME_TYPE
            || resolved.fingerprint.should_passthrough();

        if (mime::is_final_form(&output.mime_type) && !inline_html_upgrade)
            || kept_input_mime
            || is_passthrough
        {
            return Ok(FetchedOutput {
                contents: FileContents::Text(output.code),
                mime_type: Some(output.mime_type),
                dependent_files,
            });
        }

        debug!(
            path = %path.display(),
            intermediate = %output.mime_type,
            "recursing into intermediate MIME type"
        );
        let next = self
            .transforms
            .get(output.mime_type.as_str())
            .cloned()
            .ok_or_else(|| HostError::RecursionDeadEnd {
                path: path.to_path_buf(),
                mime_type: output.mime_type.clone(),
            })?;

        // The pseudo-path only disambiguates MIME sniffing at the next
        // level; it never touches the filesystem.
        let extension = mime::canonical_extension(&output.mime_type).unwrap_or("txt");
        let pseudo_path = PathBuf::from(format!("{}.{}", path.display(), extension));
        let pseudo_resolved = ResolvedFile {
            fingerprint: resolved.fingerprint.clone(),
            contents: Some(FileContents::Text(output.code)),
        };
        self.compile_uncached(&pseudo_path, &pseudo_resolved, &next)
    }

    /// Passthrough files resolve through the `text/plain` transform;
    /// everything else through the transform registered for its MIME type.
    fn registered_transform(
        &self,
        fingerprint: &FileFingerprint,
        sniffed: Option<&str>,
    ) -> Option<&Arc<dyn Transform>> {
        if fingerprint.should_passthrough() {
            self.transforms.get(mime::PASSTHROUGH_MIME_TYPE)
        } else {
            sniffed.and_then(|mime_type| self.transforms.get(mime_type))
        }
    }

    fn select_transform(
        &self,
        fingerprint: &FileFingerprint,
        sniffed: Option<&str>,
    ) -> Option<Arc<dyn Transform>> {
        self.registered_transform(fingerprint, sniffed)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    fn cache_for(&self, transform: &dyn Transform) -> Result<&Arc<ArtifactCache>, HostError> {
        let digest = TransformIdentity::of(transform).namespace_digest().to_hex();
        self.caches
            .get(&digest)
            .ok_or_else(|| HostError::UnregisteredTransform {
                name: transform.name().to_string(),
            })
    }

    /// Rewrites a relative `sourceMappingURL` in vendored code so it resolves
    /// from the shipped location. Left unmodified when the referenced map
    /// already resolves, or when the reference is a data URL.
    fn fix_library_source_mapping(&self, code: &str, source_path: &Path) -> String {
        let Some(marker_pos) = code.rfind(SOURCE_MAP_PREFIX) else {
            return code.to_string();
        };
        let line_start = code[..marker_pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = code[marker_pos..]
            .find('\n')
            .map(|i| marker_pos + i)
            .unwrap_or(code.len());
        if !code[line_start..marker_pos].trim_start().starts_with("//#") {
            return code.to_string();
        }

        let url_start = marker_pos + SOURCE_MAP_PREFIX.len();
        let url = code[url_start..line_end].trim();
        if url.is_empty()
            || url.starts_with("data:")
            || url.starts_with('"')
            || url.starts_with('\'')
        {
            return code.to_string();
        }
        if Path::new(url).exists() {
            return code.to_string();
        }

        let key = paths::cache_key(source_path, self.change_cache.app_root(), None);
        let module_dir = Path::new(key.trim_start_matches('/'))
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if module_dir.is_empty() {
            return code.to_string();
        }

        let mut rewritten = String::with_capacity(code.len() + module_dir.len() + 1);
        rewritten.push_str(&code[..url_start]);
        rewritten.push_str(&module_dir);
        rewritten.push('/');
        rewritten.push_str(url);
        rewritten.push_str(&code[line_end..]);
        rewritten
    }
}
