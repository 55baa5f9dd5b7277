//! Per-transform, content-addressed artifact storage.
//!
//! One `ArtifactCache` exists per distinct transform identity, rooted at
//! `<rootCacheDir>/<identity digest>`. Text artifacts are stored as a single
//! gzipped JSON envelope `{code, mimeType, dependentFiles}`; binary artifacts
//! are stored as the gzipped raw bytes plus a plain JSON `.info` sidecar
//! carrying the MIME type and dependent files. Reads are fail-safe: a missing
//! or corrupt blob is a cache miss, never an error.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::{task, ContentHash};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change_cache::{ChangeCache, ResolvedFile};
use crate::error::CacheError;
use crate::fingerprint::{FileContents, FileFingerprint};

/// Envelope for a stored text artifact.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextEnvelope {
    code: String,
    mime_type: String,
    dependent_files: Vec<PathBuf>,
}

/// Sidecar metadata for a stored binary artifact.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinarySidecar {
    mime_type: String,
    dependent_files: Vec<PathBuf>,
}

/// Result of an artifact lookup.
///
/// The fingerprint resolution always succeeds (or the lookup errors); the
/// payload is present only when a stored artifact was found and decoded.
#[derive(Debug)]
pub struct ArtifactLookup {
    /// The fingerprint resolution for the path.
    pub resolved: ResolvedFile,

    /// The stored payload, if the lookup hit.
    pub payload: Option<FileContents>,

    /// The stored MIME type, if the lookup hit.
    pub mime_type: Option<String>,

    /// Extra files the producing transform consulted.
    pub dependent_files: Vec<PathBuf>,
}

/// A payload produced by a fetcher on a cache miss.
#[derive(Debug, Clone)]
pub struct FetchedOutput {
    /// The produced payload.
    pub contents: FileContents,

    /// MIME type of the payload; `None` means "unknown, do not persist".
    pub mime_type: Option<String>,

    /// Extra files the producer consulted.
    pub dependent_files: Vec<PathBuf>,
}

/// The settled result of get-or-fetch: either the stored artifact or the
/// freshly fetched payload.
#[derive(Debug)]
pub struct CachedArtifact {
    /// The fingerprint the artifact is keyed under.
    pub fingerprint: FileFingerprint,

    /// The artifact payload.
    pub contents: FileContents,

    /// MIME type, absent when the fetcher produced an unpersistable result.
    pub mime_type: Option<String>,

    /// Extra files the producing transform consulted.
    pub dependent_files: Vec<PathBuf>,
}

/// Content-addressed store for one transform's compiled output.
pub struct ArtifactCache {
    cache_dir: PathBuf,
    change_cache: Arc<ChangeCache>,
}

impl ArtifactCache {
    /// Creates an artifact cache rooted at `cache_dir`.
    ///
    /// The directory is created unless the cache is read-only.
    pub fn new(
        cache_dir: PathBuf,
        change_cache: Arc<ChangeCache>,
        read_only: bool,
    ) -> Result<Self, CacheError> {
        if !read_only {
            std::fs::create_dir_all(&cache_dir).map_err(|e| CacheError::Io {
                path: cache_dir.clone(),
                source: e,
            })?;
        }
        Ok(Self {
            cache_dir,
            change_cache,
        })
    }

    /// The directory artifacts are stored in.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the blob path for a digest.
    fn artifact_path(&self, digest: &ContentHash) -> PathBuf {
        self.cache_dir.join(digest.to_hex())
    }

    /// Looks up the stored artifact for a path.
    ///
    /// Resolves the fingerprint through the change cache (strict-mode
    /// failures propagate), then attempts to read and decode the stored
    /// blob. Any read, decompression, or parse failure is a cache miss.
    pub fn get(&self, path: &Path) -> Result<ArtifactLookup, CacheError> {
        let resolved = self.change_cache.resolve(path)?;
        let blob = self.artifact_path(&resolved.fingerprint.digest);

        let mut lookup = ArtifactLookup {
            resolved,
            payload: None,
            mime_type: None,
            dependent_files: Vec::new(),
        };

        if lookup.resolved.fingerprint.is_binary {
            let sidecar: BinarySidecar = match std::fs::read(blob.with_extension("info"))
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
            {
                Some(sidecar) => sidecar,
                None => {
                    debug!(path = %path.display(), "artifact miss (no binary sidecar)");
                    return Ok(lookup);
                }
            };

            // Reuse the bytes read during fingerprinting when we have them.
            let bytes = match &lookup.resolved.contents {
                Some(FileContents::Binary(bytes)) => Some(bytes.clone()),
                _ => read_gzipped(&blob),
            };
            if let Some(bytes) = bytes {
                lookup.payload = Some(FileContents::Binary(bytes));
                lookup.mime_type = Some(sidecar.mime_type);
                lookup.dependent_files = sidecar.dependent_files;
            }
        } else if let Some(envelope) = read_gzipped(&blob)
            .and_then(|raw| serde_json::from_slice::<TextEnvelope>(&raw).ok())
        {
            lookup.payload = Some(FileContents::Text(envelope.code));
            lookup.mime_type = Some(envelope.mime_type);
            lookup.dependent_files = envelope.dependent_files;
        } else {
            debug!(path = %path.display(), blob = %blob.display(), "artifact miss");
        }

        Ok(lookup)
    }

    /// Persists a payload under the fingerprint's digest.
    ///
    /// Idempotent; overwriting an existing blob with identical content is
    /// safe. Distinct digests never collide, and racing writers for the same
    /// digest produce identical bytes by assumption.
    pub fn save(
        &self,
        fingerprint: &FileFingerprint,
        contents: &FileContents,
        mime_type: &str,
        dependent_files: &[PathBuf],
    ) -> Result<(), CacheError> {
        let blob = self.artifact_path(&fingerprint.digest);
        debug!(blob = %blob.display(), mime_type, "saving artifact");

        if fingerprint.is_binary {
            let sidecar = BinarySidecar {
                mime_type: mime_type.to_string(),
                dependent_files: dependent_files.to_vec(),
            };
            let sidecar_json =
                serde_json::to_vec(&sidecar).map_err(|e| CacheError::Serialization {
                    reason: e.to_string(),
                })?;
            let info_path = blob.with_extension("info");
            std::fs::write(&info_path, sidecar_json).map_err(|e| CacheError::Io {
                path: info_path,
                source: e,
            })?;
            write_gzipped(&blob, contents.as_bytes())
        } else {
            let envelope = TextEnvelope {
                code: match contents {
                    FileContents::Text(code) => code.clone(),
                    FileContents::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                },
                mime_type: mime_type.to_string(),
                dependent_files: dependent_files.to_vec(),
            };
            let json = serde_json::to_vec(&envelope).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
            write_gzipped(&blob, &json)
        }
    }

    /// Returns the stored artifact for a path, or fetches, persists, and
    /// returns a fresh one.
    ///
    /// This is the sole place where compute-vs-reuse is decided. The fetched
    /// result is persisted only when it carries a MIME type and the file is
    /// not library code; library results are cheap passthroughs that would
    /// pollute the namespace.
    pub fn get_or_fetch<E, F>(&self, path: &Path, fetcher: F) -> Result<CachedArtifact, E>
    where
        E: From<CacheError>,
        F: FnOnce(&Path, &ResolvedFile) -> Result<FetchedOutput, E>,
    {
        let lookup = self.get(path)?;
        if let Some(payload) = lookup.payload {
            return Ok(CachedArtifact {
                fingerprint: lookup.resolved.fingerprint,
                contents: payload,
                mime_type: lookup.mime_type,
                dependent_files: lookup.dependent_files,
            });
        }

        let fetched = fetcher(path, &lookup.resolved)?;
        let fingerprint = lookup.resolved.fingerprint;

        if let Some(mime_type) = &fetched.mime_type {
            if !fingerprint.is_library_code {
                debug!(path = %path.display(), "cache miss, persisting fetched artifact");
                self.save(
                    &fingerprint,
                    &fetched.contents,
                    mime_type,
                    &fetched.dependent_files,
                )?;
            }
        }

        Ok(CachedArtifact {
            fingerprint,
            contents: fetched.contents,
            mime_type: fetched.mime_type,
            dependent_files: fetched.dependent_files,
        })
    }

    /// Async twin of [`ArtifactCache::get`].
    pub async fn get_async(self: &Arc<Self>, path: &Path) -> Result<ArtifactLookup, CacheError> {
        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        task::run_blocking(move || cache.get(&path)).await
    }

    /// Async twin of [`ArtifactCache::save`].
    pub async fn save_async(
        self: &Arc<Self>,
        fingerprint: FileFingerprint,
        contents: FileContents,
        mime_type: String,
        dependent_files: Vec<PathBuf>,
    ) -> Result<(), CacheError> {
        let cache = Arc::clone(self);
        task::run_blocking(move || {
            cache.save(&fingerprint, &contents, &mime_type, &dependent_files)
        })
        .await
    }

    /// Async twin of [`ArtifactCache::get_or_fetch`]; the fetcher itself runs
    /// on the blocking pool.
    pub async fn get_or_fetch_async<E, F>(
        self: &Arc<Self>,
        path: &Path,
        fetcher: F,
    ) -> Result<CachedArtifact, E>
    where
        E: From<CacheError> + Send + 'static,
        F: FnOnce(&Path, &ResolvedFile) -> Result<FetchedOutput, E> + Send + 'static,
    {
        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        task::run_blocking(move || cache.get_or_fetch(&path, fetcher)).await
    }
}

fn read_gzipped(path: &Path) -> Option<Vec<u8>> {
    let file = std::fs::File::open(path).ok()?;
    let mut raw = Vec::new();
    GzDecoder::new(file).read_to_end(&mut raw).ok()?;
    Some(raw)
}

fn write_gzipped(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let compressed = encoder.finish().map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(path, compressed).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, Arc<ChangeCache>, Arc<ArtifactCache>) {
        let dir = tempfile::tempdir().unwrap();
        let change_cache = Arc::new(ChangeCache::new(Some(dir.path())));
        let cache = Arc::new(
            ArtifactCache::new(
                dir.path().join("cache").join("ns"),
                Arc::clone(&change_cache),
                false,
            )
            .unwrap(),
        );
        (dir, change_cache, cache)
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn miss_then_save_then_hit() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.js", b"let x = 1;\n");

        let miss = cache.get(&file).unwrap();
        assert!(miss.payload.is_none());

        cache
            .save(
                &miss.resolved.fingerprint,
                &FileContents::Text("compiled".into()),
                "application/javascript",
                &[PathBuf::from("/app/b.js")],
            )
            .unwrap();

        let hit = cache.get(&file).unwrap();
        assert_eq!(hit.payload.unwrap().as_text(), Some("compiled"));
        assert_eq!(hit.mime_type.as_deref(), Some("application/javascript"));
        assert_eq!(hit.dependent_files, vec![PathBuf::from("/app/b.js")]);
    }

    #[test]
    fn binary_artifact_uses_sidecar() {
        let (dir, _cc, cache) = setup();
        let payload: Vec<u8> = (0..512u32).map(|i| (i * 7 % 251) as u8).collect();
        let file = write_file(dir.path(), "logo.png", &payload);

        let miss = cache.get(&file).unwrap();
        assert!(miss.resolved.fingerprint.is_binary);
        assert!(miss.payload.is_none());

        cache
            .save(
                &miss.resolved.fingerprint,
                &FileContents::Binary(payload.clone()),
                "image/png",
                &[],
            )
            .unwrap();

        let digest = miss.resolved.fingerprint.digest.to_hex();
        assert!(cache.cache_dir().join(&digest).exists());
        assert!(cache.cache_dir().join(format!("{digest}.info")).exists());

        let hit = cache.get(&file).unwrap();
        assert_eq!(hit.payload.unwrap().as_bytes(), payload.as_slice());
        assert_eq!(hit.mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn corrupt_blob_is_a_miss() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.js", b"let x = 1;\n");

        let miss = cache.get(&file).unwrap();
        let blob = cache.artifact_path(&miss.resolved.fingerprint.digest);
        fs::write(&blob, b"not gzip at all").unwrap();

        let lookup = cache.get(&file).unwrap();
        assert!(lookup.payload.is_none(), "corruption reads as a miss");
    }

    #[test]
    fn get_or_fetch_fetches_once() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.ts", b"let x: number = 1;\n");

        let mut calls = 0;
        let first = cache
            .get_or_fetch::<CacheError, _>(&file, |_, _| {
                calls += 1;
                Ok(FetchedOutput {
                    contents: FileContents::Text("var x = 1;".into()),
                    mime_type: Some("application/javascript".into()),
                    dependent_files: vec![],
                })
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(first.contents.as_text(), Some("var x = 1;"));

        let second = cache
            .get_or_fetch::<CacheError, _>(&file, |_, _| {
                calls += 1;
                unreachable!("second call must be served from the cache")
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(second.contents.as_text(), Some("var x = 1;"));
    }

    #[test]
    fn fetch_without_mime_type_is_not_persisted() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.unknown_ext", b"some text content here\n");

        let fetched = cache
            .get_or_fetch::<CacheError, _>(&file, |_, resolved| {
                assert!(!resolved.fingerprint.is_binary);
                Ok(FetchedOutput {
                    contents: FileContents::Text("text".into()),
                    mime_type: None,
                    dependent_files: vec![],
                })
            })
            .unwrap();
        assert!(fetched.mime_type.is_none());

        let lookup = cache.get(&file).unwrap();
        assert!(lookup.payload.is_none(), "nothing was persisted");
    }

    #[test]
    fn library_code_is_never_persisted() {
        let (dir, _cc, cache) = setup();
        let lib_dir = dir.path().join("node_modules").join("dep");
        fs::create_dir_all(&lib_dir).unwrap();
        let file = write_file(&lib_dir, "index.js", b"module.exports = 1;\n");

        let fetched = cache
            .get_or_fetch::<CacheError, _>(&file, |_, _| {
                Ok(FetchedOutput {
                    contents: FileContents::Text("module.exports = 1;\n".into()),
                    mime_type: Some("application/javascript".into()),
                    dependent_files: vec![],
                })
            })
            .unwrap();
        assert!(fetched.fingerprint.is_library_code);

        let lookup = cache.get(&file).unwrap();
        assert!(lookup.payload.is_none(), "library results stay uncached");
    }

    #[test]
    fn fetcher_error_propagates() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.js", b"let x = 1;\n");

        let err = cache
            .get_or_fetch::<CacheError, _>(&file, |path, _| {
                Err(CacheError::NotAFile {
                    path: path.to_path_buf(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::NotAFile { .. }));
    }

    #[test]
    fn read_only_cache_does_not_create_directories() {
        let dir = tempfile::tempdir().unwrap();
        let change_cache = Arc::new(ChangeCache::new(Some(dir.path())));
        let ns = dir.path().join("cache").join("ns");
        let _cache = ArtifactCache::new(ns.clone(), change_cache, true).unwrap();
        assert!(!ns.exists());
    }

    #[tokio::test]
    async fn async_twins_share_the_layout() {
        let (dir, _cc, cache) = setup();
        let file = write_file(dir.path(), "a.ts", b"let x: number = 1;\n");

        let fetched = cache
            .get_or_fetch_async::<CacheError, _>(&file, |_, _| {
                Ok(FetchedOutput {
                    contents: FileContents::Text("var x = 1;".into()),
                    mime_type: Some("application/javascript".into()),
                    dependent_files: vec![],
                })
            })
            .await
            .unwrap();
        assert_eq!(fetched.contents.as_text(), Some("var x = 1;"));

        // The sync path sees what the async path wrote.
        let hit = cache.get(&file).unwrap();
        assert_eq!(hit.payload.unwrap().as_text(), Some("var x = 1;"));
    }
}
