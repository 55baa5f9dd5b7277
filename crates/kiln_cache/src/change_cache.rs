//! Path-keyed fingerprint cache with mtime/size invalidation.
//!
//! The change cache answers "what is the fingerprint of this file right now"
//! without rehashing unchanged content: an entry whose recorded mtime and
//! size match the current stat is served from memory. In strict (read-only)
//! mode the cache never touches the filesystem at all; a missing entry means
//! the file was never precompiled and resolution fails.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::{paths, task};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::fingerprint::{classify, FileContents, FileFingerprint};

/// Persisted record for one observed file.
///
/// Replaced wholesale when the underlying file changes; never partially
/// updated. The mtime field is serialized as `ctime` in the wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeCacheEntry {
    /// File modification time, milliseconds since the epoch.
    #[serde(rename = "ctime")]
    pub mtime: u64,

    /// File size in bytes.
    pub size: u64,

    /// The fingerprint computed when this entry was recorded.
    pub info: FileFingerprint,
}

/// Serializable form of a [`ChangeCache`], written inside the host's
/// configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCacheSnapshot {
    /// Entries keyed by sanitized root-relative path.
    pub change_cache: HashMap<String, ChangeCacheEntry>,

    /// The app root the snapshot was written against.
    pub app_root: Option<String>,
}

/// A fingerprint resolution result.
///
/// The decoded payload is attached only when the file was actually read in
/// this call (a cache miss); served-from-memory resolutions carry the
/// fingerprint alone.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// The file's fingerprint.
    pub fingerprint: FileFingerprint,

    /// Decoded payload, present only on a fingerprint cache miss.
    pub contents: Option<FileContents>,
}

/// Caches fingerprints for files under an application root.
///
/// Interior mutability lets one host issue concurrently outstanding
/// resolutions for different paths; entries for the same path may race to
/// recompute, in which case the last writer wins with an identical value.
#[derive(Debug)]
pub struct ChangeCache {
    app_root: Option<String>,
    original_app_root: Option<String>,
    strict: bool,
    entries: Mutex<HashMap<String, ChangeCacheEntry>>,
}

impl ChangeCache {
    /// Creates an empty read-write change cache rooted at `app_root`.
    pub fn new(app_root: Option<&Path>) -> Self {
        Self {
            app_root: app_root.map(|p| paths::sanitize_path(&p.to_string_lossy())),
            original_app_root: None,
            strict: false,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Rehydrates a change cache from snapshot data.
    ///
    /// `strict` corresponds to read-only mode: lookups of unknown paths fail
    /// with [`CacheError::PrecompiledEntryMissing`] and the filesystem is
    /// never consulted. The snapshot's own app root is kept as a second
    /// strippable prefix so a relocated layout still resolves.
    pub fn restore(snapshot: ChangeCacheSnapshot, app_root: Option<&Path>, strict: bool) -> Self {
        Self {
            app_root: app_root.map(|p| paths::sanitize_path(&p.to_string_lossy())),
            original_app_root: snapshot.app_root,
            strict,
            entries: Mutex::new(snapshot.change_cache),
        }
    }

    /// Loads a change cache from a gzipped snapshot file.
    pub fn load(path: &Path, app_root: Option<&Path>, strict: bool) -> Result<Self, CacheError> {
        let file = std::fs::File::open(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut json = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut json)
            .map_err(|e| CacheError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        let snapshot: ChangeCacheSnapshot =
            serde_json::from_str(&json).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        Ok(Self::restore(snapshot, app_root, strict))
    }

    /// Returns snapshot data that [`ChangeCache::restore`] can rehydrate.
    pub fn snapshot(&self) -> ChangeCacheSnapshot {
        ChangeCacheSnapshot {
            change_cache: self.lock().clone(),
            app_root: self.app_root.clone(),
        }
    }

    /// Serializes this cache to a gzipped snapshot file.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let json =
            serde_json::to_vec(&self.snapshot()).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(|e| CacheError::Io {
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

    /// The sanitized app root this cache strips from keys.
    pub fn app_root(&self) -> Option<&str> {
        self.app_root.as_deref()
    }

    /// Returns `true` if this cache fails on misses instead of reading files.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves the fingerprint for a path.
    ///
    /// Read-write mode: stats the file; a live entry (equal mtime and size)
    /// is returned without touching file contents, otherwise the file is
    /// read, classified, and the entry replaced. The decoded payload rides
    /// along on the returned [`ResolvedFile`] for that call only.
    ///
    /// Strict mode: returns the stored fingerprint or fails with
    /// [`CacheError::PrecompiledEntryMissing`]; never touches the filesystem.
    pub fn resolve(&self, path: &Path) -> Result<ResolvedFile, CacheError> {
        let key = self.key_for(path);

        if self.strict {
            let entries = self.lock();
            return match entries.get(&key) {
                Some(entry) => Ok(ResolvedFile {
                    fingerprint: entry.info.clone(),
                    contents: None,
                }),
                None => Err(CacheError::PrecompiledEntryMissing {
                    path: path.to_path_buf(),
                }),
            };
        }

        let metadata = std::fs::metadata(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if !metadata.is_file() {
            return Err(CacheError::NotAFile {
                path: path.to_path_buf(),
            });
        }
        let mtime = mtime_millis(&metadata, path)?;
        let size = metadata.len();

        {
            let mut entries = self.lock();
            if let Some(entry) = entries.get(&key) {
                if entry.mtime == mtime && entry.size == size {
                    return Ok(ResolvedFile {
                        fingerprint: entry.info.clone(),
                        contents: None,
                    });
                }
                debug!(
                    key = %key,
                    entry_mtime = entry.mtime,
                    mtime,
                    entry_size = entry.size,
                    size,
                    "invalidating change cache entry"
                );
                entries.remove(&key);
            }
        }

        let bytes = std::fs::read(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let (fingerprint, contents) = classify(path, bytes);

        self.lock().insert(
            key,
            ChangeCacheEntry {
                mtime,
                size,
                info: fingerprint.clone(),
            },
        );

        Ok(ResolvedFile {
            fingerprint,
            contents: Some(contents),
        })
    }

    /// Async twin of [`ChangeCache::resolve`].
    pub async fn resolve_async(self: &Arc<Self>, path: &Path) -> Result<ResolvedFile, CacheError> {
        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        task::run_blocking(move || cache.resolve(&path)).await
    }

    /// Async twin of [`ChangeCache::save`].
    pub async fn save_async(self: &Arc<Self>, path: &Path) -> Result<(), CacheError> {
        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        task::run_blocking(move || cache.save(&path)).await
    }

    /// Async twin of [`ChangeCache::load`].
    pub async fn load_async(
        path: &Path,
        app_root: Option<&Path>,
        strict: bool,
    ) -> Result<Self, CacheError> {
        let path = path.to_path_buf();
        let app_root = app_root.map(Path::to_path_buf);
        task::run_blocking(move || Self::load(&path, app_root.as_deref(), strict)).await
    }

    fn key_for(&self, path: &Path) -> String {
        paths::cache_key(path, self.app_root(), self.original_app_root.as_deref())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChangeCacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn mtime_millis(metadata: &std::fs::Metadata, path: &Path) -> Result<u64, CacheError> {
    let modified = metadata.modified().map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0))
}
