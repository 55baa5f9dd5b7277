//! Configuration snapshot persistence.
//!
//! A read-write session saves everything a read-only session needs to replay
//! it: the change-cache snapshot and the identity of every registered
//! transform, as one gzipped JSON document at a fixed path under the root
//! cache directory.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_cache::ChangeCacheSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::transform::TransformIdentity;

/// File name of the configuration document under the root cache directory.
pub const CONFIGURATION_FILE: &str = "compiler-info.json.gz";

/// The persisted session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConfiguration {
    /// Snapshot of the change cache.
    pub file_change_cache: ChangeCacheSnapshot,

    /// Identity of each registered transform, keyed by input MIME type.
    pub compilers: HashMap<String, TransformIdentity>,
}

impl SavedConfiguration {
    /// The configuration file path for a root cache directory.
    pub fn path_under(root_cache_dir: &Path) -> PathBuf {
        root_cache_dir.join(CONFIGURATION_FILE)
    }

    /// Writes this configuration under the root cache directory.
    pub fn write_to(&self, root_cache_dir: &Path) -> Result<(), HostError> {
        let target = Self::path_under(root_cache_dir);
        let json = serde_json::to_vec(self).map_err(|e| HostError::ConfigurationCorrupt {
            path: target.clone(),
            reason: e.to_string(),
        })?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(|e| HostError::Io {
            path: target.clone(),
            source: e,
        })?;
        let compressed = encoder.finish().map_err(|e| HostError::Io {
            path: target.clone(),
            source: e,
        })?;
        std::fs::write(&target, compressed).map_err(|e| HostError::Io {
            path: target,
            source: e,
        })
    }

    /// Reads the configuration saved under a root cache directory.
    pub fn read_from(root_cache_dir: &Path) -> Result<Self, HostError> {
        let target = Self::path_under(root_cache_dir);
        let file = std::fs::File::open(&target).map_err(|e| HostError::Io {
            path: target.clone(),
            source: e,
        })?;

        let mut json = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut json)
            .map_err(|e| HostError::ConfigurationCorrupt {
                path: target.clone(),
                reason: e.to_string(),
            })?;
        serde_json::from_str(&json).map_err(|e| HostError::ConfigurationCorrupt {
            path: target,
            reason: e.to_string(),
        })
    }
}
