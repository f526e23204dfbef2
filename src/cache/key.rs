use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use crate::{
    error::{Result, StemError},
    io::crypto::sha256_hex_parts,
};

/// Content address of a separation: digest of (absolute path, mtime, model).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Pure derivation from already-resolved inputs.
    pub fn derive(abs_path: &Path, mtime_secs: u64, model: &str) -> Self {
        let path = abs_path.to_string_lossy();
        let mtime = mtime_secs.to_string();
        CacheKey(sha256_hex_parts([path.as_bytes(), mtime.as_bytes(), model.as_bytes()]))
    }

    /// Resolve `path` against the filesystem and derive its key.
    pub fn for_file(path: &Path, model: &str) -> Result<Self> {
        let (abs, mtime) = file_identity(path)?;
        Ok(Self::derive(&abs, mtime, model))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute path and modification time (whole seconds) of an existing file.
pub fn file_identity(path: &Path) -> Result<(PathBuf, u64)> {
    if !path.exists() {
        return Err(StemError::InputMissing {
            path: path.to_path_buf(),
        });
    }
    let abs = fs::canonicalize(path)?;
    let mtime = fs::metadata(&abs)?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok((abs, mtime))
}
