//! Content-addressed store of completed separations.
//!
//! One mutex guards the whole index. Entries are bounded with a least-recently-used
//! policy and the index is persisted to `index.json` so results survive restarts.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use tempfile::NamedTempFile;

use crate::{
    cache::key::{file_identity, CacheKey},
    error::{Result, StemError},
    types::StemSet,
};

const INDEX_FILE: &str = "index.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    source: PathBuf,
    model: String,
    stems: StemSet,
    last_used: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    tick: u64,
    entries: HashMap<CacheKey, CacheEntry>,
    #[serde(skip)]
    max_entries: usize,
}

impl CacheIndex {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_to_bound(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    log::debug!("cache evicting {k}");
                    self.entries.remove(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

pub struct SeparationCache {
    dir: PathBuf,
    index: Mutex<CacheIndex>,
}

impl SeparationCache {
    /// Open (or create) the cache rooted at `dir`, reloading any persisted index.
    pub fn open(dir: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut index = match fs::read(dir.join(INDEX_FILE)) {
            Ok(bytes) => serde_json::from_slice::<CacheIndex>(&bytes).unwrap_or_else(|e| {
                log::warn!("discarding unreadable cache index in {}: {e}", dir.display());
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        };
        index.max_entries = max_entries.max(1);
        index.evict_to_bound();
        log::debug!("cache opened at {} with {} entries", dir.display(), index.entries.len());

        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, path: &Path, model: &str) -> Option<StemSet> {
        let key = CacheKey::for_file(path, model).ok()?;
        self.lookup_key(&key)
    }

    /// Fetch by key, refreshing its recency. Entries whose stems vanished are dropped.
    pub fn lookup_key(&self, key: &CacheKey) -> Option<StemSet> {
        let mut index = self.lock();
        let resolvable = index.entries.get(key)?.stems.still_resolvable();
        if !resolvable {
            log::info!("cache entry {key} no longer resolves; dropping it");
            index.entries.remove(key);
            if let Err(e) = self.persist(&index) {
                log::warn!("failed to persist cache index: {e}");
            }
            return None;
        }
        let tick = index.touch();
        let entry = index.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.stems.clone())
    }

    pub fn contains(&self, path: &Path, model: &str) -> bool {
        self.lookup(path, model).is_some()
    }

    /// Remember `stems` as the separation of `path` under `model`.
    pub fn store(&self, path: &Path, model: &str, stems: &StemSet) -> Result<CacheKey> {
        if !stems.is_valid() || stems.is_live() {
            return Err(StemError::Anyhow(anyhow!(
                "only complete file-based stem sets can be cached"
            )));
        }
        let (abs, mtime) = file_identity(path)?;
        let key = CacheKey::derive(&abs, mtime, model);

        let mut index = self.lock();
        let tick = index.touch();
        index.entries.insert(
            key.clone(),
            CacheEntry {
                source: abs,
                model: model.to_string(),
                stems: stems.clone(),
                last_used: tick,
            },
        );
        index.evict_to_bound();
        self.persist(&index)?;
        Ok(key)
    }

    /// Re-bound the cache, evicting least-recently-used entries as needed.
    pub fn set_max_entries(&self, max_entries: usize) -> Result<()> {
        let mut index = self.lock();
        index.max_entries = max_entries.max(1);
        if index.evict_to_bound() > 0 {
            self.persist(&index)?;
        }
        Ok(())
    }

    /// Forget every entry and wipe the on-disk cache directory.
    pub fn clear(&self) -> Result<()> {
        let mut index = self.lock();
        index.entries.clear();
        index.tick = 0;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        log::info!("separation cache cleared");
        Ok(())
    }

    fn persist(&self, index: &CacheIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(self.dir.join(INDEX_FILE))
            .map_err(|e| StemError::Io(e.error))?;
        Ok(())
    }
}
