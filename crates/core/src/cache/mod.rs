use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{Result, Song};

/// Filename → Unix timestamp (seconds) recorded for one song.
pub type CacheData = BTreeMap<String, i64>;

/// Returns true when `stored` proves the freshly scanned `fresh` data has not
/// changed since the song was last processed.
///
/// Every scanned file must be recorded with a timestamp no older than its
/// current one, and no recorded file may have disappeared.
pub fn is_unchanged(stored: Option<&CacheData>, fresh: &CacheData) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    let all_current = fresh.iter().all(|(filename, scanned)| {
        stored
            .get(filename)
            .is_some_and(|recorded| recorded >= scanned)
    });
    all_current && stored.keys().all(|filename| fresh.contains_key(filename))
}

/// Persistent map of song path → [`CacheData`], backed by one JSON file.
///
/// Only the coordinating thread owns a store; every [`CacheStore::write`]
/// flushes the whole map so an interrupted run keeps everything finished
/// before it.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    entries: BTreeMap<String, CacheData>,
}

impl CacheStore {
    /// Loads the store at `path`, creating an empty file when none exists.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.is_file() {
            let text = fs::read_to_string(&path)?;
            let entries = serde_json::from_str(&text)?;
            return Ok(Self { path, entries });
        }

        let store = Self {
            path,
            entries: BTreeMap::new(),
        };
        store.flush()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, CacheData> {
        &self.entries
    }

    /// Recorded data for the song stored under `key`.
    pub fn entry(&self, key: &str) -> Option<&CacheData> {
        self.entries.get(key)
    }

    /// Returns true when `song` (already scanned) needs processing.
    pub fn is_stale(&self, song: &Song) -> bool {
        !is_unchanged(self.entry(&song.key()), song.cache_data())
    }

    /// Records `data` for `key` and persists the whole store.
    pub fn write(&mut self, key: impl Into<String>, data: CacheData) -> Result<()> {
        let key = key.into();
        tracing::debug!(song = %key, files = data.len(), "writing cache entry");
        self.entries.insert(key, data);
        self.flush()
    }

    /// Serialises to a sibling temp file, then renames it over the store.
    fn flush(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.entries)?;
        let mut tmp_name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
