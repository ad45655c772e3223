//! Discovery of song folders and their stems.

use std::{
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use walkdir::WalkDir;

use crate::{cache::CacheData, NormalizerError, Result};

/// Stem names the game reads audio from.
pub const STEM_NAMES: [&str; 11] = [
    "crowd", "song", "guitar", "drums", "drums_1", "drums_2", "drums_3", "drums_4", "rhythm",
    "vocals", "keys",
];

/// Container extensions accepted for stems.
pub const AUDIO_EXTENSIONS: [&str; 2] = ["ogg", "mp3"];

/// Files whose presence marks a folder as a song.
pub const CHART_FILES: [&str; 2] = ["notes.chart", "notes.mid"];

/// Returns true when `filename` is one of the recognised stem files.
pub fn is_component(filename: &str) -> bool {
    filename.rsplit_once('.').is_some_and(|(stem, extension)| {
        STEM_NAMES.contains(&stem) && AUDIO_EXTENSIONS.contains(&extension)
    })
}

/// Returns true when `dir` holds a chart file.
pub fn has_chart(dir: &Path) -> bool {
    CHART_FILES.iter().any(|name| dir.join(name).is_file())
}

/// Modification time of `path` in whole seconds since the Unix epoch.
pub fn modified_secs(path: &Path) -> Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(unix_secs(modified))
}

pub(crate) fn unix_secs(time: std::time::SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// One song folder: a chart plus any number of stems and extra files.
#[derive(Debug, Clone)]
pub struct Song {
    path: PathBuf,
    component_files: Vec<String>,
    extra_files: Vec<String>,
    cache_data: CacheData,
}

impl Song {
    /// Wraps `path` as a song. Fails when the folder has no chart file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !has_chart(&path) {
            return Err(NormalizerError::ChartMissing(path));
        }
        Ok(Self {
            path,
            component_files: Vec::new(),
            extra_files: Vec::new(),
            cache_data: CacheData::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key the song is stored under in the cache.
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn component_files(&self) -> &[String] {
        &self.component_files
    }

    pub fn extra_files(&self) -> &[String] {
        &self.extra_files
    }

    pub fn cache_data(&self) -> &CacheData {
        &self.cache_data
    }

    pub(crate) fn set_cache_data(&mut self, data: CacheData) {
        self.cache_data = data;
    }

    pub(crate) fn into_cache_data(self) -> CacheData {
        self.cache_data
    }

    /// Lists the folder's files and records each stem's modification time.
    ///
    /// Files are kept in name order so repeated scans agree.
    pub fn scan(&mut self) -> Result<()> {
        let mut components = Vec::new();
        let mut extras = Vec::new();
        let mut cache_data = CacheData::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            if is_component(&filename) {
                cache_data.insert(filename.clone(), modified_secs(&entry.path())?);
                components.push(filename);
            } else {
                extras.push(filename);
            }
        }

        components.sort();
        extras.sort();
        self.component_files = components;
        self.extra_files = extras;
        self.cache_data = cache_data;
        Ok(())
    }
}

/// Walks `root` and returns every folder holding a chart file, sorted by path.
pub fn discover(root: &Path) -> Result<Vec<Song>> {
    if !root.is_dir() {
        return Err(NormalizerError::msg(format!(
            "input folder {} does not exist",
            root.display()
        )));
    }

    let mut songs = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("error accessing entry: {err}");
                continue;
            }
        };
        if entry.file_type().is_dir() && has_chart(entry.path()) {
            songs.push(Song::open(entry.path())?);
        }
    }

    songs.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(root = %root.display(), count = songs.len(), "discovered songs");
    Ok(songs)
}
