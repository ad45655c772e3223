//! Per-song pipeline: scan, load, measure, then export or copy.

use std::{
    fs,
    path::Path,
    time::SystemTime,
};

use crate::{
    analysis,
    cache::{self, CacheData},
    gain::{self, GainAction},
    library::unix_secs,
    mixer::{self, AudioComponent},
    Codec, NormalizerConfig, Result, RunPaths, Song,
};

/// Terminal state of one song's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingOutcome {
    /// Stems were re-encoded with a gain correction.
    Exported,
    /// Stems were already at the target level and were copied.
    Copied,
    /// Nothing changed since the last run.
    Cached,
    /// No stem could be decoded.
    LoadError,
    /// No stem could be encoded.
    ExportError,
}

impl ProcessingOutcome {
    pub fn is_error(self) -> bool {
        matches!(self, Self::LoadError | Self::ExportError)
    }

    /// Whether the song's new cache entry should be persisted. Errors are
    /// left out so the song is retried next run.
    pub fn writes_cache(self) -> bool {
        matches!(self, Self::Exported | Self::Copied)
    }
}

/// What a processed song hands back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongReport {
    pub outcome: ProcessingOutcome,
    /// Cache key of the song.
    pub song: String,
    pub cache_data: CacheData,
}

/// Runs the pipeline for single songs against a codec and fixed settings.
pub struct SongProcessor<'a, C: Codec + ?Sized> {
    codec: &'a C,
    config: &'a NormalizerConfig,
    paths: &'a RunPaths,
}

impl<'a, C: Codec + ?Sized> SongProcessor<'a, C> {
    pub fn new(codec: &'a C, config: &'a NormalizerConfig, paths: &'a RunPaths) -> Self {
        Self {
            codec,
            config,
            paths,
        }
    }

    /// Processes `song`, using `stored` (its last cache entry, if any) to
    /// skip unchanged songs.
    ///
    /// Stem-level and song-level failures are reported through the outcome;
    /// an `Err` means something unexpected, such as an unwritable output
    /// folder.
    pub fn process(&self, mut song: Song, stored: Option<&CacheData>) -> Result<SongReport> {
        let key = song.key();
        song.scan()?;

        if cache::is_unchanged(stored, song.cache_data()) {
            tracing::info!(song = %key, "song in cache, skipping");
            return Ok(report(ProcessingOutcome::Cached, song));
        }

        let components = self.load_components(&song);
        if components.is_empty() {
            tracing::warn!(song = %key, "couldn't load any audio, skipping");
            return Ok(report(ProcessingOutcome::LoadError, song));
        }

        let dest = self.paths.destination_for(song.path());
        let created_dest = !dest.is_dir();
        if created_dest {
            fs::create_dir_all(&dest)?;
        }

        let volume = match mixer::combine(&components) {
            Some(mixed) => analysis::measure_dbfs(&mixed),
            None => f64::NEG_INFINITY,
        };
        tracing::info!(song = %key, "volume: {volume:.1} dBFS");

        let decision = gain::decide(volume, self.config.target_dbfs(), self.config.headroom_db());
        let (outcome, cache_data) = match decision.action {
            GainAction::Export => {
                tracing::info!(song = %key, "applying {:.1} dB of gain", decision.gain_db);
                let exported = self.export_components(components, &dest, decision.gain_db);
                if exported.is_empty() {
                    tracing::warn!(song = %key, "couldn't export any audio, skipping");
                    // Folders holding earlier output are kept.
                    if created_dest {
                        fs::remove_dir_all(&dest)?;
                    }
                    return Ok(report(ProcessingOutcome::ExportError, song));
                }
                (ProcessingOutcome::Exported, exported)
            }
            GainAction::Copy => {
                tracing::info!(
                    song = %key,
                    "song within {} dB of target, copying files",
                    self.config.headroom
                );
                let filenames: Vec<String> =
                    components.into_iter().map(|component| component.filename).collect();
                let copied = copy_components(song.path(), &filenames, &dest)?;
                (ProcessingOutcome::Copied, copied)
            }
        };

        copy_extras(&song, &dest)?;
        song.set_cache_data(cache_data);
        Ok(report(outcome, song))
    }

    /// Probes and decodes every stem, keeping only those that produced audio.
    fn load_components(&self, song: &Song) -> Vec<AudioComponent> {
        song.component_files()
            .iter()
            .filter_map(|filename| {
                tracing::info!(song = %song.path().display(), "loading {filename}");
                let path = song.path().join(filename);
                let loaded = self
                    .codec
                    .probe(&path)
                    .and_then(|info| Ok((self.codec.decode(&path, &info)?, info)));
                match loaded {
                    Ok((samples, _)) if samples.is_empty() => {
                        tracing::warn!(file = %path.display(), "decoded to no audio, skipping");
                        None
                    }
                    Ok((samples, info)) => Some(AudioComponent::new(filename.clone(), samples, info)),
                    Err(err) => {
                        tracing::warn!(file = %path.display(), %err, "error loading, skipping");
                        None
                    }
                }
            })
            .collect()
    }

    /// Encodes each component into `dest`. Consumes the components so their
    /// buffers are released as soon as they are written.
    fn export_components(
        &self,
        components: Vec<AudioComponent>,
        dest: &Path,
        gain_db: f64,
    ) -> CacheData {
        let mut exported = CacheData::new();
        for component in components {
            tracing::info!(dest = %dest.display(), "exporting {}", component.filename);
            let target = dest.join(&component.filename);
            match self.codec.encode(&component.samples, &component.info, gain_db, &target) {
                Ok(()) => {
                    exported.insert(component.filename, unix_secs(SystemTime::now()));
                }
                Err(err) => {
                    tracing::warn!(file = %target.display(), %err, "error exporting, skipping");
                    if target.exists() {
                        if let Err(err) = fs::remove_file(&target) {
                            tracing::warn!(file = %target.display(), %err, "unable to remove partial output");
                        }
                    }
                }
            }
        }
        exported
    }
}

fn report(outcome: ProcessingOutcome, song: Song) -> SongReport {
    SongReport {
        outcome,
        song: song.key(),
        cache_data: song.into_cache_data(),
    }
}

/// Copies stems unchanged, skipping destinations that are already up to date.
fn copy_components(src_dir: &Path, filenames: &[String], dest: &Path) -> Result<CacheData> {
    let mut copied = CacheData::new();
    for filename in filenames {
        let src = src_dir.join(filename);
        let target = dest.join(filename);
        if !is_up_to_date(&src, &target)? {
            copy_preserving_mtime(&src, &target)?;
        }
        copied.insert(filename.clone(), unix_secs(SystemTime::now()));
    }
    Ok(copied)
}

/// Copies every non-stem file that is not present at the destination yet.
fn copy_extras(song: &Song, dest: &Path) -> Result<()> {
    for filename in song.extra_files() {
        let target = dest.join(filename);
        if !target.exists() {
            fs::copy(song.path().join(filename), &target)?;
        }
    }
    Ok(())
}

/// A destination counts as an earlier copy of `src` only when it carries the
/// source's exact mtime and length, as [`copy_preserving_mtime`] leaves it.
/// Encoded output from an earlier export never matches and is overwritten.
fn is_up_to_date(src: &Path, target: &Path) -> Result<bool> {
    if !target.is_file() {
        return Ok(false);
    }
    let (src, target) = (fs::metadata(src)?, fs::metadata(target)?);
    Ok(target.modified()? == src.modified()? && target.len() == src.len())
}

fn copy_preserving_mtime(src: &Path, target: &Path) -> Result<()> {
    let modified = fs::metadata(src)?.modified()?;
    fs::copy(src, target)?;
    fs::File::options()
        .write(true)
        .open(target)?
        .set_modified(modified)?;
    Ok(())
}
