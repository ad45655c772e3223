//! Runs the song processor over a whole library.
//!
//! Songs are independent, so they can be handled one after another or by a
//! pool of worker threads. Either way only the coordinating thread touches
//! the [`CacheStore`]: workers send their [`SongReport`]s back over a channel
//! and the coordinator persists them one at a time.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{
    cache::{CacheData, CacheStore},
    Codec, NormalizerConfig, NormalizerError, ProcessingOutcome, Result, RunPaths, Song,
    SongProcessor, SongReport,
};

/// How often the coordinator wakes up to check for an interrupt while
/// waiting on workers.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A song whose processing failed unexpectedly (an error outside the
/// outcome taxonomy, or a panic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub song: String,
    pub cause: String,
}

impl From<WorkerFailure> for NormalizerError {
    fn from(failure: WorkerFailure) -> Self {
        NormalizerError::Worker {
            song: failure.song,
            cause: failure.cause,
        }
    }
}

/// Progress notification handed to the caller after each song, together with
/// the counters so far.
#[derive(Debug, Clone, Copy)]
pub enum SongEvent<'a> {
    Finished(&'a SongReport),
    Failed(&'a WorkerFailure),
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub songs: usize,
    pub exported: usize,
    pub copied: usize,
    pub cached: usize,
    pub errors: usize,
    /// Set when the run stopped early because of an interrupt.
    pub interrupted: bool,
    pub failures: Vec<WorkerFailure>,
}

impl RunSummary {
    fn new(songs: usize) -> Self {
        Self {
            songs,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Exported => self.exported += 1,
            ProcessingOutcome::Copied => self.copied += 1,
            ProcessingOutcome::Cached => self.cached += 1,
            ProcessingOutcome::LoadError | ProcessingOutcome::ExportError => self.errors += 1,
        }
    }

    /// Songs that reached any terminal state.
    pub fn processed(&self) -> usize {
        self.exported + self.copied + self.cached + self.errors
    }

    /// Surfaces the first captured worker failure, if any.
    pub fn into_result(self) -> Result<Self> {
        match self.failures.first() {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(self),
        }
    }
}

enum WorkerMessage {
    Finished(SongReport),
    Failed(WorkerFailure),
}

struct Job {
    song: Song,
    stored: Option<CacheData>,
}

/// Sets the flag when dropped, so workers stop picking up jobs however the
/// coordinator leaves.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Drives the [`SongProcessor`] over a list of songs.
pub struct Scheduler<C: Codec + 'static> {
    codec: Arc<C>,
    config: Arc<NormalizerConfig>,
    paths: Arc<RunPaths>,
    workers: usize,
    interrupt: Arc<AtomicBool>,
}

impl<C: Codec + 'static> Scheduler<C> {
    /// Creates a scheduler using one worker per logical CPU when
    /// multithreading is enabled, and sequential processing otherwise.
    pub fn new(codec: Arc<C>, config: NormalizerConfig, paths: RunPaths) -> Self {
        let workers = if config.multithreading {
            num_cpus::get()
        } else {
            1
        };
        Self {
            codec,
            config: Arc::new(config),
            paths: Arc::new(paths),
            workers,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the worker count. One worker means sequential processing.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Uses `flag` as the interrupt signal; setting it stops the run.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Processes `songs`, persisting each changed song's cache entry as soon
    /// as its result arrives.
    ///
    /// Unexpected failures do not stop the run; they are collected in
    /// [`RunSummary::failures`] once every result has been drained. Only a
    /// cache write failure aborts with `Err`.
    pub fn run<F>(&self, songs: Vec<Song>, cache: &mut CacheStore, on_event: F) -> Result<RunSummary>
    where
        F: FnMut(SongEvent<'_>, &RunSummary),
    {
        if self.workers <= 1 {
            self.run_sequential(songs, cache, on_event)
        } else {
            self.run_pooled(songs, cache, on_event)
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn run_sequential<F>(
        &self,
        songs: Vec<Song>,
        cache: &mut CacheStore,
        mut on_event: F,
    ) -> Result<RunSummary>
    where
        F: FnMut(SongEvent<'_>, &RunSummary),
    {
        let total = songs.len();
        let mut summary = RunSummary::new(total);

        for (index, song) in songs.into_iter().enumerate() {
            if self.interrupted() {
                summary.interrupted = true;
                break;
            }
            tracing::info!(song = %song.path().display(), "song {}/{}", index + 1, total);
            let stored = cache.entry(&song.key()).cloned();
            let message = process_guarded(
                self.codec.as_ref(),
                &self.config,
                &self.paths,
                song,
                stored.as_ref(),
            );
            handle_message(message, cache, &mut summary, &mut on_event)?;
        }

        Ok(summary)
    }

    fn run_pooled<F>(
        &self,
        songs: Vec<Song>,
        cache: &mut CacheStore,
        mut on_event: F,
    ) -> Result<RunSummary>
    where
        F: FnMut(SongEvent<'_>, &RunSummary),
    {
        let mut summary = RunSummary::new(songs.len());

        // Songs the cache already vouches for never take a worker slot.
        let mut pending = Vec::new();
        for mut song in songs {
            match song.scan() {
                Ok(()) if !cache.is_stale(&song) => {
                    tracing::debug!(song = %song.path().display(), "in cache");
                    let report = SongReport {
                        outcome: ProcessingOutcome::Cached,
                        song: song.key(),
                        cache_data: song.cache_data().clone(),
                    };
                    handle_message(WorkerMessage::Finished(report), cache, &mut summary, &mut on_event)?;
                }
                // Scan errors are left for the worker to report.
                _ => {
                    let stored = cache.entry(&song.key()).cloned();
                    pending.push(Job { song, stored });
                }
            }
        }

        if pending.is_empty() || self.interrupted() {
            summary.interrupted = self.interrupted();
            return Ok(summary);
        }

        let dispatched = pending.len();
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for job in pending {
            job_tx
                .send(job)
                .map_err(|_| NormalizerError::msg("job queue closed before dispatch"))?;
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let stop = StopOnDrop(Arc::new(AtomicBool::new(false)));
        let worker_count = self.workers.min(dispatched);
        tracing::info!("running {worker_count} workers");

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let codec = Arc::clone(&self.codec);
            let config = Arc::clone(&self.config);
            let paths = Arc::clone(&self.paths);
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let stop = Arc::clone(&stop.0);
            let handle = thread::Builder::new()
                .name(format!("normalizer-worker-{id}"))
                .spawn(move || {
                    worker_loop(codec.as_ref(), &config, &paths, &jobs, &results, &stop);
                })?;
            handles.push(handle);
        }
        drop(result_tx);

        let mut received = 0;
        while received < dispatched {
            if self.interrupted() {
                // In-flight workers are abandoned; their results are lost.
                tracing::warn!(received, dispatched, "interrupted, abandoning in-flight songs");
                summary.interrupted = true;
                return Ok(summary);
            }
            match result_rx.recv_timeout(POLL_INTERVAL) {
                Ok(message) => {
                    received += 1;
                    handle_message(message, cache, &mut summary, &mut on_event)?;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(stop);
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside of song processing");
            }
        }
        Ok(summary)
    }
}

fn worker_loop<C: Codec + ?Sized>(
    codec: &C,
    config: &NormalizerConfig,
    paths: &RunPaths,
    jobs: &Receiver<Job>,
    results: &Sender<WorkerMessage>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        let Ok(job) = jobs.recv() else {
            break;
        };
        tracing::info!(song = %job.song.path().display(), "processing");
        let message = process_guarded(codec, config, paths, job.song, job.stored.as_ref());
        if results.send(message).is_err() {
            break;
        }
    }
}

/// Processes one song, turning errors and panics into a [`WorkerFailure`].
fn process_guarded<C: Codec + ?Sized>(
    codec: &C,
    config: &NormalizerConfig,
    paths: &RunPaths,
    song: Song,
    stored: Option<&CacheData>,
) -> WorkerMessage {
    let key = song.key();
    let processor = SongProcessor::new(codec, config, paths);
    match panic::catch_unwind(AssertUnwindSafe(|| processor.process(song, stored))) {
        Ok(Ok(report)) => WorkerMessage::Finished(report),
        Ok(Err(err)) => WorkerMessage::Failed(WorkerFailure {
            song: key,
            cause: err.to_string(),
        }),
        Err(payload) => WorkerMessage::Failed(WorkerFailure {
            song: key,
            cause: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

fn handle_message<F>(
    message: WorkerMessage,
    cache: &mut CacheStore,
    summary: &mut RunSummary,
    on_event: &mut F,
) -> Result<()>
where
    F: FnMut(SongEvent<'_>, &RunSummary),
{
    match message {
        WorkerMessage::Finished(report) => {
            summary.record(report.outcome);
            if report.outcome.writes_cache() {
                cache.write(report.song.clone(), report.cache_data.clone())?;
            }
            on_event(SongEvent::Finished(&report), summary);
        }
        WorkerMessage::Failed(failure) => {
            tracing::error!(song = %failure.song, cause = %failure.cause, "song failed unexpectedly");
            summary.errors += 1;
            on_event(SongEvent::Failed(&failure), summary);
            summary.failures.push(failure);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        fs,
        path::{Path, PathBuf},
        time::{Duration, SystemTime},
    };

    use super::*;
    use crate::{
        codec::fake::{self, FakeCodec},
        library, StreamInfo,
    };
    use tempfile::TempDir;

    const NEAR_TARGET: i16 = 5194;

    struct Library {
        _dir: TempDir,
        paths: RunPaths,
        cache_path: PathBuf,
    }

    impl Library {
        /// Builds five songs: two quiet, one near target, one undecodable and
        /// one with a single broken stem.
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let paths = RunPaths::new(dir.path().join("Songs"), dir.path().join("Normalized"));
            let cache_path = dir.path().join("cache.json");
            let library = Self {
                _dir: dir,
                paths,
                cache_path,
            };
            library.song("A/Quiet", &[("song.ogg", 2, square(300, 64))]);
            library.song(
                "A/QuietMono",
                &[("song.ogg", 1, square(200, 32)), ("drums.mp3", 2, square(200, 64))],
            );
            library.song("B/AtTarget", &[("song.ogg", 2, square(NEAR_TARGET, 64))]);
            library.song("B/Unreadable", &[]);
            library.song(
                "C/OneBadStem",
                &[("song.ogg", 2, square(250, 64)), ("keys.ogg", 2, square(250, 64))],
            );
            // Undecodable for the fake codec: a bad channel byte.
            fs::write(library.paths.input_root.join("B/Unreadable/song.ogg"), [9, 0, 0]).unwrap();
            library
        }

        fn song(&self, relative: &str, stems: &[(&str, u8, Vec<i16>)]) {
            let dir = self.paths.input_root.join(relative);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("notes.mid"), b"MThd").unwrap();
            for (filename, channels, samples) in stems {
                fake::write_audio(&dir.join(filename), *channels, samples).unwrap();
            }
        }

        fn scheduler(&self, codec: Arc<FakeCodec>, workers: usize) -> Scheduler<FakeCodec> {
            Scheduler::new(codec, NormalizerConfig::default(), self.paths.clone()).with_workers(workers)
        }

        fn run(&self, scheduler: &Scheduler<FakeCodec>) -> (RunSummary, BTreeMap<String, ProcessingOutcome>) {
            let songs = library::discover(&self.paths.input_root).unwrap();
            let mut cache = CacheStore::load(&self.cache_path).unwrap();
            let mut outcomes = BTreeMap::new();
            let summary = scheduler
                .run(songs, &mut cache, |event, _| {
                    if let SongEvent::Finished(report) = event {
                        outcomes.insert(self.relative(&report.song), report.outcome);
                    }
                })
                .unwrap();
            (summary, outcomes)
        }

        fn relative(&self, key: &str) -> String {
            Path::new(key)
                .strip_prefix(&self.paths.input_root)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        }

        fn cached_files(&self) -> BTreeMap<String, Vec<String>> {
            CacheStore::load(&self.cache_path)
                .unwrap()
                .entries()
                .iter()
                .map(|(key, data)| (self.relative(key), data.keys().cloned().collect()))
                .collect()
        }

        fn output_snapshot(&self) -> Vec<(PathBuf, SystemTime)> {
            let mut files: Vec<_> = walkdir::WalkDir::new(&self.paths.output_root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| {
                    let modified = entry.metadata().unwrap().modified().unwrap();
                    (entry.path().to_path_buf(), modified)
                })
                .collect();
            files.sort();
            files
        }
    }

    fn square(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn codec() -> Arc<FakeCodec> {
        Arc::new(FakeCodec::new().failing_decode("keys.ogg"))
    }

    #[test]
    fn sequential_run_counts_every_outcome() {
        let library = Library::new();
        let scheduler = library.scheduler(codec(), 1);

        let (summary, outcomes) = library.run(&scheduler);

        assert_eq!(summary.songs, 5);
        assert_eq!(summary.exported, 3);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.processed(), 5);
        assert!(summary.failures.is_empty());
        assert_eq!(outcomes["B/Unreadable"], ProcessingOutcome::LoadError);
        assert_eq!(outcomes["B/AtTarget"], ProcessingOutcome::Copied);
        // Errors are not cached so they are retried next run.
        assert!(!library.cached_files().contains_key("B/Unreadable"));
        assert_eq!(library.cached_files()["C/OneBadStem"], ["song.ogg"]);
    }

    #[test]
    fn export_error_leaves_no_cache_entry() {
        let library = Library::new();
        let codec = Arc::new(FakeCodec::new().failing_encode("song.ogg"));
        let scheduler = library.scheduler(codec, 1);

        let (summary, outcomes) = library.run(&scheduler);

        // A/Quiet has no stem other than song.ogg, so nothing gets exported.
        assert_eq!(outcomes["A/Quiet"], ProcessingOutcome::ExportError);
        assert_eq!(outcomes["A/QuietMono"], ProcessingOutcome::Exported);
        assert_eq!(summary.errors, 2);
        let cached = library.cached_files();
        assert!(!cached.contains_key("A/Quiet"));
        assert_eq!(cached["A/QuietMono"], ["drums.mp3"]);
        assert!(!library.paths.output_root.join("A/Quiet").exists());
    }

    #[test]
    fn second_run_is_fully_cached_and_writes_nothing() {
        let library = Library::new();
        let codec = codec();
        let scheduler = library.scheduler(Arc::clone(&codec), 1);
        library.run(&scheduler);
        let snapshot = library.output_snapshot();
        let encodes = codec.encode_count();

        // Songs with unreadable stems stay stale; the rest is cached.
        let (summary, outcomes) = library.run(&scheduler);

        assert_eq!(summary.cached, 3);
        assert_eq!(summary.errors, 1);
        assert_eq!(outcomes["C/OneBadStem"], ProcessingOutcome::Exported);
        assert_eq!(outcomes["A/Quiet"], ProcessingOutcome::Cached);
        assert_eq!(codec.encode_count() - encodes, 1);
        let unchanged: Vec<_> = library
            .output_snapshot()
            .into_iter()
            .filter(|(path, _)| !path.starts_with(library.paths.output_root.join("C")))
            .collect();
        let before: Vec<_> = snapshot
            .into_iter()
            .filter(|(path, _)| !path.starts_with(library.paths.output_root.join("C")))
            .collect();
        assert_eq!(unchanged, before);
    }

    #[test]
    fn touching_one_stem_reprocesses_only_that_song() {
        let library = Library::new();
        let codec = Arc::new(FakeCodec::new());
        let scheduler = library.scheduler(Arc::clone(&codec), 1);
        library.run(&scheduler);

        let touched = library.paths.input_root.join("A/QuietMono/drums.mp3");
        fs::File::options()
            .write(true)
            .open(&touched)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(3600))
            .unwrap();

        let (_, outcomes) = library.run(&scheduler);

        assert_eq!(outcomes["A/QuietMono"], ProcessingOutcome::Exported);
        assert_eq!(outcomes["A/Quiet"], ProcessingOutcome::Cached);
        assert_eq!(outcomes["B/AtTarget"], ProcessingOutcome::Cached);
        assert_eq!(outcomes["C/OneBadStem"], ProcessingOutcome::Cached);
    }

    #[test]
    fn interrupt_keeps_exactly_the_completed_songs() {
        let library = Library::new();
        let scheduler = library.scheduler(codec(), 1);
        let flag = scheduler.interrupt_flag();
        let songs = library::discover(&library.paths.input_root).unwrap();
        let mut cache = CacheStore::load(&library.cache_path).unwrap();
        let mut finished = 0;

        let summary = scheduler
            .run(songs, &mut cache, |_, _| {
                finished += 1;
                if finished == 2 {
                    flag.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.processed(), 2);
        // The first two songs in path order both export.
        assert_eq!(
            library.cached_files().keys().cloned().collect::<Vec<_>>(),
            ["A/Quiet", "A/QuietMono"]
        );
    }

    #[test]
    fn pooled_run_matches_sequential_run() {
        let sequential = Library::new();
        let pooled = Library::new();

        let (seq_summary, seq_outcomes) = sequential.run(&sequential.scheduler(codec(), 1));
        let (pool_summary, pool_outcomes) = pooled.run(&pooled.scheduler(codec(), 4));

        assert_eq!(seq_summary, pool_summary);
        assert_eq!(seq_outcomes, pool_outcomes);
        assert_eq!(sequential.cached_files(), pooled.cached_files());
    }

    #[test]
    fn pooled_run_skips_cached_songs_before_dispatch() {
        let library = Library::new();
        let codec = codec();
        let scheduler = library.scheduler(Arc::clone(&codec), 3);
        library.run(&scheduler);
        let decodes = codec.decode_count();

        let (summary, _) = library.run(&scheduler);

        assert_eq!(summary.cached, 3);
        // Only the song with a broken stem was decoded again.
        assert_eq!(codec.decode_count() - decodes, 2);
    }

    #[test]
    fn interrupt_before_dispatch_processes_nothing() {
        let library = Library::new();
        let scheduler = library.scheduler(codec(), 4);
        scheduler.interrupt_flag().store(true, Ordering::SeqCst);

        let (summary, outcomes) = library.run(&scheduler);

        assert!(summary.interrupted);
        assert!(outcomes.is_empty());
        assert!(library.cached_files().is_empty());
    }

    struct PanicOn {
        filename: &'static str,
        inner: FakeCodec,
    }

    impl Codec for PanicOn {
        fn probe(&self, path: &Path) -> crate::Result<StreamInfo> {
            self.inner.probe(path)
        }

        fn decode(&self, path: &Path, info: &StreamInfo) -> crate::Result<Vec<i16>> {
            if path.ends_with(self.filename) {
                panic!("decoder crashed on {}", path.display());
            }
            self.inner.decode(path, info)
        }

        fn encode(&self, samples: &[i16], info: &StreamInfo, gain_db: f64, dest: &Path) -> crate::Result<()> {
            self.inner.encode(samples, info, gain_db, dest)
        }
    }

    #[test]
    fn worker_panic_is_reported_after_draining() {
        let library = Library::new();
        let codec = Arc::new(PanicOn {
            filename: "drums.mp3",
            inner: FakeCodec::new(),
        });
        let scheduler = Scheduler::new(codec, NormalizerConfig::default(), library.paths.clone())
            .with_workers(2);
        let songs = library::discover(&library.paths.input_root).unwrap();
        let mut cache = CacheStore::load(&library.cache_path).unwrap();

        let summary = scheduler.run(songs, &mut cache, |_, _| {}).unwrap();

        assert_eq!(summary.processed(), 5);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.failures[0].song.ends_with("QuietMono"));
        assert!(summary.failures[0].cause.contains("decoder crashed"));
        assert_eq!(cache.len(), 3);
        let err = summary.into_result().unwrap_err();
        assert!(matches!(err, NormalizerError::Worker { .. }));
    }
}
