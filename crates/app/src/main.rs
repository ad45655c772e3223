use std::{
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use stem_normalizer_core::{
    config::{CACHE_FILENAME, CONFIG_FILENAME, INPUT_FOLDER, OUTPUT_FOLDER},
    library, CacheStore, FfmpegCodec, NormalizerConfig, RunPaths, RunSummary, Scheduler, SongEvent,
};
use tracing_subscriber::EnvFilter;

const CRASH_LOG: &str = "crash_log.txt";

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let started = Instant::now();

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("failed to install the Ctrl+C handler")?;

    let mut progress = RunSummary::default();
    let outcome = run(&cli, interrupt, &mut progress);

    let summary = match &outcome {
        Ok(summary) => summary,
        Err(_) => &progress,
    };
    match &outcome {
        Ok(summary) if summary.interrupted => println!("\nInterrupted.\n"),
        Ok(summary) if summary.failures.is_empty() => println!("Done!\n"),
        _ => println!("\n!!! CRASH !!!\nSee {CRASH_LOG} for info.\n"),
    }
    print_summary(summary, started.elapsed());

    let outcome = outcome.and_then(|summary| summary.into_result().map_err(anyhow::Error::from));
    if let Err(err) = &outcome {
        write_crash_log(err);
    }

    if !cli.no_pause {
        pause();
    }
    outcome.map(drop)
}

fn run(cli: &Cli, interrupt: Arc<AtomicBool>, progress: &mut RunSummary) -> anyhow::Result<RunSummary> {
    let config = NormalizerConfig::load_or_create(&cli.config)
        .with_context(|| format!("unable to load config {}", cli.config.display()))?;
    let mut cache = CacheStore::load(&cli.cache)
        .with_context(|| format!("unable to load cache {}", cli.cache.display()))?;

    println!("Finding songs...");
    let songs = library::discover(&cli.input)?;
    println!("Found {} songs.\n", songs.len());
    progress.songs = songs.len();

    let codec = FfmpegCodec::new(&cli.ffmpeg, &cli.ffprobe)
        .with_debug(config.load_debug, config.export_debug);
    let multithreading = config.multithreading;
    let mut scheduler = Scheduler::new(
        Arc::new(codec),
        config,
        RunPaths::new(&cli.input, &cli.output),
    )
    .with_interrupt(interrupt);
    if let Some(jobs) = cli.jobs.filter(|_| multithreading) {
        scheduler = scheduler.with_workers(jobs);
    }
    if scheduler.workers() > 1 {
        println!("Multithreading enabled.");
        println!("Running {} workers.\n", scheduler.workers());
    }

    let bar = ProgressBar::new(songs.len() as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("##-"),
    );

    let summary = scheduler.run(songs, &mut cache, |event, summary| {
        if let SongEvent::Finished(report) = event {
            bar.set_message(song_name(&report.song));
        }
        bar.inc(1);
        *progress = summary.clone();
    })?;

    bar.finish_and_clear();
    Ok(summary)
}

fn song_name(key: &str) -> String {
    Path::new(key)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| key.to_string())
}

fn print_summary(summary: &RunSummary, elapsed: Duration) {
    println!("  Exported: {:>5}", summary.exported);
    println!("  Copied:   {:>5}", summary.copied);
    println!("  Cached:   {:>5}", summary.cached);
    println!("  Errors:   {:>5}", summary.errors);
    println!("\nTime used: {}", format_elapsed(elapsed));
}

/// Formats a duration as `H:MM:SS`, dropping fractions of a second.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}

fn write_crash_log(err: &anyhow::Error) {
    tracing::error!("{err:#}");
    let report = format!("Something bad happened.\n\n{err:?}\n");
    if let Err(write_err) = fs::write(CRASH_LOG, report) {
        tracing::error!(%write_err, "unable to write {CRASH_LOG}");
    }
}

fn pause() {
    println!("\nPress enter to exit");
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Normalize the loudness of multi-stem songs", long_about = None)]
struct Cli {
    /// Folder scanned for song folders.
    #[arg(long, default_value = INPUT_FOLDER)]
    input: PathBuf,
    /// Folder normalized songs are written to.
    #[arg(long, default_value = OUTPUT_FOLDER)]
    output: PathBuf,
    /// Configuration file, created with defaults when missing.
    #[arg(long, default_value = CONFIG_FILENAME)]
    config: PathBuf,
    /// Cache file recording what has already been processed.
    #[arg(long, default_value = CACHE_FILENAME)]
    cache: PathBuf,
    /// Number of worker threads. Defaults to one per logical CPU.
    #[arg(short, long)]
    jobs: Option<usize>,
    /// FFmpeg executable.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
    /// FFprobe executable.
    #[arg(long, default_value = "ffprobe")]
    ffprobe: PathBuf,
    /// Exit without waiting for enter.
    #[arg(long)]
    no_pause: bool,
}
