use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    thread,
};

use serde::Deserialize;

use super::{
    samples_from_le_bytes, samples_to_le_bytes, Codec, StreamInfo, DEFAULT_BIT_RATE,
    DEFAULT_SAMPLE_RATE, SAMPLE_BITS,
};
use crate::{NormalizerError, Result};

/// [`Codec`] backed by the `ffprobe` and `ffmpeg` executables.
#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    load_debug: bool,
    export_debug: bool,
}

impl Default for FfmpegCodec {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl FfmpegCodec {
    /// Creates a codec that runs the given executables.
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            load_debug: false,
            export_debug: false,
        }
    }

    /// Lets FFmpeg print its own diagnostics while decoding and/or encoding.
    pub fn with_debug(mut self, load_debug: bool, export_debug: bool) -> Self {
        self.load_debug = load_debug;
        self.export_debug = export_debug;
        self
    }

    fn pcm_format() -> String {
        format!("s{SAMPLE_BITS}le")
    }
}

impl Codec for FfmpegCodec {
    fn probe(&self, path: &Path) -> Result<StreamInfo> {
        let output = background_command(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| NormalizerError::codec(path, format!("unable to run ffprobe: {err}")))?;

        check_status(path, "ffprobe", &output)?;
        parse_probe(&output.stdout).map_err(|message| NormalizerError::codec(path, message))
    }

    fn decode(&self, path: &Path, _info: &StreamInfo) -> Result<Vec<i16>> {
        tracing::debug!(path = %path.display(), "decoding with ffmpeg");
        let output = background_command(&self.ffmpeg)
            .args(["-y", "-loglevel", "error", "-stats", "-i"])
            .arg(path)
            .args(["-f", Self::pcm_format().as_str(), "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr_mode(self.load_debug))
            .output()
            .map_err(|err| NormalizerError::codec(path, format!("unable to run ffmpeg: {err}")))?;

        check_status(path, "ffmpeg", &output)?;
        Ok(samples_from_le_bytes(&output.stdout))
    }

    fn encode(&self, samples: &[i16], info: &StreamInfo, gain_db: f64, dest: &Path) -> Result<()> {
        if !gain_db.is_finite() {
            return Err(NormalizerError::codec(
                dest,
                format!("refusing to apply non-finite gain {gain_db}"),
            ));
        }

        let pcm = Self::pcm_format();
        let channels = info.channels.to_string();
        let rate = info.sample_rate.to_string();
        let bit_rate = info.bit_rate.to_string();
        let filter = format!("volume={gain_db}dB");
        let mut command = background_command(&self.ffmpeg);
        command
            .args(["-y", "-loglevel", "error", "-stats"])
            .args(["-f", pcm.as_str(), "-ac", channels.as_str(), "-ar", rate.as_str()])
            .args(["-i", "pipe:0"])
            .args(["-ar", rate.as_str(), "-b:a", bit_rate.as_str()])
            .args(["-filter:a", filter.as_str()]);
        // Multi-format names such as "mov,mp4,m4a" cannot be forced; the
        // destination extension decides instead.
        if !info.format_name.is_empty() && !info.format_name.contains(',') {
            command.args(["-f", info.format_name.as_str()]);
        }
        command
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(stderr_mode(self.export_debug));
        tracing::debug!(dest = %dest.display(), gain_db, "encoding with ffmpeg");

        let mut child = command
            .spawn()
            .map_err(|err| NormalizerError::codec(dest, format!("unable to run ffmpeg: {err}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| NormalizerError::codec(dest, "ffmpeg stdin unavailable"))?;
        let bytes = samples_to_le_bytes(samples);

        // Feed stdin from a helper so a chatty stderr cannot stall the pipe.
        let (output, written) = thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(&bytes));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (output, written)
        });

        let output = output
            .map_err(|err| NormalizerError::codec(dest, format!("ffmpeg did not finish: {err}")))?;
        check_status(dest, "ffmpeg", &output)?;
        written.map_err(|err| NormalizerError::codec(dest, format!("short write to ffmpeg: {err}")))
    }
}

/// Builds a command whose child runs in its own process group, so a Ctrl+C
/// at the terminal reaches only this process and the song in flight can
/// finish.
fn background_command(program: &Path) -> Command {
    let mut command = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

fn stderr_mode(debug: bool) -> Stdio {
    if debug {
        Stdio::inherit()
    } else {
        Stdio::piped()
    }
}

fn check_status(path: &Path, tool: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(NormalizerError::codec(
        path,
        format!("{tool} exited with {}: {}", output.status, stderr.trim()),
    ))
}

#[derive(Debug, Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    sample_rate: Option<String>,
    channels: Option<u16>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    bit_rate: Option<String>,
}

/// Builds a [`StreamInfo`] from `ffprobe -print_format json` output.
fn parse_probe(json: &[u8]) -> std::result::Result<StreamInfo, String> {
    let document: ProbeDocument =
        serde_json::from_slice(json).map_err(|err| format!("unreadable ffprobe output: {err}"))?;
    let stream = document
        .streams
        .first()
        .ok_or_else(|| "no audio stream found".to_string())?;
    let format = document.format.as_ref();

    let sample_rate = stream
        .sample_rate
        .as_deref()
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let bit_rate = stream
        .bit_rate
        .as_deref()
        .or_else(|| format.and_then(|f| f.bit_rate.as_deref()))
        .and_then(|rate| rate.parse().ok())
        .unwrap_or(DEFAULT_BIT_RATE);
    let format_name = format
        .and_then(|f| f.format_name.clone())
        .unwrap_or_default();

    Ok(StreamInfo {
        sample_rate,
        channels: stream.channels.unwrap_or(2),
        bit_rate,
        format_name,
    })
}
