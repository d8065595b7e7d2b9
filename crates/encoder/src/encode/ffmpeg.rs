//! FFmpeg transcoder invoker.
//!
//! Builds and runs the external ffmpeg command that converts one chapter's
//! upload into the streaming-optimized output format, under a hard timeout.
//! On success the output file is re-probed for its actual audio properties;
//! a probe failure falls back to config-derived values rather than failing
//! the encode.

use crate::probe::{probe_audio, AudioMetadata};
use audiobook_encoder_config::{EncodingParams, EnvironmentConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Bitrate above which an input is re-encoded for bandwidth optimization.
const QUALITY_BITRATE_THRESHOLD_KBPS: u32 = 128;

/// Format names indicating lossless/uncompressed input that always needs
/// encoding. Matched as substrings so ffprobe codec names like "pcm_s16le"
/// are covered.
const LOSSLESS_FORMAT_KEYWORDS: &[&str] = &["wav", "wave", "pcm"];

/// Error type for encoding operations.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Input file does not exist.
    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),

    /// The transcoder exceeded the configured hard timeout.
    #[error("Encoding timeout (exceeded {0} seconds)")]
    Timeout(u64),

    /// ffmpeg exited with a non-zero status.
    #[error("ffmpeg failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// ffmpeg was terminated by a signal.
    #[error("ffmpeg process was terminated by signal")]
    Terminated,

    /// ffmpeg reported success but produced no output file.
    #[error("Encoding completed but output file not found")]
    OutputMissing,

    /// IO error while spawning or reading the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful transcoder invocation.
#[derive(Debug, Clone)]
pub struct EncodingOutcome {
    pub output_path: PathBuf,
    /// Audio properties of the produced file.
    pub metadata: AudioMetadata,
    pub original_size: u64,
    pub encoded_size: u64,
    pub elapsed: Duration,
}

/// FFmpeg-backed transcoder configured from the environment profile.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    params: EncodingParams,
    timeout: Duration,
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegEncoder {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            params: config.encoding.clone(),
            timeout: Duration::from_secs(config.encoding_timeout_secs),
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
        }
    }

    /// Build the ffmpeg command for one input/output pair.
    ///
    /// The argument layout is fully determined by the encoding parameters:
    /// `-y -i <input> -ac <channels> -ar <rate> -c:a <codec> -b:a <bitrate>
    /// <extra args> <output>`.
    pub fn build_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);

        cmd.arg("-y");
        cmd.arg("-i").arg(input);
        cmd.arg("-ac").arg(self.params.channels.to_string());
        cmd.arg("-ar").arg(self.params.sample_rate.to_string());
        cmd.arg("-c:a").arg(&self.params.codec);
        cmd.arg("-b:a").arg(&self.params.bitrate);

        for extra in &self.params.extra_args {
            cmd.arg(extra);
        }

        cmd.arg(output);
        cmd
    }

    /// Run the transcoder against one input file.
    ///
    /// Blocks the calling task for the duration of the external process,
    /// bounded by the configured timeout. A timeout kills the process and
    /// is reported as a distinguishable error so the retry manager treats
    /// it as temporary.
    pub async fn encode(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<EncodingOutcome, EncodeError> {
        let start = Instant::now();

        if !input.exists() {
            return Err(EncodeError::InputMissing(input.to_path_buf()));
        }
        let original_size = std::fs::metadata(input)?.len();

        let mut cmd = self.build_command(input, output);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(input = %input.display(), output = %output.display(), "running ffmpeg");

        let mut child = cmd.spawn()?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(EncodeError::Timeout(self.timeout.as_secs()));
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return match status.code() {
                Some(code) => Err(EncodeError::Failed {
                    code,
                    stderr: last_stderr_line(&stderr_text),
                }),
                None => Err(EncodeError::Terminated),
            };
        }

        if !output.exists() {
            return Err(EncodeError::OutputMissing);
        }
        let encoded_size = std::fs::metadata(output)?.len();

        // Re-derive audio properties from the produced file; on probe
        // failure fall back to what the config asked for.
        let metadata = match probe_audio(&self.ffprobe_path, output).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(output = %output.display(), error = %e, "output probe failed, using config defaults");
                metadata_from_params(&self.params)
            }
        };

        Ok(EncodingOutcome {
            output_path: output.to_path_buf(),
            metadata,
            original_size,
            encoded_size,
            elapsed: start.elapsed(),
        })
    }

    /// Decide whether a file needs encoding at all.
    ///
    /// Metadata-probe failure defaults to encoding rather than silently
    /// skipping a possibly-unoptimized file.
    pub async fn should_encode(&self, input: &Path, force: bool) -> (bool, String) {
        if force {
            return (true, "Forced encoding requested".to_string());
        }

        match probe_audio(&self.ffprobe_path, input).await {
            Ok(metadata) => encode_decision(&metadata),
            Err(e) => (
                true,
                format!("Metadata probe failed - encoding for safety: {}", e),
            ),
        }
    }
}

/// Pure encode-or-skip decision over probed input metadata.
pub fn encode_decision(metadata: &AudioMetadata) -> (bool, String) {
    let format = metadata
        .format
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if LOSSLESS_FORMAT_KEYWORDS.iter().any(|kw| format.contains(kw)) {
        return (true, format!("Lossless format ({}) requires encoding", format));
    }

    let bitrate = metadata.bitrate_kbps.unwrap_or(0);
    if bitrate > QUALITY_BITRATE_THRESHOLD_KBPS {
        return (
            true,
            format!("High bitrate ({}kbps) - encoding for optimization", bitrate),
        );
    }

    let channels = metadata.channels.unwrap_or(1);
    if channels > 1 {
        return (
            true,
            format!("Multi-channel ({}ch) - encoding to mono", channels),
        );
    }

    (
        false,
        format!("Already optimized ({}kbps, {}ch)", bitrate, channels),
    )
}

/// Config-derived metadata used when the output probe fails.
fn metadata_from_params(params: &EncodingParams) -> AudioMetadata {
    AudioMetadata {
        duration_secs: 0,
        bitrate_kbps: Some(params.bitrate_kbps()),
        sample_rate: Some(params.sample_rate),
        channels: Some(params.channels),
        format: Some(params.output_format.clone()),
    }
}

/// Keep error text manageable: ffmpeg's stderr ends with the actual error.
fn last_stderr_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .to_string()
}
