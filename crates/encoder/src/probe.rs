//! Audio metadata probing via ffprobe.
//!
//! Runs `ffprobe -v quiet -print_format json -show_format -show_streams`
//! and normalizes the output into an [`AudioMetadata`]. Stream-level values
//! are preferred; the format section fills in whatever the stream omitted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalized audio properties of one media file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioMetadata {
    /// Duration in whole seconds.
    pub duration_secs: u64,
    /// Bitrate in kbps.
    pub bitrate_kbps: Option<u32>,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Channel count.
    pub channels: Option<u32>,
    /// Codec or container format name (e.g., "aac", "wav").
    pub format: Option<String>,
}

impl AudioMetadata {
    /// Convert to the free-form key/value map stored on completed jobs.
    pub fn to_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("duration".to_string(), Value::from(self.duration_secs));
        map.insert(
            "bitrate".to_string(),
            self.bitrate_kbps.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(
            "sample_rate".to_string(),
            self.sample_rate.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(
            "channels".to_string(),
            self.channels.map(Value::from).unwrap_or(Value::Null),
        );
        map.insert(
            "format".to_string(),
            self.format
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Null),
        );
        map
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub sample_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub format_name: Option<String>,
    }
}

/// Probe a media file with ffprobe and normalize its audio metadata.
pub async fn probe_audio(ffprobe_path: &str, path: &Path) -> Result<AudioMetadata, ProbeError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
}

/// Parse ffprobe JSON output into normalized audio metadata.
pub fn parse_probe_output(json_str: &str) -> Result<AudioMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let audio_stream = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let mut metadata = AudioMetadata::default();

    if let Some(stream) = audio_stream {
        metadata.duration_secs = stream
            .duration
            .as_ref()
            .and_then(|d| d.parse::<f64>().ok())
            .map(|d| d as u64)
            .unwrap_or(0);
        metadata.bitrate_kbps = stream
            .bit_rate
            .as_ref()
            .and_then(|br| br.parse::<u64>().ok())
            .map(|bps| (bps / 1000) as u32);
        metadata.sample_rate = stream
            .sample_rate
            .as_ref()
            .and_then(|sr| sr.parse::<u32>().ok());
        metadata.channels = stream.channels;
        metadata.format = stream.codec_name.clone();
    }

    // Fall back to the format section for anything the stream lacked
    if let Some(format) = ffprobe.format {
        if metadata.duration_secs == 0 {
            metadata.duration_secs = format
                .duration
                .as_ref()
                .and_then(|d| d.parse::<f64>().ok())
                .map(|d| d as u64)
                .unwrap_or(0);
        }
        if metadata.bitrate_kbps.is_none() {
            metadata.bitrate_kbps = format
                .bit_rate
                .as_ref()
                .and_then(|br| br.parse::<u64>().ok())
                .map(|bps| (bps / 1000) as u32);
        }
        if metadata.format.is_none() {
            metadata.format = format.format_name;
        }
    }

    Ok(metadata)
}
