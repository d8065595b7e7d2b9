//! Preflight checks run before the pipeline starts.
//!
//! Verifies that the configured ffmpeg and ffprobe binaries exist and
//! respond to `-version`, so a misconfigured deployment fails at startup
//! instead of on the first job.

use audiobook_encoder_config::EnvironmentConfig;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),
}

/// Check that the ffmpeg binary runs and reports a version.
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<(), StartupError> {
    run_version_check(ffmpeg_path).map_err(StartupError::FfmpegUnavailable)
}

/// Check that the ffprobe binary runs and reports a version.
pub fn check_ffprobe_available(ffprobe_path: &str) -> Result<(), StartupError> {
    run_version_check(ffprobe_path).map_err(StartupError::FfprobeUnavailable)
}

/// Run all startup checks for the resolved configuration.
pub fn run_startup_checks(config: &EnvironmentConfig) -> Result<(), StartupError> {
    check_ffmpeg_available(&config.ffmpeg_path)?;
    check_ffprobe_available(&config.ffprobe_path)?;
    Ok(())
}

fn run_version_check(program: &str) -> Result<(), String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| format!("{}: {}", program, e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} -version exited with status {}",
            program, output.status
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_reported() {
        let result = check_ffmpeg_available("/nonexistent/ffmpeg-binary");
        match result {
            Err(StartupError::FfmpegUnavailable(msg)) => {
                assert!(msg.contains("/nonexistent/ffmpeg-binary"));
            }
            other => panic!("expected FfmpegUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_probe_and_encoder_checked_independently() {
        let result = check_ffprobe_available("/nonexistent/ffprobe-binary");
        assert!(matches!(result, Err(StartupError::FfprobeUnavailable(_))));
    }
}
