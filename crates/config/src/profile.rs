//! Environment profile resolution and override loading
//!
//! Each deployment profile (local, staging, production) fixes the full set
//! of encoding tunables as pure data. A profile can then be adjusted by an
//! optional TOML overrides file and by environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading an overrides file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Profile name not recognized
    UnknownProfile(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::UnknownProfile(name) => write!(f, "Unknown profile: {}", name),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Deployment profile selecting a fixed set of encoding tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Local,
    Staging,
    Production,
}

impl Default for Profile {
    fn default() -> Self {
        Self::Local
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Profile::Local => write!(f, "local"),
            Profile::Staging => write!(f, "staging"),
            Profile::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Profile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Profile::Local),
            "staging" => Ok(Profile::Staging),
            "production" => Ok(Profile::Production),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }
}

/// Parameters handed to the external transcoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingParams {
    /// Container/extension of encoded output (e.g., "m4a").
    pub output_format: String,
    /// Audio codec name passed to the transcoder.
    pub codec: String,
    /// Target bitrate string (e.g., "56k").
    pub bitrate: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u32,
    /// Extra transcoder flags appended after the core arguments.
    pub extra_args: Vec<String>,
}

impl EncodingParams {
    /// Numeric bitrate in kbps parsed from the bitrate string ("56k" -> 56).
    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate
            .trim_end_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .unwrap_or(0)
    }
}

/// Retry policy for failed encoding jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum automatic retries per job.
    pub max_retries: u32,
    /// Base delay before the first retry, in seconds.
    pub base_delay_secs: f64,
    /// Ceiling on the computed backoff delay, in seconds.
    pub max_delay_secs: f64,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Recent failures per chapter that trip the retry circuit breaker.
    pub failure_threshold: usize,
}

/// Full set of tunables resolved from one deployment profile.
///
/// Every component reads its configuration from this value at construction
/// time; switching profiles means re-constructing the components with a
/// freshly resolved config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub profile: Profile,
    pub encoding: EncodingParams,
    pub retry: RetryPolicy,
    /// Fixed worker pool size for the job queue.
    pub max_workers: u32,
    /// Bound on queued-but-undispatched jobs.
    pub max_queue_size: usize,
    /// Age threshold for the temp-file sweep.
    pub cleanup_temp_max_age_hours: u64,
    /// Move original files to the archive directory after a durable encode.
    pub archive_originals: bool,
    /// Hard timeout for one transcoder invocation.
    pub encoding_timeout_secs: u64,
    /// Verbose logging default for this profile.
    pub detailed_logging: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl EnvironmentConfig {
    /// Resolve the pure-data config for a profile.
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Local => Self::local(),
            Profile::Staging => Self::staging(),
            Profile::Production => Self::production(),
        }
    }

    /// Resolve a profile, then apply TOML file overrides (if a path is
    /// given) and environment variable overrides, in that order.
    pub fn resolve(profile: Profile, overrides_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::for_profile(profile);

        if let Some(path) = overrides_path {
            let overrides = Overrides::load_from_file(path)?;
            overrides.apply(&mut config);
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn local() -> Self {
        Self {
            profile: Profile::Local,
            encoding: EncodingParams {
                output_format: "m4a".to_string(),
                codec: "aac".to_string(),
                bitrate: "64k".to_string(),
                sample_rate: 44100,
                channels: 1,
                extra_args: vec!["-movflags".to_string(), "+faststart".to_string()],
            },
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_secs: 1.0,
                max_delay_secs: 30.0,
                backoff_multiplier: 2.0,
                failure_threshold: 5,
            },
            max_workers: 2,
            max_queue_size: 10,
            cleanup_temp_max_age_hours: 1,
            archive_originals: false,
            encoding_timeout_secs: 300,
            detailed_logging: true,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }

    fn production() -> Self {
        Self {
            profile: Profile::Production,
            encoding: EncodingParams {
                output_format: "m4a".to_string(),
                codec: "aac".to_string(),
                bitrate: "56k".to_string(),
                sample_rate: 44100,
                channels: 1,
                extra_args: vec![
                    "-movflags".to_string(),
                    "+faststart".to_string(),
                    "-profile:a".to_string(),
                    "aac_low".to_string(),
                ],
            },
            retry: RetryPolicy {
                max_retries: 5,
                base_delay_secs: 2.0,
                max_delay_secs: 300.0,
                backoff_multiplier: 2.0,
                failure_threshold: 5,
            },
            max_workers: 4,
            max_queue_size: 100,
            cleanup_temp_max_age_hours: 24,
            archive_originals: true,
            encoding_timeout_secs: 1800,
            detailed_logging: false,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }

    fn staging() -> Self {
        // Production settings with shorter timeouts and verbose logging.
        let mut config = Self::production();
        config.profile = Profile::Staging;
        config.retry.max_retries = 3;
        config.encoding_timeout_secs = 900;
        config.detailed_logging = true;
        config
    }

    /// Apply environment variable overrides to this configuration.
    ///
    /// Overrides the following values if environment variables are set:
    /// - ENCODER_MAX_WORKERS -> max_workers (0 derives from CPU cores)
    /// - ENCODER_MAX_RETRIES -> retry.max_retries
    /// - ENCODER_BITRATE -> encoding.bitrate
    /// - ENCODER_TIMEOUT_SECS -> encoding_timeout_secs
    /// - ENCODER_FFMPEG_PATH -> ffmpeg_path
    /// - ENCODER_FFPROBE_PATH -> ffprobe_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ENCODER_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.set_max_workers(workers);
            }
        }

        if let Ok(val) = env::var("ENCODER_MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.retry.max_retries = retries;
            }
        }

        if let Ok(val) = env::var("ENCODER_BITRATE") {
            if !val.is_empty() {
                self.encoding.bitrate = val;
            }
        }

        if let Ok(val) = env::var("ENCODER_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encoding_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("ENCODER_FFMPEG_PATH") {
            if !val.is_empty() {
                self.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("ENCODER_FFPROBE_PATH") {
            if !val.is_empty() {
                self.ffprobe_path = val;
            }
        }
    }

    /// Set the worker count, deriving it from CPU cores when zero.
    fn set_max_workers(&mut self, workers: u32) {
        self.max_workers = if workers > 0 {
            workers
        } else {
            derive_workers(num_cpus::get() as u32)
        };
    }
}

/// Derive a worker pool size from the logical core count.
///
/// 4 workers for 8+ cores, 2 otherwise. Transcoding is process-bound, so
/// the pool stays well below the core count.
pub fn derive_workers(cores: u32) -> u32 {
    if cores >= 8 {
        4
    } else {
        2
    }
}

/// Optional overrides loaded from a TOML file.
///
/// All sections and fields are optional; anything absent leaves the profile
/// value in place.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Overrides {
    #[serde(default)]
    pub queue: QueueOverrides,
    #[serde(default)]
    pub retry: RetryOverrides,
    #[serde(default)]
    pub encoding: EncodingOverrides,
    #[serde(default)]
    pub paths: PathOverrides,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct QueueOverrides {
    /// Worker pool size (0 = derive from CPU cores).
    pub max_workers: Option<u32>,
    pub max_queue_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EncodingOverrides {
    pub bitrate: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PathOverrides {
    pub ffmpeg: Option<String>,
    pub ffprobe: Option<String>,
}

impl Overrides {
    /// Load overrides from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse overrides from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let overrides: Overrides = toml::from_str(content)?;
        Ok(overrides)
    }

    /// Apply the present fields onto a resolved configuration.
    pub fn apply(&self, config: &mut EnvironmentConfig) {
        if let Some(workers) = self.queue.max_workers {
            config.set_max_workers(workers);
        }
        if let Some(size) = self.queue.max_queue_size {
            config.max_queue_size = size;
        }

        if let Some(retries) = self.retry.max_retries {
            config.retry.max_retries = retries;
        }
        if let Some(base) = self.retry.base_delay_secs {
            config.retry.base_delay_secs = base;
        }
        if let Some(max) = self.retry.max_delay_secs {
            config.retry.max_delay_secs = max;
        }

        if let Some(ref bitrate) = self.encoding.bitrate {
            config.encoding.bitrate = bitrate.clone();
        }
        if let Some(secs) = self.encoding.timeout_secs {
            config.encoding_timeout_secs = secs;
        }

        if let Some(ref ffmpeg) = self.paths.ffmpeg {
            config.ffmpeg_path = ffmpeg.clone();
        }
        if let Some(ref ffprobe) = self.paths.ffprobe {
            config.ffprobe_path = ffprobe.clone();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all encoder-related env vars
    fn clear_env_vars() {
        env::remove_var("ENCODER_MAX_WORKERS");
        env::remove_var("ENCODER_MAX_RETRIES");
        env::remove_var("ENCODER_BITRATE");
        env::remove_var("ENCODER_TIMEOUT_SECS");
        env::remove_var("ENCODER_FFMPEG_PATH");
        env::remove_var("ENCODER_FFPROBE_PATH");
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("local".parse::<Profile>().unwrap(), Profile::Local);
        assert_eq!("STAGING".parse::<Profile>().unwrap(), Profile::Staging);
        assert_eq!("Production".parse::<Profile>().unwrap(), Profile::Production);
        assert!("dev".parse::<Profile>().is_err());
    }

    #[test]
    fn test_profile_display_round_trip() {
        for profile in [Profile::Local, Profile::Staging, Profile::Production] {
            let name = profile.to_string();
            assert_eq!(name.parse::<Profile>().unwrap(), profile);
        }
    }

    #[test]
    fn test_local_profile_values() {
        let config = EnvironmentConfig::for_profile(Profile::Local);

        assert_eq!(config.profile, Profile::Local);
        assert_eq!(config.encoding.bitrate, "64k");
        assert_eq!(config.encoding.codec, "aac");
        assert_eq!(config.encoding.channels, 1);
        assert_eq!(config.encoding.sample_rate, 44100);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.retry.max_retries, 2);
        assert!((config.retry.base_delay_secs - 1.0).abs() < f64::EPSILON);
        assert!((config.retry.max_delay_secs - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.cleanup_temp_max_age_hours, 1);
        assert!(!config.archive_originals);
        assert_eq!(config.encoding_timeout_secs, 300);
        assert!(config.detailed_logging);
    }

    #[test]
    fn test_production_profile_values() {
        let config = EnvironmentConfig::for_profile(Profile::Production);

        assert_eq!(config.encoding.bitrate, "56k");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.retry.max_retries, 5);
        assert!((config.retry.base_delay_secs - 2.0).abs() < f64::EPSILON);
        assert!((config.retry.max_delay_secs - 300.0).abs() < f64::EPSILON);
        assert_eq!(config.cleanup_temp_max_age_hours, 24);
        assert!(config.archive_originals);
        assert_eq!(config.encoding_timeout_secs, 1800);
        assert!(!config.detailed_logging);
        assert!(config
            .encoding
            .extra_args
            .contains(&"aac_low".to_string()));
    }

    #[test]
    fn test_staging_profile_derives_from_production() {
        let staging = EnvironmentConfig::for_profile(Profile::Staging);
        let production = EnvironmentConfig::for_profile(Profile::Production);

        assert_eq!(staging.profile, Profile::Staging);
        assert_eq!(staging.encoding, production.encoding);
        assert_eq!(staging.retry.max_retries, 3);
        assert_eq!(staging.encoding_timeout_secs, 900);
        assert!(staging.detailed_logging);
    }

    #[test]
    fn test_bitrate_kbps_parsing() {
        let mut params = EnvironmentConfig::for_profile(Profile::Local).encoding;
        assert_eq!(params.bitrate_kbps(), 64);

        params.bitrate = "56k".to_string();
        assert_eq!(params.bitrate_kbps(), 56);

        params.bitrate = "garbage".to_string();
        assert_eq!(params.bitrate_kbps(), 0);
    }

    #[test]
    fn test_derive_workers() {
        assert_eq!(derive_workers(1), 2);
        assert_eq!(derive_workers(4), 2);
        assert_eq!(derive_workers(7), 2);
        assert_eq!(derive_workers(8), 4);
        assert_eq!(derive_workers(64), 4);
    }

    #[test]
    fn test_empty_overrides_change_nothing() {
        let overrides = Overrides::parse_toml("").expect("Empty TOML should parse");

        let mut config = EnvironmentConfig::for_profile(Profile::Local);
        let original = config.clone();
        overrides.apply(&mut config);

        assert_eq!(config, original);
    }

    #[test]
    fn test_partial_overrides_apply() {
        let toml_str = r#"
[queue]
max_workers = 6

[retry]
max_retries = 7

[encoding]
bitrate = "48k"
timeout_secs = 120

[paths]
ffmpeg = "/usr/local/bin/ffmpeg"
"#;
        let overrides = Overrides::parse_toml(toml_str).expect("Valid TOML should parse");

        let mut config = EnvironmentConfig::for_profile(Profile::Local);
        overrides.apply(&mut config);

        assert_eq!(config.max_workers, 6);
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.encoding.bitrate, "48k");
        assert_eq!(config.encoding_timeout_secs, 120);
        assert_eq!(config.ffmpeg_path, "/usr/local/bin/ffmpeg");
        // Untouched fields keep their profile values
        assert_eq!(config.max_queue_size, 10);
        assert_eq!(config.ffprobe_path, "ffprobe");
    }

    #[test]
    fn test_zero_workers_override_derives_from_cores() {
        let toml_str = r#"
[queue]
max_workers = 0
"#;
        let overrides = Overrides::parse_toml(toml_str).unwrap();
        let mut config = EnvironmentConfig::for_profile(Profile::Local);
        overrides.apply(&mut config);

        let expected = derive_workers(num_cpus::get() as u32);
        assert_eq!(config.max_workers, expected);
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("ENCODER_MAX_WORKERS", "3");
        env::set_var("ENCODER_MAX_RETRIES", "9");
        env::set_var("ENCODER_BITRATE", "32k");
        env::set_var("ENCODER_TIMEOUT_SECS", "60");
        env::set_var("ENCODER_FFPROBE_PATH", "/opt/ffprobe");

        let mut config = EnvironmentConfig::for_profile(Profile::Production);
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.max_workers, 3);
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.encoding.bitrate, "32k");
        assert_eq!(config.encoding_timeout_secs, 60);
        assert_eq!(config.ffprobe_path, "/opt/ffprobe");
        assert_eq!(config.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn test_env_overrides_ignore_invalid_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("ENCODER_MAX_RETRIES", "not-a-number");
        env::set_var("ENCODER_BITRATE", "");

        let mut config = EnvironmentConfig::for_profile(Profile::Local);
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.encoding.bitrate, "64k");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // For any combination of override fields, apply() changes exactly
        // the fields that are present and leaves the rest untouched.
        #[test]
        fn prop_overrides_apply_only_present_fields(
            max_workers in proptest::option::of(1u32..64),
            max_queue in proptest::option::of(1usize..512),
            max_retries in proptest::option::of(0u32..16),
            timeout in proptest::option::of(1u64..7200),
        ) {
            let overrides = Overrides {
                queue: QueueOverrides {
                    max_workers,
                    max_queue_size: max_queue,
                },
                retry: RetryOverrides {
                    max_retries,
                    ..Default::default()
                },
                encoding: EncodingOverrides {
                    timeout_secs: timeout,
                    ..Default::default()
                },
                paths: PathOverrides::default(),
            };

            let base = EnvironmentConfig::for_profile(Profile::Production);
            let mut config = base.clone();
            overrides.apply(&mut config);

            prop_assert_eq!(config.max_workers, max_workers.unwrap_or(base.max_workers));
            prop_assert_eq!(config.max_queue_size, max_queue.unwrap_or(base.max_queue_size));
            prop_assert_eq!(
                config.retry.max_retries,
                max_retries.unwrap_or(base.retry.max_retries)
            );
            prop_assert_eq!(
                config.encoding_timeout_secs,
                timeout.unwrap_or(base.encoding_timeout_secs)
            );
            // Fields without overrides are untouched
            prop_assert_eq!(config.encoding, base.encoding);
            prop_assert_eq!(config.ffmpeg_path, base.ffmpeg_path);
        }
    }
}
