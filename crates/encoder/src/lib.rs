//! Audiobook encoding pipeline
//!
//! Asynchronous audio-encoding core: a bounded job queue serviced by a
//! fixed worker pool, failure classification with exponential-backoff
//! retry, and file lifecycle management around an external ffmpeg
//! transcoder.

pub mod encode;
pub mod files;
pub mod job;
pub mod probe;
pub mod queue;
pub mod retry;
pub mod startup;
pub mod store;

pub use audiobook_encoder_config as config;
pub use audiobook_encoder_config::{EncodingParams, EnvironmentConfig, Profile, RetryPolicy};
pub use encode::{encode_decision, EncodeError, EncodingOutcome, FfmpegEncoder};
pub use files::{
    sanitize_filename, ChapterPaths, DeleteOutcome, DiskUsage, EncodingFileManager,
    EncodingFileSet, FileInfo, IntegrityError, StorageStats,
};
pub use job::{EncodingJob, EncodingStatus};
pub use probe::{parse_probe_output, probe_audio, AudioMetadata, ProbeError};
pub use queue::{EncodingQueue, JobEvent, QueueStats, SubmitError};
pub use retry::{
    analyze_failure, calculate_delay, FailureAnalysis, FailureReport, FailureStats, FailureType,
    RetryManager,
};
pub use startup::{check_ffmpeg_available, check_ffprobe_available, run_startup_checks, StartupError};
pub use store::{ChapterStore, NullChapterStore, StoreError};
