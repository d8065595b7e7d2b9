//! Transcoder invocation.

mod ffmpeg;

pub use ffmpeg::*;
