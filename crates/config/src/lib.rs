//! Configuration module for the audiobook encoding pipeline
//!
//! Resolves per-deployment encoding profiles and applies TOML file and
//! environment variable overrides.

pub mod profile;

pub use profile::*;
