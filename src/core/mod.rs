//! Core types: errors, configuration, paths, redaction.

pub mod config;
pub mod errors;
pub mod paths;
pub mod redact;
