//! Structured run logging: append-only JSONL with graceful degradation.

pub mod jsonl;
