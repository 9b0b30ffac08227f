#![forbid(unsafe_code)]

//! Backup Storage Guard (bsg): refuses to start a backup that would push the
//! backup volume past its storage budget.
//!
//! One invocation is one decision:
//! 1. **Inspect** the live volume usage and the sizes of recent backups
//! 2. **Evaluate** `current + estimate` against the configured ceiling
//! 3. **Execute** the backup producer only when admitted, cleaning up any
//!    partial artifact on failure, and **alert** the operator on every
//!    denial or failure
//!
//! # Library usage
//!
//! ```rust,no_run
//! use backup_storage_guard::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use backup_storage_guard::core::config::Config;
//! use backup_storage_guard::guard::threshold::{StorageLimits, evaluate};
//! ```

pub mod prelude;

pub mod alert;
pub mod core;
pub mod guard;
pub mod logger;
pub mod platform;
