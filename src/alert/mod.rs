//! Operator alerting: event formatting, transports and retrying dispatch.

pub mod event;
pub mod notifier;
pub mod transport;
