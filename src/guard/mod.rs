//! The guard itself: inspect, evaluate, execute, and the run state machine.

pub mod executor;
pub mod inspector;
pub mod lock;
pub mod orchestrator;
pub mod signals;
pub mod threshold;
