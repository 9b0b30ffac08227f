//! Platform abstraction layer: live volume statistics.

pub mod pal;
