//! Small scheduling helpers shared by the background loops

pub mod backoff;
pub mod timer;

pub use backoff::Backoff;
pub use timer::{next_aligned, AlignedTicker, ThrottleFirst};
