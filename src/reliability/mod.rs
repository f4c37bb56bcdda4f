pub mod backoff;
pub mod mirror;

pub use backoff::{Backoff, MAX_BACKOFF_SECS, delay_for};
pub use mirror::{MirrorError, PayloadMirror};
