//! Batching between submission and the wire: admission control, the
//! micro-batch window and the per-request gzip stream.

pub mod batch;
pub mod chopper;
pub mod queue;

pub use batch::{BatchWindow, EncodedEvent, WindowConfig};
pub use chopper::{BodyFrame, ChoppedStream};
pub use queue::Admission;
