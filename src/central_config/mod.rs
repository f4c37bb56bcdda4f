//! Agent configuration polling with ETag / Cache-Control validation.

pub mod cache;
pub mod poller;

pub use cache::{ConfigCache, MAX_POLL_DELAY, RemoteConfig, parse_max_age};
pub use poller::{ConfigPoller, PollOutcome};
