//! Everything between a buffered event and the APM Server: encoding,
//! truncation, the HTTP transport, the per-request streaming task and the
//! delivery worker that drives them.

pub(crate) mod controller;
pub mod http;
pub mod response;
pub mod serialization;
pub mod state;
pub mod stats;
pub mod transmission;
pub mod truncate;

pub use http::{HttpTransport, compose_user_agent};
pub use response::{IntakeAck, ResponseReport, parse_report};
pub use serialization::EventEncoder;
pub use state::IntakeState;
pub use stats::{ClientStats, StatsSnapshot};
pub use truncate::Truncation;
