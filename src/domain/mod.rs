//! Domain layer for rask-apm-client.
//!
//! Contains the canonical types shared across all modules:
//! - `EventKind` / `PendingEvent`: what applications submit
//! - `Completion` / `DeliveryReceipt`: exactly-once delivery signalling
//! - `Metadata`: the per-request descriptor document
//! - `ClientError`: the error taxonomy surfaced to applications

pub mod completion;
pub mod error;
pub mod event;
pub mod metadata;

pub use completion::{Completion, DeliveryReceipt};
pub use error::{ClientError, IntakeError, IntakeErrorItem};
pub use event::{EventKind, PendingEvent};
pub use metadata::{
    AgentInfo, CloudMetadataFetcher, Metadata, MetadataDocument, MetadataExtension,
    MetadataFilter, ProcessInfo, ServiceInfo, SystemInfo,
};
