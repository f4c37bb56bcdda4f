use super::truncate::Truncation;
use crate::domain::{ClientError, EventKind};
use bytes::Bytes;
use serde_json::Value;
use std::io::Write;

/// Turns one event into its NDJSON intake line: `{"<kind>":<payload>}\n`.
#[derive(Debug, Clone, Default)]
pub struct EventEncoder {
    truncation: Truncation,
}

impl EventEncoder {
    pub fn new(truncation: Truncation) -> Self {
        Self { truncation }
    }

    pub fn set_truncation(&mut self, truncation: Truncation) {
        self.truncation = truncation;
    }

    pub fn truncation(&self) -> Truncation {
        self.truncation
    }

    pub fn encode(&self, kind: EventKind, mut payload: Value) -> Result<Bytes, ClientError> {
        if !payload.is_object() {
            return Err(ClientError::Encoding(format!(
                "{kind} payload must be a JSON object"
            )));
        }

        self.truncation.apply(kind, &mut payload);

        let mut buffer = Vec::with_capacity(256);
        write!(buffer, "{{\"{}\":", kind.as_str())
            .map_err(|e| ClientError::Encoding(e.to_string()))?;
        serde_json::to_writer(&mut buffer, &payload)
            .map_err(|e| ClientError::Encoding(format!("{kind}: {e}")))?;
        buffer.extend_from_slice(b"}\n");

        Ok(Bytes::from(buffer))
    }
}
