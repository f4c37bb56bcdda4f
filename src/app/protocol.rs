use crate::domain::EventKind;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum InputError {
    #[error("Line is not valid JSON: {0}")]
    Json(String),
    #[error("Expected an object with exactly one event key")]
    Envelope,
    #[error("Unknown event kind '{0}'")]
    UnknownKind(String),
    #[error("Payload of '{0}' must be an object")]
    Payload(EventKind),
}

/// Parses one stdin line of the form `{"<kind>":{...}}`.
///
/// Events without a `timestamp` are stamped with the current time in
/// epoch microseconds.
pub fn parse_event_line(line: &str) -> Result<(EventKind, Value), InputError> {
    let value: Value = serde_json::from_str(line).map_err(|e| InputError::Json(e.to_string()))?;
    let Value::Object(envelope) = value else {
        return Err(InputError::Envelope);
    };
    if envelope.len() != 1 {
        return Err(InputError::Envelope);
    }
    let Some((key, payload)) = envelope.into_iter().next() else {
        return Err(InputError::Envelope);
    };

    let kind: EventKind = key.parse().map_err(|_| InputError::UnknownKind(key))?;
    let Value::Object(mut payload) = payload else {
        return Err(InputError::Payload(kind));
    };
    stamp(&mut payload);

    Ok((kind, Value::Object(payload)))
}

fn stamp(payload: &mut Map<String, Value>) {
    if !payload.contains_key("timestamp") {
        payload.insert(
            "timestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_micros()),
        );
    }
}
