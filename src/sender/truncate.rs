use crate::client::IntakeTunables;
use crate::domain::EventKind;
use serde_json::Value;

/// Keys whose string values are treated as keywords wherever they appear.
const KEYWORD_FIELDS: &[&str] = &[
    "name",
    "type",
    "subtype",
    "action",
    "result",
    "outcome",
    "id",
    "trace_id",
    "parent_id",
    "transaction_id",
    "culprit",
    "method",
    "status",
    "framework",
    "domain",
];

const LONG_FIELDS: &[&str] = &[
    "/context/db/statement",
    "/context/request/body",
    "/context/message/body",
];

const ERROR_MESSAGE_FIELDS: &[&str] = &["/exception/message", "/log/message"];

/// Per-field-class length ceilings, counted in characters. `None` disables a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub keywords: Option<usize>,
    pub long_fields: Option<usize>,
    pub error_messages: Option<usize>,
}

impl Default for Truncation {
    fn default() -> Self {
        Self::from_tunables(&IntakeTunables::default())
    }
}

impl Truncation {
    pub fn disabled() -> Self {
        Self {
            keywords: None,
            long_fields: None,
            error_messages: None,
        }
    }

    pub fn from_tunables(tunables: &IntakeTunables) -> Self {
        Self {
            keywords: tunables.truncate_keywords_at,
            long_fields: tunables.truncate_long_fields_at,
            error_messages: tunables.truncate_error_messages_at,
        }
    }

    pub fn apply(&self, kind: EventKind, payload: &mut Value) {
        if let Some(max) = self.error_messages {
            if kind == EventKind::Error {
                for pointer in ERROR_MESSAGE_FIELDS {
                    truncate_at(payload.pointer_mut(pointer), max);
                }
            }
        }

        if let Some(max) = self.long_fields {
            for pointer in LONG_FIELDS {
                truncate_at(payload.pointer_mut(pointer), max);
            }
        }

        if let Some(max) = self.keywords {
            truncate_keywords(payload, max);
        }
    }
}

fn truncate_keywords(value: &mut Value, max: usize) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                match field {
                    Value::String(text) if KEYWORD_FIELDS.contains(&key.as_str()) => {
                        truncate_str(text, max);
                    }
                    Value::String(_) => {}
                    nested => truncate_keywords(nested, max),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| truncate_keywords(item, max)),
        _ => {}
    }
}

fn truncate_at(field: Option<&mut Value>, max: usize) {
    if let Some(Value::String(text)) = field {
        truncate_str(text, max);
    }
}

pub(crate) fn truncate_str(text: &mut String, max: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
}
