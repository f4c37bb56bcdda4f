use crate::domain::{ClientError, IntakeError, IntakeErrorItem};
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

/// A 2xx answer from the intake endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntakeAck {
    pub status: u16,
    pub accepted: Option<u64>,
    /// Documents the server rejected although the request as a whole succeeded.
    pub errors: Vec<IntakeErrorItem>,
}

impl IntakeAck {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// What could be read out of a response body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseReport {
    pub message: Option<String>,
    pub accepted: Option<u64>,
    pub errors: Vec<IntakeErrorItem>,
}

/// Reads the body and classifies the response.
pub async fn interpret(response: Response) -> Result<IntakeAck, ClientError> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);

    let body = response
        .bytes()
        .await
        .map_err(|e| ClientError::from_reqwest(&e))?;
    let report = parse_report(content_type.as_deref(), &body);

    if status.is_success() {
        Ok(IntakeAck {
            status: status.as_u16(),
            accepted: report.accepted,
            errors: report.errors,
        })
    } else {
        Err(ClientError::Intake(IntakeError {
            status: status.as_u16(),
            message: report.message,
            accepted: report.accepted,
            errors: report.errors,
        }))
    }
}

/// Parses JSON when the content type says so or is missing, and falls back
/// to the raw text for anything else.
pub fn parse_report(content_type: Option<&str>, body: &[u8]) -> ResponseReport {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return ResponseReport::default();
    }

    let wants_json = content_type.is_none_or(|ct| ct.contains("json"));
    if wants_json {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
            let errors: Vec<IntakeErrorItem> = map
                .get("errors")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(error_item).collect())
                .unwrap_or_default();

            let message = match map.get("error").and_then(Value::as_str) {
                Some(error) => Some(error.to_string()),
                None if errors.is_empty() && !map.contains_key("accepted") => {
                    Some(text.to_string())
                }
                None => None,
            };

            return ResponseReport {
                message,
                accepted: map.get("accepted").and_then(Value::as_u64),
                errors,
            };
        }
    }

    ResponseReport {
        message: Some(text.to_string()),
        ..ResponseReport::default()
    }
}

fn error_item(value: &Value) -> Option<IntakeErrorItem> {
    match value {
        Value::String(message) => Some(IntakeErrorItem {
            message: message.clone(),
            document: None,
        }),
        Value::Object(item) => Some(IntakeErrorItem {
            message: item
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            document: item
                .get("document")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        _ => None,
    }
}
