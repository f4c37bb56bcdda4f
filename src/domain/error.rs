use std::fmt;
use thiserror::Error;

/// Errors surfaced to applications, through receipts or the error channel.
///
/// Cloneable so a single failed request can resolve every receipt it carried
/// and still be broadcast to subscribers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Intake request failed: {0}")]
    Transport(String),

    #[error("Intake request timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Intake(IntakeError),

    #[error("Event dropped: queue is full ({capacity} events)")]
    QueueFull { capacity: usize },

    #[error("Client has ended, no further writes are accepted")]
    Ended,

    #[error("Client was destroyed before the event was delivered")]
    Destroyed,

    #[error("Central config request failed: {message}")]
    CentralConfig { status: Option<u16>, message: String },

    #[error("Event encoding failed: {0}")]
    Encoding(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ClientError {
    /// Transport and protocol failures on the intake channel feed the backoff.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Timeout(_) | ClientError::Intake(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Intake(intake) => Some(intake.status),
            ClientError::CentralConfig { status, .. } => *status,
            _ => None,
        }
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = describe_chain(err);
        if err.is_timeout() {
            ClientError::Timeout(message)
        } else {
            ClientError::Transport(message)
        }
    }
}

/// Joins an error with its sources, reqwest's top-level message alone is terse.
pub(crate) fn describe_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// A non-2xx answer from the intake endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntakeError {
    pub status: u16,
    /// The server's `error` string, or the raw body when it was not structured.
    pub message: Option<String>,
    pub accepted: Option<u64>,
    pub errors: Vec<IntakeErrorItem>,
}

impl std::error::Error for IntakeError {}

impl fmt::Display for IntakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unexpected APM Server response ({})", self.status)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if !self.errors.is_empty() {
            let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
            write!(f, " [{}]", messages.join("; "))?;
        }
        Ok(())
    }
}

/// One rejected document from an intake error report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IntakeErrorItem {
    pub message: String,
    pub document: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intake_error_display() {
        let err = IntakeError {
            status: 400,
            message: Some("bad request".to_string()),
            accepted: Some(2),
            errors: vec![IntakeErrorItem {
                message: "invalid span".to_string(),
                document: None,
            }],
        };

        assert_eq!(
            err.to_string(),
            "Unexpected APM Server response (400): bad request [invalid span]"
        );
    }

    #[test]
    fn test_delivery_failure_classification() {
        assert!(ClientError::Transport("reset".into()).is_delivery_failure());
        assert!(ClientError::Timeout("slow".into()).is_delivery_failure());
        assert!(ClientError::Intake(IntakeError::default()).is_delivery_failure());
        assert!(!ClientError::QueueFull { capacity: 1 }.is_delivery_failure());
        assert!(!ClientError::Destroyed.is_delivery_failure());
    }

    #[test]
    fn test_status_accessor() {
        let intake = ClientError::Intake(IntakeError {
            status: 503,
            ..Default::default()
        });
        assert_eq!(intake.status(), Some(503));
        assert_eq!(ClientError::Ended.status(), None);
    }
}
