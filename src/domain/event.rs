use super::completion::Completion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of APM events the intake endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transaction,
    Span,
    Error,
    Metricset,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Transaction,
        EventKind::Span,
        EventKind::Error,
        EventKind::Metricset,
    ];

    /// Key used for the event's envelope on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::Span => "span",
            EventKind::Error => "error",
            EventKind::Metricset => "metricset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

/// An event accepted by the client and not yet acknowledged.
#[derive(Debug)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub completion: Completion,
}

impl PendingEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value, completion: Completion) -> Self {
        Self {
            kind,
            payload,
            completion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("log".parse::<EventKind>().is_err());
    }
}
