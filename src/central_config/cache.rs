use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Agent configuration as served by the APM Server: a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteConfig(Map<String, Value>);

impl RemoteConfig {
    pub fn from_slice(body: &[u8]) -> Result<Self, String> {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(format!("expected a JSON object, got {}", json_type(&other))),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String view of a value; numbers and booleans are rendered as text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for RemoteConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// What the poller remembers between polls.
#[derive(Debug, Clone, Default)]
pub struct ConfigCache {
    /// Sent back verbatim, quotes included, as `If-None-Match`.
    pub etag: Option<String>,
    pub last_config: Option<RemoteConfig>,
    pub next_poll_at: Option<Instant>,
}

/// Upper bound on a server-requested poll delay.
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Reads `max-age=N` out of a Cache-Control value; only positive N counts,
/// and N is clamped to [`MAX_POLL_DELAY`].
pub fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| {
            let (name, value) = directive.split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            value.trim().trim_matches('"').parse::<u64>().ok()
        })
        .filter(|secs| *secs > 0)
        .map(|secs| Duration::from_secs(secs).min(MAX_POLL_DELAY))
}
