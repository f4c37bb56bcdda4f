use crate::domain::ClientError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Longest accepted value for any intake duration knob.
pub const MAX_TUNABLE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Knobs the intake pipeline re-reads at runtime; see `Client::configure`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeTunables {
    /// Compressed byte ceiling per request.
    pub size: usize,
    /// Age ceiling per request; `None` keeps a request open until another trigger.
    pub time: Option<Duration>,
    /// Micro-batch window; `None` writes every event through immediately.
    pub buffer_window_time: Option<Duration>,
    pub buffer_window_size: usize,
    pub max_queue_size: usize,
    /// Inactivity ceiling while the body is still being streamed.
    pub server_timeout: Duration,
    pub response_timeout: Duration,
    pub response_timeout_on_end: Duration,
    pub truncate_keywords_at: Option<usize>,
    pub truncate_long_fields_at: Option<usize>,
    pub truncate_error_messages_at: Option<usize>,
    pub backoff_jitter: bool,
}

impl Default for IntakeTunables {
    fn default() -> Self {
        Self {
            size: 768_000,
            time: Some(Duration::from_millis(10_000)),
            buffer_window_time: Some(Duration::from_millis(20)),
            buffer_window_size: 50,
            max_queue_size: 1024,
            server_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(10),
            response_timeout_on_end: Duration::from_secs(1),
            truncate_keywords_at: Some(1024),
            truncate_long_fields_at: Some(10_000),
            truncate_error_messages_at: Some(2048),
            backoff_jitter: false,
        }
    }
}

impl IntakeTunables {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.size == 0 {
            return Err(invalid("size must be greater than 0"));
        }
        if self.buffer_window_size == 0 {
            return Err(invalid("buffer_window_size must be greater than 0"));
        }
        if self.max_queue_size == 0 {
            return Err(invalid("max_queue_size must be greater than 0"));
        }
        if self.time.is_some_and(|t| t.is_zero()) {
            return Err(invalid("time must be positive or disabled"));
        }
        if self.server_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(invalid("timeouts must be greater than 0"));
        }
        let durations = [
            self.time,
            self.buffer_window_time,
            Some(self.server_timeout),
            Some(self.response_timeout),
            Some(self.response_timeout_on_end),
        ];
        if durations.into_iter().flatten().any(|d| d > MAX_TUNABLE_DURATION) {
            return Err(invalid("durations must not exceed 24 hours"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_url: String,
    pub service_name: String,
    pub service_version: Option<String>,
    pub environment: Option<String>,
    pub secret_token: Option<String>,
    pub api_key: Option<String>,
    /// Prepended to the client's own User-Agent tokens.
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
    pub max_sockets: usize,
    pub keep_alive: Duration,
    pub verify_server_cert: bool,
    pub central_config: bool,
    pub central_config_interval: Duration,
    pub payload_log_file: Option<PathBuf>,
    pub metadata_timeout: Duration,
    pub intake: IntakeTunables,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8200".to_string(),
            service_name: "unknown-rust-service".to_string(),
            service_version: None,
            environment: None,
            secret_token: None,
            api_key: None,
            user_agent: None,
            connect_timeout: Duration::from_secs(10),
            max_sockets: 20,
            keep_alive: Duration::from_secs(60),
            verify_server_cert: true,
            central_config: false,
            central_config_interval: Duration::from_secs(300),
            payload_log_file: None,
            metadata_timeout: Duration::from_secs(5),
            intake: IntakeTunables::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn base_url(&self) -> Result<Url, ClientError> {
        let url: Url = self
            .server_url
            .parse()
            .map_err(|e| invalid(format!("Invalid server URL '{}': {}", self.server_url, e)))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid(format!("Unsupported server URL scheme: {other}"))),
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        self.base_url()?;

        if self.service_name.trim().is_empty() {
            return Err(invalid("service_name cannot be empty"));
        }
        if self.max_sockets == 0 {
            return Err(invalid("max_sockets must be greater than 0"));
        }
        if self.central_config_interval.is_zero() {
            return Err(invalid("central_config_interval must be greater than 0"));
        }

        self.intake.validate()
    }
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::InvalidConfiguration(message.into())
}
