use super::serde_helpers::{
    load_env_path_opt, load_env_string, load_env_string_opt, load_env_var, optional_limit,
    optional_millis,
};
use super::{ConfigError, LogFormat, LogLevel};
use crate::client::{ClientConfig, IntakeTunables};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVICE_NAME: &str = "rask-apm-client";

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(author, version, about = "Forwards NDJSON APM events from stdin to an APM Server", long_about = None)]
#[serde(default)]
pub struct Config {
    /// APM Server base URL
    #[arg(long, env = "RASK_APM_SERVER_URL", default_value = "http://localhost:8200")]
    pub server_url: String,

    /// Service name reported in metadata (defaults to the hostname)
    #[arg(long, env = "RASK_APM_SERVICE_NAME")]
    pub service_name: Option<String>,

    #[arg(long, env = "RASK_APM_SERVICE_VERSION")]
    pub service_version: Option<String>,

    #[arg(long, env = "RASK_APM_ENVIRONMENT")]
    pub environment: Option<String>,

    #[arg(long, env = "RASK_APM_SECRET_TOKEN", hide_env_values = true)]
    pub secret_token: Option<String>,

    /// Takes precedence over the secret token
    #[arg(long, env = "RASK_APM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Prefix for the User-Agent header
    #[arg(long, env = "RASK_APM_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, env = "RASK_APM_DISABLE_CERT_VERIFICATION")]
    pub disable_cert_verification: bool,

    /// Maximum idle connections kept to the APM Server
    #[arg(long, env = "RASK_APM_MAX_SOCKETS", default_value_t = 20)]
    pub max_sockets: usize,

    #[arg(long, env = "RASK_APM_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Poll the APM Server for agent configuration
    #[arg(long, env = "RASK_APM_CENTRAL_CONFIG")]
    pub central_config: bool,

    /// Poll interval when the server sends no Cache-Control hint
    #[arg(long, env = "RASK_APM_CENTRAL_CONFIG_INTERVAL_SECS", default_value_t = 300)]
    pub central_config_interval_secs: u64,

    /// Compressed byte ceiling per intake request
    #[arg(long, env = "RASK_APM_API_REQUEST_SIZE", default_value_t = 768_000)]
    pub api_request_size: usize,

    /// Age ceiling per intake request in ms, -1 disables
    #[arg(long, env = "RASK_APM_API_REQUEST_TIME_MS", default_value_t = 10_000, allow_negative_numbers = true)]
    pub api_request_time_ms: i64,

    /// Micro-batch window in ms, -1 disables
    #[arg(long, env = "RASK_APM_BUFFER_WINDOW_TIME_MS", default_value_t = 20, allow_negative_numbers = true)]
    pub buffer_window_time_ms: i64,

    #[arg(long, env = "RASK_APM_BUFFER_WINDOW_SIZE", default_value_t = 50)]
    pub buffer_window_size: usize,

    /// Events held while the server is slow or down; extra events are dropped
    #[arg(long, env = "RASK_APM_MAX_QUEUE_SIZE", default_value_t = 1024)]
    pub max_queue_size: usize,

    #[arg(long, env = "RASK_APM_SERVER_TIMEOUT_MS", default_value_t = 30_000)]
    pub server_timeout_ms: u64,

    #[arg(long, env = "RASK_APM_RESPONSE_TIMEOUT_MS", default_value_t = 10_000)]
    pub response_timeout_ms: u64,

    #[arg(long, env = "RASK_APM_RESPONSE_TIMEOUT_ON_END_MS", default_value_t = 1_000)]
    pub response_timeout_on_end_ms: u64,

    /// Keyword field ceiling in characters, negative disables
    #[arg(long, env = "RASK_APM_TRUNCATE_KEYWORDS_AT", default_value_t = 1024, allow_negative_numbers = true)]
    pub truncate_keywords_at: i64,

    /// Long text field ceiling in characters, negative disables
    #[arg(long, env = "RASK_APM_TRUNCATE_LONG_FIELDS_AT", default_value_t = 10_000, allow_negative_numbers = true)]
    pub truncate_long_fields_at: i64,

    /// Error message ceiling in characters, negative disables
    #[arg(long, env = "RASK_APM_TRUNCATE_ERROR_MESSAGES_AT", default_value_t = 2048, allow_negative_numbers = true)]
    pub truncate_error_messages_at: i64,

    /// Randomize backoff delays by up to 10%
    #[arg(long, env = "RASK_APM_BACKOFF_JITTER")]
    pub backoff_jitter: bool,

    /// Append every uncompressed intake line to this file
    #[arg(long, env = "RASK_APM_PAYLOAD_LOG_FILE")]
    pub payload_log_file: Option<PathBuf>,

    #[arg(long, env = "RASK_APM_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "RASK_APM_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// TOML configuration file; command-line values that differ from the
    /// defaults take precedence over it
    #[arg(long, env = "RASK_APM_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8200".to_string(),
            service_name: None,
            service_version: None,
            environment: None,
            secret_token: None,
            api_key: None,
            user_agent: None,
            disable_cert_verification: false,
            max_sockets: 20,
            connect_timeout_secs: 10,
            central_config: false,
            central_config_interval_secs: 300,
            api_request_size: 768_000,
            api_request_time_ms: 10_000,
            buffer_window_time_ms: 20,
            buffer_window_size: 50,
            max_queue_size: 1024,
            server_timeout_ms: 30_000,
            response_timeout_ms: 10_000,
            response_timeout_on_end_ms: 1_000,
            truncate_keywords_at: 1024,
            truncate_long_fields_at: 10_000,
            truncate_error_messages_at: 2048,
            backoff_jitter: false,
            payload_log_file: None,
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            config_file: None,
        }
    }
}

/// Copies every field of `$from` that differs from the default into `$into`.
macro_rules! overlay {
    ($into:expr, $from:expr, $defaults:expr, $($field:ident),+ $(,)?) => {
        $(
            if $from.$field != $defaults.$field {
                $into.$field = $from.$field.clone();
            }
        )+
    };
}

impl Config {
    /// Command line and environment (through clap), layered over the
    /// config file when one is given.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Config::parse_from(args);

        let mut config = match &cli.config_file {
            Some(path) => Self::read_file(path)?,
            None => match std::env::var("RASK_APM_CONFIG") {
                Ok(inline) => toml::from_str(&inline)?,
                Err(_) => Config::default(),
            },
        };
        config.merge_from(&cli);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        // Inline TOML wins over individual variables
        if let Ok(inline) = std::env::var("RASK_APM_CONFIG") {
            return Self::from_toml_str(&inline);
        }

        let mut config = Config::default();

        load_env_string("RASK_APM_SERVER_URL", &mut config.server_url);
        load_env_string_opt("RASK_APM_SERVICE_NAME", &mut config.service_name);
        load_env_string_opt("RASK_APM_SERVICE_VERSION", &mut config.service_version);
        load_env_string_opt("RASK_APM_ENVIRONMENT", &mut config.environment);
        load_env_string_opt("RASK_APM_SECRET_TOKEN", &mut config.secret_token);
        load_env_string_opt("RASK_APM_API_KEY", &mut config.api_key);
        load_env_string_opt("RASK_APM_USER_AGENT", &mut config.user_agent);
        load_env_var(
            "RASK_APM_DISABLE_CERT_VERIFICATION",
            &mut config.disable_cert_verification,
        )?;
        load_env_var("RASK_APM_MAX_SOCKETS", &mut config.max_sockets)?;
        load_env_var("RASK_APM_CONNECT_TIMEOUT_SECS", &mut config.connect_timeout_secs)?;
        load_env_var("RASK_APM_CENTRAL_CONFIG", &mut config.central_config)?;
        load_env_var(
            "RASK_APM_CENTRAL_CONFIG_INTERVAL_SECS",
            &mut config.central_config_interval_secs,
        )?;
        load_env_var("RASK_APM_API_REQUEST_SIZE", &mut config.api_request_size)?;
        load_env_var("RASK_APM_API_REQUEST_TIME_MS", &mut config.api_request_time_ms)?;
        load_env_var("RASK_APM_BUFFER_WINDOW_TIME_MS", &mut config.buffer_window_time_ms)?;
        load_env_var("RASK_APM_BUFFER_WINDOW_SIZE", &mut config.buffer_window_size)?;
        load_env_var("RASK_APM_MAX_QUEUE_SIZE", &mut config.max_queue_size)?;
        load_env_var("RASK_APM_SERVER_TIMEOUT_MS", &mut config.server_timeout_ms)?;
        load_env_var("RASK_APM_RESPONSE_TIMEOUT_MS", &mut config.response_timeout_ms)?;
        load_env_var(
            "RASK_APM_RESPONSE_TIMEOUT_ON_END_MS",
            &mut config.response_timeout_on_end_ms,
        )?;
        load_env_var("RASK_APM_TRUNCATE_KEYWORDS_AT", &mut config.truncate_keywords_at)?;
        load_env_var(
            "RASK_APM_TRUNCATE_LONG_FIELDS_AT",
            &mut config.truncate_long_fields_at,
        )?;
        load_env_var(
            "RASK_APM_TRUNCATE_ERROR_MESSAGES_AT",
            &mut config.truncate_error_messages_at,
        )?;
        load_env_var("RASK_APM_BACKOFF_JITTER", &mut config.backoff_jitter)?;
        load_env_path_opt("RASK_APM_PAYLOAD_LOG_FILE", &mut config.payload_log_file);
        load_env_var("RASK_APM_LOG_LEVEL", &mut config.log_level)
            .map_err(|_| ConfigError::EnvError("Invalid RASK_APM_LOG_LEVEL".to_string()))?;
        load_env_var("RASK_APM_LOG_FORMAT", &mut config.log_format)?;

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path.as_ref())?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn merge_from(&mut self, cli: &Config) {
        let defaults = Config::default();
        overlay!(
            self,
            cli,
            defaults,
            server_url,
            service_name,
            service_version,
            environment,
            secret_token,
            api_key,
            user_agent,
            disable_cert_verification,
            max_sockets,
            connect_timeout_secs,
            central_config,
            central_config_interval_secs,
            api_request_size,
            api_request_time_ms,
            buffer_window_time_ms,
            buffer_window_size,
            max_queue_size,
            server_timeout_ms,
            response_timeout_ms,
            response_timeout_on_end_ms,
            truncate_keywords_at,
            truncate_long_fields_at,
            truncate_error_messages_at,
            backoff_jitter,
            payload_log_file,
            log_level,
            log_format,
            config_file,
        );
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        if self.service_name.is_none() {
            self.service_name = Some(Self::detect_service_name());
        }
        Ok(())
    }

    fn detect_service_name() -> String {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string())
    }

    pub fn intake_tunables(&self) -> IntakeTunables {
        IntakeTunables {
            size: self.api_request_size,
            time: optional_millis(self.api_request_time_ms),
            buffer_window_time: optional_millis(self.buffer_window_time_ms),
            buffer_window_size: self.buffer_window_size,
            max_queue_size: self.max_queue_size,
            server_timeout: Duration::from_millis(self.server_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            response_timeout_on_end: Duration::from_millis(self.response_timeout_on_end_ms),
            truncate_keywords_at: optional_limit(self.truncate_keywords_at),
            truncate_long_fields_at: optional_limit(self.truncate_long_fields_at),
            truncate_error_messages_at: optional_limit(self.truncate_error_messages_at),
            backoff_jitter: self.backoff_jitter,
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.server_url.clone(),
            service_name: self
                .service_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            service_version: self.service_version.clone(),
            environment: self.environment.clone(),
            secret_token: self.secret_token.clone(),
            api_key: self.api_key.clone(),
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_sockets: self.max_sockets,
            keep_alive: ClientConfig::default().keep_alive,
            verify_server_cert: !self.disable_cert_verification,
            central_config: self.central_config,
            central_config_interval: Duration::from_secs(self.central_config_interval_secs),
            payload_log_file: self.payload_log_file.clone(),
            metadata_timeout: ClientConfig::default().metadata_timeout,
            intake: self.intake_tunables(),
        }
    }
}
