use super::{Config, ConfigError};
use crate::domain::ClientError;
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate server URL
        Url::parse(&self.server_url).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid server URL '{}': {}", self.server_url, e))
        })?;

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }

        if self.central_config && self.central_config_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Central config interval must be greater than 0".to_string(),
            ));
        }

        // Validate payload log directory
        if let Some(path) = &self.payload_log_file
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(ConfigError::InvalidConfig(format!(
                "Payload log directory does not exist: {}",
                parent.display()
            )));
        }

        // The remaining limits are owned by the client configuration
        self.to_client_config().validate().map_err(|e| match e {
            ClientError::InvalidConfiguration(msg) if msg.contains("URL") => {
                ConfigError::InvalidUrl(msg)
            }
            other => ConfigError::InvalidConfig(other.to_string()),
        })
    }
}
