use crate::central_config::RemoteConfig;
use crate::domain::ClientError;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const ERROR_CHANNEL_CAPACITY: usize = 256;
const CONFIG_CHANNEL_CAPACITY: usize = 16;

/// Stream lifecycle as observed by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// `end` has delivered the final request.
    Finished,
    /// No further network activity will happen.
    Closed,
}

/// One typed channel per notification kind.
#[derive(Debug, Clone)]
pub struct Notifier {
    errors: broadcast::Sender<ClientError>,
    config: broadcast::Sender<RemoteConfig>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (config, _) = broadcast::channel(CONFIG_CHANNEL_CAPACITY);
        let (lifecycle, _) = watch::channel(Lifecycle::Running);
        Self {
            errors,
            config,
            lifecycle: Arc::new(lifecycle),
        }
    }

    pub fn error(&self, error: ClientError) {
        if self.errors.send(error).is_err() {
            debug!("No error subscribers");
        }
    }

    pub fn config_changed(&self, config: RemoteConfig) {
        let _ = self.config.send(config);
    }

    pub fn lifecycle(&self, state: Lifecycle) {
        self.lifecycle.send_replace(state);
    }

    pub fn current_lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ClientError> {
        self.errors.subscribe()
    }

    pub fn subscribe_config(&self) -> broadcast::Receiver<RemoteConfig> {
        self.config.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_kind_has_its_own_channel() {
        let notifier = Notifier::new();
        let mut errors = notifier.subscribe_errors();
        let mut config = notifier.subscribe_config();
        let mut lifecycle = notifier.subscribe_lifecycle();

        notifier.error(ClientError::Transport("reset".into()));
        notifier.config_changed(RemoteConfig::default());
        notifier.lifecycle(Lifecycle::Finished);

        assert_eq!(
            errors.recv().await.unwrap(),
            ClientError::Transport("reset".into())
        );
        assert!(config.recv().await.unwrap().is_empty());
        lifecycle.changed().await.unwrap();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Finished);
    }

    #[test]
    fn test_sending_without_subscribers_is_fine() {
        let notifier = Notifier::new();
        notifier.error(ClientError::Ended);
        notifier.lifecycle(Lifecycle::Closed);
        assert_eq!(notifier.current_lifecycle(), Lifecycle::Closed);
    }
}
