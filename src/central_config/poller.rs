use super::cache::{ConfigCache, RemoteConfig, parse_max_age};
use crate::client::{ClientConfig, Notifier};
use crate::domain::ClientError;
use crate::sender::{ClientStats, HttpTransport};
use parking_lot::RwLock;
use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, ETAG, HeaderMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one poll of the agent configuration endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// 200 with a valid body; subscribers were notified.
    Updated(RemoteConfig),
    /// 304, the cached configuration still holds.
    NotModified,
    /// 403/404, central configuration is not enabled on the server.
    Unavailable(u16),
    Failed(ClientError),
}

/// Periodically fetches agent configuration, independently of intake.
#[derive(Debug, Clone)]
pub struct ConfigPoller {
    transport: Arc<HttpTransport>,
    service_name: String,
    environment: Option<String>,
    default_interval: Duration,
    request_timeout: Duration,
    cache: Arc<RwLock<ConfigCache>>,
    notifier: Notifier,
    stats: Arc<ClientStats>,
}

impl ConfigPoller {
    pub fn new(
        transport: Arc<HttpTransport>,
        config: &ClientConfig,
        cache: Arc<RwLock<ConfigCache>>,
        notifier: Notifier,
        stats: Arc<ClientStats>,
    ) -> Self {
        Self {
            transport,
            service_name: config.service_name.clone(),
            environment: config.environment.clone(),
            default_interval: config.central_config_interval,
            request_timeout: config.intake.server_timeout,
            cache,
            notifier,
            stats,
        }
    }

    /// Runs the poll loop until `cancel` fires. The first poll is immediate.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        debug!(service = %self.service_name, "central config poller started");
        loop {
            let (_, delay) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!("central config poller stopped");
    }

    /// Performs one conditional fetch and returns its outcome plus the delay
    /// until the next poll.
    pub async fn poll_once(&self) -> (PollOutcome, Duration) {
        let etag = self.cache.read().etag.clone();
        let request = self.transport.config_request(
            &self.service_name,
            self.environment.as_deref(),
            etag.as_deref(),
        );

        let outcome = match timeout(self.request_timeout, request.send()).await {
            Err(_) => Err(config_error(None, "request timed out".to_string())),
            Ok(Err(e)) => Err(config_error(None, ClientError::from_reqwest(&e).to_string())),
            Ok(Ok(response)) => self.handle_response(response).await,
        };

        let (outcome, delay) = match outcome {
            Ok(polled) => polled,
            Err(error) => {
                warn!("Central config poll failed: {}", error);
                self.notifier.error(error.clone());
                (PollOutcome::Failed(error), self.default_interval)
            }
        };

        self.stats
            .record_config_poll(matches!(outcome, PollOutcome::Failed(_)));
        self.cache.write().next_poll_at = Instant::now().checked_add(delay);
        (outcome, delay)
    }

    async fn handle_response(
        &self,
        response: reqwest::Response,
    ) -> Result<(PollOutcome, Duration), ClientError> {
        let status = response.status();
        let delay = self.scheduled_delay(response.headers());

        match status {
            StatusCode::OK => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| config_error(Some(200), ClientError::from_reqwest(&e).to_string()))?;
                let config = RemoteConfig::from_slice(&body).map_err(|e| {
                    config_error(Some(200), format!("unparsable config body: {e}"))
                })?;

                {
                    let mut cache = self.cache.write();
                    // A response without an ETag keeps the previous one.
                    if let Some(etag) = etag {
                        cache.etag = Some(etag);
                    }
                    cache.last_config = Some(config.clone());
                }
                info!(keys = config.len(), "Central config updated");
                self.notifier.config_changed(config.clone());
                Ok((PollOutcome::Updated(config), delay))
            }
            StatusCode::NOT_MODIFIED => Ok((PollOutcome::NotModified, delay)),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                debug!(status = status.as_u16(), "Central config not available on this server");
                Ok((PollOutcome::Unavailable(status.as_u16()), self.default_interval))
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                let body = body.trim();
                let message = if body.is_empty() {
                    format!("Unexpected APM Server response ({})", other.as_u16())
                } else {
                    format!("Unexpected APM Server response ({}): {}", other.as_u16(), body)
                };
                Err(config_error(Some(other.as_u16()), message))
            }
        }
    }

    fn scheduled_delay(&self, headers: &HeaderMap) -> Duration {
        headers
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(self.default_interval)
    }
}

fn config_error(status: Option<u16>, message: String) -> ClientError {
    ClientError::CentralConfig { status, message }
}
