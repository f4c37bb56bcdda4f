pub mod config;
pub mod logging_system;
pub mod protocol;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, LogLevel};
pub use logging_system::{InitializationError, LoggingSystem, setup_logging_safe};
pub use protocol::{InputError, parse_event_line};
pub use shutdown::shutdown_signal;

use crate::client::{Client, Lifecycle};
use crate::domain::ClientError;
use anyhow::Context;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Counters for one stdin forwarding session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    pub lines: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub dropped: u64,
}

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::new(Config::from_args(args)?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let client_config = self.config.to_client_config();
        let end_grace =
            client_config.intake.server_timeout + client_config.intake.response_timeout_on_end;

        info!("Starting rask-apm-client v{}", crate::VERSION);
        info!(
            "Configuration: service={}, server={}, central_config={}",
            client_config.service_name, client_config.server_url, client_config.central_config
        );

        let client = Client::new(client_config).context("Failed to start APM client")?;
        let listener = spawn_notification_logger(&client);

        let stdin = BufReader::new(tokio::io::stdin());
        let summary = forward(&client, stdin, shutdown_signal()).await;
        info!(
            lines = summary.lines,
            forwarded = summary.forwarded,
            rejected = summary.rejected,
            dropped = summary.dropped,
            "Input closed, ending client"
        );

        match tokio::time::timeout(end_grace, client.end()).await {
            Ok(Ok(())) => info!("All buffered events delivered"),
            Ok(Err(e)) => warn!("End completed with error: {}", e),
            Err(_) => {
                warn!(?end_grace, "End did not complete in time, destroying client");
                client.destroy();
            }
        }

        listener.abort();
        match serde_json::to_string(&client.stats()) {
            Ok(stats) => info!(%stats, "rask-apm-client stopped"),
            Err(_) => info!("rask-apm-client stopped"),
        }
        Ok(())
    }
}

/// Reads NDJSON event lines until EOF or `shutdown` resolves, submitting
/// each to `client`. Malformed lines are logged and skipped.
pub async fn forward<R, S>(client: &Client, reader: R, shutdown: S) -> ForwardSummary
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut summary = ForwardSummary::default();
    let mut lines = reader.lines();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            biased;
            () = &mut shutdown => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;

        let (kind, payload) = match parse_event_line(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = summary.lines, "Skipping input line: {}", e);
                summary.rejected += 1;
                continue;
            }
        };

        let mut receipt = client.send(kind, payload);
        match receipt.try_outcome() {
            Some(Err(ClientError::QueueFull { .. })) => summary.dropped += 1,
            Some(Err(e)) => {
                warn!("Client no longer accepts events: {}", e);
                summary.rejected += 1;
                break;
            }
            _ => summary.forwarded += 1,
        }
    }

    summary
}

/// Logs delivery errors, config changes and lifecycle transitions until the
/// client closes.
fn spawn_notification_logger(client: &Client) -> JoinHandle<()> {
    let mut errors = client.subscribe_errors();
    let mut configs = client.subscribe_config();
    let mut lifecycle = client.lifecycle();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = errors.recv() => match received {
                    Ok(e) => error!(status = ?e.status(), "APM delivery error: {}", e),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Error notifications lagged"),
                    Err(RecvError::Closed) => break,
                },
                received = configs.recv() => match received {
                    Ok(config) => info!(keys = config.len(), "Central config updated"),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Config notifications lagged"),
                    Err(RecvError::Closed) => break,
                },
                changed = lifecycle.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *lifecycle.borrow_and_update();
                    debug!(?state, "Client lifecycle changed");
                    if state == Lifecycle::Closed {
                        break;
                    }
                }
            }
        }
    })
}

pub async fn main() -> anyhow::Result<()> {
    let app = App::from_args(std::env::args_os())?;
    setup_logging_safe(app.config().log_level, app.config().log_format)?;
    app.run().await
}
