//! The application-facing client.
//!
//! `Client` never blocks: every submission returns a [`DeliveryReceipt`]
//! immediately and the delivery worker does the rest. Errors, configuration
//! changes and lifecycle transitions are published on typed channels.

pub mod config;
pub mod notifications;

pub use config::{ClientConfig, IntakeTunables};
pub use notifications::{Lifecycle, Notifier};

use crate::buffer::Admission;
use crate::central_config::{ConfigCache, ConfigPoller, RemoteConfig};
use crate::domain::{
    ClientError, CloudMetadataFetcher, Completion, DeliveryReceipt, EventKind, Metadata,
    MetadataDocument, MetadataFilter, PendingEvent,
};
use crate::reliability::PayloadMirror;
use crate::sender::controller::{ControllerParts, DeliveryController};
use crate::sender::{ClientStats, HttpTransport, StatsSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const OPEN: u8 = 0;
const ENDED: u8 = 1;
const DESTROYED: u8 = 2;

/// Messages from the facade to the delivery worker, processed in order.
pub(crate) enum Command {
    Event(PendingEvent),
    Flush(Completion),
    End(Completion),
    Reconfigure(Box<IntakeTunables>),
    AddMetadataFilter(MetadataFilter),
}

pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    admission: Arc<Admission>,
    notifier: Notifier,
    stats: Arc<ClientStats>,
    config_cache: Arc<RwLock<ConfigCache>>,
    tunables: RwLock<IntakeTunables>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Client {
    /// Starts the delivery worker (and the config poller when enabled) on
    /// the current Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::start(config, None)
    }

    /// Like [`Client::new`], with cloud/container metadata fetched before
    /// the first request is opened.
    pub fn with_cloud_metadata(
        config: ClientConfig,
        fetcher: Arc<dyn CloudMetadataFetcher>,
    ) -> Result<Self, ClientError> {
        Self::start(config, Some(fetcher))
    }

    fn start(
        config: ClientConfig,
        fetcher: Option<Arc<dyn CloudMetadataFetcher>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            ClientError::InvalidConfiguration("Client must be created inside a Tokio runtime".into())
        })?;

        let transport = Arc::new(HttpTransport::new(&config)?);
        let notifier = Notifier::new();
        let stats = Arc::new(ClientStats::new());
        let admission = Arc::new(Admission::new(config.intake.max_queue_size));
        let config_cache = Arc::new(RwLock::new(ConfigCache::default()));
        let cancel = CancellationToken::new();
        let poller_cancel = cancel.child_token();

        if config.central_config {
            let poller = ConfigPoller::new(
                transport.clone(),
                &config,
                config_cache.clone(),
                notifier.clone(),
                stats.clone(),
            );
            poller.spawn(poller_cancel.clone());
        }

        let mirror = config.payload_log_file.clone().map(PayloadMirror::spawn);
        let (commands, rx) = mpsc::unbounded_channel();

        let controller = DeliveryController::new(ControllerParts {
            commands: rx,
            transport,
            tunables: config.intake.clone(),
            metadata: MetadataDocument::new(Metadata::from_config(&config)),
            fetcher,
            metadata_timeout: config.metadata_timeout,
            admission: admission.clone(),
            notifier: notifier.clone(),
            stats: stats.clone(),
            mirror,
            cancel: cancel.clone(),
            poller_cancel,
        });
        runtime.spawn(controller.run());

        info!(
            server = %config.server_url,
            service = %config.service_name,
            central_config = config.central_config,
            "APM client started"
        );

        Ok(Self {
            commands,
            admission,
            notifier,
            stats,
            config_cache,
            tunables: RwLock::new(config.intake),
            state: AtomicU8::new(OPEN),
            cancel,
        })
    }

    pub fn send_transaction<T: Serialize + ?Sized>(&self, transaction: &T) -> DeliveryReceipt {
        self.send_serialized(EventKind::Transaction, transaction)
    }

    pub fn send_span<T: Serialize + ?Sized>(&self, span: &T) -> DeliveryReceipt {
        self.send_serialized(EventKind::Span, span)
    }

    pub fn send_error<T: Serialize + ?Sized>(&self, error: &T) -> DeliveryReceipt {
        self.send_serialized(EventKind::Error, error)
    }

    pub fn send_metricset<T: Serialize + ?Sized>(&self, metricset: &T) -> DeliveryReceipt {
        self.send_serialized(EventKind::Metricset, metricset)
    }

    fn send_serialized<T: Serialize + ?Sized>(&self, kind: EventKind, payload: &T) -> DeliveryReceipt {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(kind, value),
            Err(e) => DeliveryReceipt::ready(Err(ClientError::Encoding(format!("{kind}: {e}")))),
        }
    }

    /// Submits one event. Never blocks; a full queue drops the event.
    pub fn send(&self, kind: EventKind, payload: Value) -> DeliveryReceipt {
        if let Err(e) = self.ensure_open() {
            return DeliveryReceipt::ready(Err(e));
        }

        self.stats.record_submitted();
        if !self.admission.try_reserve() {
            self.stats.record_dropped();
            let dropped = self.admission.dropped();
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(
                    dropped,
                    capacity = self.admission.capacity(),
                    "Event queue full, dropping events"
                );
            }
            return DeliveryReceipt::ready(Err(ClientError::QueueFull {
                capacity: self.admission.capacity(),
            }));
        }

        let (completion, receipt) = Completion::channel();
        let event = PendingEvent::new(kind, payload, completion);
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Event(event)) {
            self.admission.release();
            if let Command::Event(event) = command {
                event.completion.resolve(Err(self.terminal_error()));
            }
        }
        receipt
    }

    /// Sends everything buffered now; resolves once those events have a response.
    pub fn flush(&self) -> DeliveryReceipt {
        if let Err(e) = self.ensure_open() {
            return DeliveryReceipt::ready(Err(e));
        }

        let (completion, receipt) = Completion::channel();
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Flush(completion)) {
            if let Command::Flush(completion) = command {
                completion.resolve(Err(self.terminal_error()));
            }
        }
        receipt
    }

    /// Delivers what is buffered, stops the config poller and closes the
    /// stream. Later submissions fail with [`ClientError::Ended`].
    pub fn end(&self) -> DeliveryReceipt {
        if self.state.load(Ordering::Acquire) == DESTROYED {
            return DeliveryReceipt::ready(Err(ClientError::Destroyed));
        }
        let _ = self
            .state
            .compare_exchange(OPEN, ENDED, Ordering::AcqRel, Ordering::Acquire);

        let (completion, receipt) = Completion::channel();
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::End(completion)) {
            // The worker is already gone: the stream is closed.
            if let Command::End(completion) = command {
                completion.resolve(Ok(()));
            }
        }
        receipt
    }

    /// Aborts everything immediately. Pending receipts resolve with
    /// [`ClientError::Destroyed`] and no further request is made.
    pub fn destroy(&self) {
        if self.state.swap(DESTROYED, Ordering::AcqRel) != DESTROYED {
            info!("Destroying APM client");
            self.cancel.cancel();
        }
    }

    /// Registers a filter run on the metadata document for every later request.
    pub fn add_metadata_filter<F>(&self, filter: F)
    where
        F: Fn(&mut Metadata) + Send + Sync + 'static,
    {
        let _ = self
            .commands
            .send(Command::AddMetadataFilter(Arc::new(filter)));
    }

    /// Swaps the intake tunables without reconnecting. Limits that shape a
    /// request apply from the next request on.
    pub fn configure(&self, tunables: IntakeTunables) -> Result<(), ClientError> {
        self.ensure_open()?;
        tunables.validate()?;

        self.admission.set_capacity(tunables.max_queue_size);
        *self.tunables.write() = tunables.clone();
        self.commands
            .send(Command::Reconfigure(Box::new(tunables)))
            .map_err(|_| self.terminal_error())
    }

    pub fn tunables(&self) -> IntakeTunables {
        self.tunables.read().clone()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ClientError> {
        self.notifier.subscribe_errors()
    }

    pub fn subscribe_config(&self) -> broadcast::Receiver<RemoteConfig> {
        self.notifier.subscribe_config()
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.notifier.subscribe_lifecycle()
    }

    /// The last configuration received from the APM Server, if any.
    pub fn central_config(&self) -> Option<RemoteConfig> {
        self.config_cache.read().last_config.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Events accepted but not yet picked up by the delivery worker.
    pub fn queued(&self) -> usize {
        self.admission.queued()
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            _ => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> ClientError {
        match self.state.load(Ordering::Acquire) {
            DESTROYED => ClientError::Destroyed,
            _ => ClientError::Ended,
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("queued", &self.admission.queued())
            .field("lifecycle", &self.notifier.current_lifecycle())
            .finish()
    }
}
