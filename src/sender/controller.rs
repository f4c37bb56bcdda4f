use super::http::HttpTransport;
use super::response::IntakeAck;
use super::serialization::EventEncoder;
use super::state::{ActiveRequest, InflightRequest, IntakeState};
use super::stats::ClientStats;
use super::transmission::spawn_intake_request;
use super::truncate::Truncation;
use crate::buffer::{Admission, BatchWindow, ChoppedStream, EncodedEvent, WindowConfig};
use crate::client::{Command, IntakeTunables, Lifecycle, Notifier};
use crate::domain::{ClientError, CloudMetadataFetcher, Completion, MetadataDocument, PendingEvent};
use crate::reliability::{Backoff, PayloadMirror};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct FlushWaiter {
    /// Settled once every event up to this sequence number has a response.
    target: u64,
    completion: Completion,
}

/// Everything the delivery worker needs, assembled by the client.
pub(crate) struct ControllerParts {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub transport: Arc<HttpTransport>,
    pub tunables: IntakeTunables,
    pub metadata: MetadataDocument,
    pub fetcher: Option<Arc<dyn CloudMetadataFetcher>>,
    pub metadata_timeout: Duration,
    pub admission: Arc<Admission>,
    pub notifier: Notifier,
    pub stats: Arc<ClientStats>,
    pub mirror: Option<PayloadMirror>,
    pub cancel: CancellationToken,
    pub poller_cancel: CancellationToken,
}

/// Owns the intake pipeline: the batch window, the single outgoing
/// request and the backoff. It runs as one task, so none of this state is
/// shared or locked.
pub(crate) struct DeliveryController {
    commands: mpsc::UnboundedReceiver<Command>,
    transport: Arc<HttpTransport>,
    tunables: IntakeTunables,
    encoder: EventEncoder,
    metadata: MetadataDocument,
    fetcher: Option<Arc<dyn CloudMetadataFetcher>>,
    metadata_timeout: Duration,
    window: BatchWindow,
    state: IntakeState,
    backoff: Backoff,
    admission: Arc<Admission>,
    notifier: Notifier,
    stats: Arc<ClientStats>,
    mirror: Option<PayloadMirror>,
    cancel: CancellationToken,
    poller_cancel: CancellationToken,
    next_seq: u64,
    settled_seq: u64,
    flush_waiters: Vec<FlushWaiter>,
    end_waiters: Vec<Completion>,
    closing: bool,
}

impl DeliveryController {
    pub(crate) fn new(parts: ControllerParts) -> Self {
        let tunables = parts.tunables;
        Self {
            commands: parts.commands,
            transport: parts.transport,
            encoder: EventEncoder::new(Truncation::from_tunables(&tunables)),
            metadata: parts.metadata,
            fetcher: parts.fetcher,
            metadata_timeout: parts.metadata_timeout,
            window: BatchWindow::new(window_config(&tunables)),
            state: IntakeState::Idle,
            backoff: Backoff::new(tunables.backoff_jitter),
            admission: parts.admission,
            notifier: parts.notifier,
            stats: parts.stats,
            mirror: parts.mirror,
            cancel: parts.cancel,
            poller_cancel: parts.poller_cancel,
            next_seq: 0,
            settled_seq: 0,
            flush_waiters: Vec::new(),
            end_waiters: Vec::new(),
            closing: false,
            tunables,
        }
    }

    pub(crate) async fn run(mut self) {
        if !self.enrich_metadata().await {
            self.teardown();
            return;
        }

        loop {
            if self.closing && self.is_settled() {
                break;
            }

            let request_deadline = self.state.request_deadline(self.tunables.time);
            let backoff_until = self.state.backoff_until();
            let cork_deadline = if self.state.accepts_writes() {
                self.window.deadline()
            } else {
                None
            };
            let reading = self.state.accepts_writes() && !self.closing;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.teardown();
                    return;
                }
                outcome = request_outcome(&mut self.state) => self.on_request_done(outcome),
                _ = sleep_until_opt(backoff_until) => self.on_backoff_elapsed(),
                _ = sleep_until_opt(request_deadline) => {
                    debug!("Intake request reached its age ceiling");
                    self.end_request();
                }
                _ = sleep_until_opt(cork_deadline) => self.uncork(),
                command = self.commands.recv(), if reading => match command {
                    Some(command) => self.handle(command),
                    // Every client handle is gone: end implicitly.
                    None => self.begin_end(None),
                },
            }
        }

        self.finish().await;
    }

    async fn enrich_metadata(&mut self) -> bool {
        let Some(fetcher) = self.fetcher.take() else {
            return true;
        };

        let fetch = timeout(self.metadata_timeout, fetcher.fetch());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            fetched = fetch => {
                match fetched {
                    Ok(Some(extension)) => self.metadata.extend(extension),
                    Ok(None) => debug!("No cloud metadata available"),
                    Err(_) => warn!(
                        "Cloud metadata not available after {} ms, continuing without it",
                        self.metadata_timeout.as_millis()
                    ),
                }
                true
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Event(event) => {
                self.admission.release();
                self.absorb(event);
            }
            Command::Flush(completion) => self.flush(completion),
            Command::End(completion) => self.begin_end(Some(completion)),
            Command::Reconfigure(tunables) => self.reconfigure(*tunables),
            Command::AddMetadataFilter(filter) => self.metadata.add_filter(filter),
        }
    }

    fn absorb(&mut self, event: PendingEvent) {
        let PendingEvent {
            kind,
            payload,
            completion,
        } = event;

        let line = match self.encoder.encode(kind, payload) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping {} event: {}", kind, e);
                self.stats.record_event_failed();
                completion.resolve(Err(e));
                return;
            }
        };

        self.next_seq += 1;
        let encoded = EncodedEvent {
            seq: self.next_seq,
            kind,
            line,
            completion,
        };

        if matches!(self.state, IntakeState::Idle) {
            self.state = IntakeState::Buffering;
        }
        if self.window.cork(encoded, Instant::now()) {
            self.uncork();
        }
    }

    fn flush(&mut self, completion: Completion) {
        let target = self.next_seq;
        if target <= self.settled_seq {
            completion.resolve(Ok(()));
            return;
        }

        self.flush_waiters.push(FlushWaiter { target, completion });
        self.uncork();
    }

    fn begin_end(&mut self, completion: Option<Completion>) {
        if let Some(completion) = completion {
            self.end_waiters.push(completion);
        }
        if self.closing {
            return;
        }

        debug!(buffered = self.window.len(), "Ending intake stream");
        self.closing = true;
        self.poller_cancel.cancel();
        self.uncork();
    }

    fn reconfigure(&mut self, tunables: IntakeTunables) {
        self.admission.set_capacity(tunables.max_queue_size);
        self.encoder
            .set_truncation(Truncation::from_tunables(&tunables));
        self.window.set_config(window_config(&tunables));
        self.backoff.set_jitter(tunables.backoff_jitter);
        self.tunables = tunables;
        info!(
            size = self.tunables.size,
            max_queue_size = self.tunables.max_queue_size,
            "Intake reconfigured"
        );
    }

    /// Releases the batch window into the open request, opening one if needed.
    fn uncork(&mut self) {
        if !self.state.accepts_writes() {
            return;
        }

        let mut batch = self.window.take();
        if batch.is_empty() {
            if self.wants_flush() {
                self.end_request();
            }
            if !self.state.has_request() {
                self.state = self.resting_state();
            }
            return;
        }

        if !matches!(self.state, IntakeState::Sending(_)) {
            if let Err(e) = self.open_request() {
                error!("Failed to open intake request: {}", e);
                self.notifier.error(e.clone());
                if let Some(last) = batch.iter().map(|event| event.seq).max() {
                    self.settled_seq = self.settled_seq.max(last);
                }
                for event in batch {
                    event.completion.resolve(Err(e.clone()));
                }
                self.state = self.resting_state();
                self.settle_flushes();
                return;
            }
        }

        while let Some(event) = batch.pop_front() {
            let IntakeState::Sending(active) = &mut self.state else {
                batch.push_front(event);
                break;
            };

            if active.stream.should_rotate(self.tunables.size) {
                debug!(
                    request_id = %active.inflight.id,
                    bytes = active.stream.compressed_bytes(),
                    "Intake request reached its size ceiling"
                );
                batch.push_front(event);
                self.end_request();
                break;
            }

            active.inflight.last_seq = event.seq;
            match active.stream.write_line(&event.line) {
                Ok(()) => {
                    if let Some(mirror) = &self.mirror {
                        mirror.record(&event.line);
                    }
                    active.inflight.acks.push(event.completion);
                    active.inflight.events += 1;
                }
                Err(e) => {
                    self.stats.record_event_failed();
                    event
                        .completion
                        .resolve(Err(ClientError::Encoding(format!("compression failed: {e}"))));
                }
            }
        }

        if !batch.is_empty() {
            // Pushed out by the size ceiling; first in line for the next request.
            self.window.defer(batch, Instant::now());
            return;
        }

        if let IntakeState::Sending(active) = &mut self.state {
            if let Err(e) = active.stream.sync() {
                warn!("Failed to flush compressor: {}", e);
            }
            let rotate = active.stream.should_rotate(self.tunables.size);
            if rotate || self.wants_flush() {
                self.end_request();
            }
        }
    }

    fn open_request(&mut self) -> Result<(), ClientError> {
        let metadata_line = self.metadata.line()?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let stream = ChoppedStream::open(&metadata_line, frames_tx)
            .map_err(|e| ClientError::Encoding(format!("compression failed: {e}")))?;

        if let Some(mirror) = &self.mirror {
            mirror.record(&metadata_line);
        }

        let id = Uuid::new_v4();
        let task = spawn_intake_request(
            self.transport.clone(),
            frames_rx,
            self.tunables.server_timeout,
            id,
        );
        debug!(request_id = %id, url = %self.transport.intake_url(), "Opened intake request");

        self.state = IntakeState::Sending(ActiveRequest {
            stream,
            inflight: InflightRequest {
                id,
                opened_at: Instant::now(),
                task,
                acks: Vec::new(),
                events: 0,
                last_seq: self.settled_seq,
                compressed_bytes: 0,
            },
        });
        Ok(())
    }

    /// Completes the body of the open request; the response is awaited in `run`.
    fn end_request(&mut self) {
        match std::mem::take(&mut self.state) {
            IntakeState::Sending(ActiveRequest {
                stream,
                mut inflight,
            }) => {
                let response_timeout = if self.closing {
                    self.tunables.response_timeout_on_end
                } else {
                    self.tunables.response_timeout
                };
                let uncompressed_bytes = stream.uncompressed_bytes();
                match stream.finish(response_timeout) {
                    Ok(bytes) => inflight.compressed_bytes = bytes,
                    // The body stream was dropped unfinished, so the request fails on its own.
                    Err(e) => warn!("Failed to finish intake body: {}", e),
                }
                debug!(
                    request_id = %inflight.id,
                    events = inflight.events,
                    bytes = inflight.compressed_bytes,
                    uncompressed_bytes,
                    "Ended intake request"
                );
                self.state = IntakeState::AwaitingAck(inflight);
            }
            other => self.state = other,
        }
    }

    fn on_request_done(&mut self, outcome: Result<Result<IntakeAck, ClientError>, JoinError>) {
        let inflight = match std::mem::take(&mut self.state) {
            IntakeState::Sending(ActiveRequest {
                stream,
                mut inflight,
            }) => {
                // The request finished before its body did.
                inflight.compressed_bytes = stream.compressed_bytes();
                inflight
            }
            IntakeState::AwaitingAck(inflight) => inflight,
            other => {
                self.state = other;
                return;
            }
        };

        let result = outcome.unwrap_or_else(|e| {
            Err(ClientError::Transport(format!("intake request task failed: {e}")))
        });
        self.settled_seq = self.settled_seq.max(inflight.last_seq);
        let elapsed = inflight.opened_at.elapsed();

        match result {
            Ok(ack) => {
                self.backoff.record_success();
                self.stats
                    .record_request(true, inflight.events, inflight.compressed_bytes, 0);

                if ack.is_partial() {
                    warn!(
                        request_id = %inflight.id,
                        accepted = ?ack.accepted,
                        rejected = ack.errors.len(),
                        "APM Server rejected some events: {}",
                        ack.errors
                            .iter()
                            .map(|e| e.message.as_str())
                            .collect::<Vec<_>>()
                            .join("; ")
                    );
                }
                info!(
                    request_id = %inflight.id,
                    status = ack.status,
                    "Delivered {} events ({} bytes) in {:?}",
                    inflight.events,
                    inflight.compressed_bytes,
                    elapsed
                );

                for completion in inflight.acks {
                    completion.resolve(Ok(()));
                }
                self.state = self.resting_state();
            }
            Err(failure) => {
                let delay = self.backoff.record_failure();
                self.stats.record_request(
                    false,
                    inflight.events,
                    inflight.compressed_bytes,
                    self.backoff.consecutive_errors(),
                );
                error!(
                    request_id = %inflight.id,
                    events = inflight.events,
                    consecutive_errors = self.backoff.consecutive_errors(),
                    "Intake request failed, next attempt in {:?}: {}",
                    delay,
                    failure
                );

                self.notifier.error(failure.clone());
                for completion in inflight.acks {
                    completion.resolve(Err(failure.clone()));
                }

                self.state = match self.backoff.next_allowed_at() {
                    Some(until) => IntakeState::Backoff { until },
                    None => self.resting_state(),
                };
                debug!(state = self.state.name(), "Intake state after failure");
            }
        }

        self.settle_flushes();
    }

    fn on_backoff_elapsed(&mut self) {
        if matches!(self.state, IntakeState::Backoff { .. })
            && self.backoff.is_ready(Instant::now())
        {
            self.state = self.resting_state();
            debug!(state = self.state.name(), "Backoff elapsed");
        }
    }

    fn settle_flushes(&mut self) {
        let settled = self.settled_seq;
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flush_waiters)
            .into_iter()
            .partition(|waiter| waiter.target <= settled);
        self.flush_waiters = waiting;

        for waiter in done {
            waiter.completion.resolve(Ok(()));
        }
    }

    fn wants_flush(&self) -> bool {
        self.closing || !self.flush_waiters.is_empty()
    }

    fn is_settled(&self) -> bool {
        self.window.is_empty() && !self.state.has_request()
    }

    fn resting_state(&self) -> IntakeState {
        if self.window.is_empty() {
            IntakeState::Idle
        } else {
            IntakeState::Buffering
        }
    }

    /// Graceful shutdown after `end`, once the last request has its answer.
    async fn finish(mut self) {
        self.state = IntakeState::Closed;
        self.notifier.lifecycle(Lifecycle::Finished);
        self.poller_cancel.cancel();

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Event(event) => {
                    self.admission.release();
                    event.completion.resolve(Err(ClientError::Ended));
                }
                Command::Flush(completion) => completion.resolve(Err(ClientError::Ended)),
                Command::End(completion) => self.end_waiters.push(completion),
                Command::Reconfigure(_) | Command::AddMetadataFilter(_) => {}
            }
        }

        for waiter in self.flush_waiters.drain(..) {
            waiter.completion.resolve(Ok(()));
        }
        if let Some(mirror) = self.mirror.take() {
            mirror.shutdown().await;
        }

        self.notifier.lifecycle(Lifecycle::Closed);
        info!(stats = ?self.stats.snapshot(), "Intake stream closed");
        for completion in self.end_waiters.drain(..) {
            completion.resolve(Ok(()));
        }
    }

    /// Immediate shutdown: the open request is aborted and every pending
    /// receipt resolves with `Destroyed`.
    fn teardown(&mut self) {
        let inflight = match std::mem::replace(&mut self.state, IntakeState::Closed) {
            IntakeState::Sending(active) => Some(active.inflight),
            IntakeState::AwaitingAck(inflight) => Some(inflight),
            _ => None,
        };
        if let Some(inflight) = inflight {
            inflight.task.abort();
            debug!(request_id = %inflight.id, "Aborted intake request");
            for completion in inflight.acks {
                completion.resolve(Err(ClientError::Destroyed));
            }
        }

        self.poller_cancel.cancel();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Event(event) => {
                    self.admission.release();
                    event.completion.resolve(Err(ClientError::Destroyed));
                }
                Command::Flush(completion) | Command::End(completion) => {
                    completion.resolve(Err(ClientError::Destroyed));
                }
                Command::Reconfigure(_) | Command::AddMetadataFilter(_) => {}
            }
        }

        for event in self.window.take() {
            event.completion.resolve(Err(ClientError::Destroyed));
        }
        for waiter in self.flush_waiters.drain(..) {
            waiter.completion.resolve(Err(ClientError::Destroyed));
        }
        for completion in self.end_waiters.drain(..) {
            completion.resolve(Err(ClientError::Destroyed));
        }

        // Dropping the mirror stops it after what is already queued.
        self.mirror = None;
        self.notifier.lifecycle(Lifecycle::Closed);
        info!("Intake stream destroyed");
    }
}

fn window_config(tunables: &IntakeTunables) -> WindowConfig {
    WindowConfig {
        time: tunables.buffer_window_time,
        size: tunables.buffer_window_size,
    }
}

async fn request_outcome(
    state: &mut IntakeState,
) -> Result<Result<IntakeAck, ClientError>, JoinError> {
    match state {
        IntakeState::Sending(active) => (&mut active.inflight.task).await,
        IntakeState::AwaitingAck(inflight) => (&mut inflight.task).await,
        _ => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
