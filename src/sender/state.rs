use super::response::IntakeAck;
use crate::buffer::ChoppedStream;
use crate::domain::{ClientError, Completion};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// A request whose task is running, with the receipts it will settle.
#[derive(Debug)]
pub struct InflightRequest {
    pub id: Uuid,
    pub opened_at: Instant,
    pub task: JoinHandle<Result<IntakeAck, ClientError>>,
    pub acks: Vec<Completion>,
    pub events: usize,
    /// Sequence number of the last event written into this request.
    pub last_seq: u64,
    pub compressed_bytes: usize,
}

/// A request whose body is still open for writes.
#[derive(Debug)]
pub struct ActiveRequest {
    pub stream: ChoppedStream,
    pub inflight: InflightRequest,
}

/// The intake pipeline's state machine.
///
/// ```text
/// Idle -> Buffering -> Sending -> AwaitingAck -> Idle | Buffering
///                                            \-> Backoff -> Idle | Buffering
/// any -> Closed
/// ```
#[derive(Debug, Default)]
pub enum IntakeState {
    #[default]
    Idle,
    /// Events are corked or carried, no request is open.
    Buffering,
    Sending(ActiveRequest),
    AwaitingAck(InflightRequest),
    Backoff { until: Instant },
    Closed,
}

impl IntakeState {
    /// Whether new submissions may be drained from the queue.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            IntakeState::Idle | IntakeState::Buffering | IntakeState::Sending(_)
        )
    }

    pub fn has_request(&self) -> bool {
        matches!(self, IntakeState::Sending(_) | IntakeState::AwaitingAck(_))
    }

    /// When the open request hits its age ceiling.
    pub fn request_deadline(&self, time: Option<Duration>) -> Option<Instant> {
        match (self, time) {
            (IntakeState::Sending(active), Some(time)) => active.inflight.opened_at.checked_add(time),
            _ => None,
        }
    }

    pub fn backoff_until(&self) -> Option<Instant> {
        match self {
            IntakeState::Backoff { until } => Some(*until),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IntakeState::Idle => "idle",
            IntakeState::Buffering => "buffering",
            IntakeState::Sending(_) => "sending",
            IntakeState::AwaitingAck(_) => "awaiting-ack",
            IntakeState::Backoff { .. } => "backoff",
            IntakeState::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_acceptance_per_state() {
        assert!(IntakeState::Idle.accepts_writes());
        assert!(IntakeState::Buffering.accepts_writes());
        assert!(!IntakeState::Closed.accepts_writes());
        assert!(
            !IntakeState::Backoff {
                until: Instant::now()
            }
            .accepts_writes()
        );
        assert!(IntakeState::Idle.request_deadline(Some(Duration::from_secs(1))).is_none());
    }

    #[tokio::test]
    async fn test_request_deadline_does_not_overflow() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = ChoppedStream::open(b"{\"metadata\":{}}\n", tx).unwrap();
        let opened_at = Instant::now();
        let state = IntakeState::Sending(ActiveRequest {
            stream,
            inflight: InflightRequest {
                id: Uuid::new_v4(),
                opened_at,
                task: tokio::spawn(async { Ok(IntakeAck::default()) }),
                acks: Vec::new(),
                events: 0,
                last_seq: 0,
                compressed_bytes: 0,
            },
        });

        assert_eq!(
            state.request_deadline(Some(Duration::from_secs(10))),
            Some(opened_at + Duration::from_secs(10))
        );
        assert_eq!(state.request_deadline(Some(Duration::MAX)), None);
        assert_eq!(state.name(), "sending");
    }

    #[tokio::test]
    async fn test_awaiting_ack_blocks_writes() {
        let task = tokio::spawn(async { Ok(IntakeAck::default()) });
        let state = IntakeState::AwaitingAck(InflightRequest {
            id: Uuid::new_v4(),
            opened_at: Instant::now(),
            task,
            acks: Vec::new(),
            events: 0,
            last_seq: 0,
            compressed_bytes: 0,
        });
        assert!(!state.accepts_writes());
        assert!(state.has_request());
        assert_eq!(state.name(), "awaiting-ack");
    }
}
