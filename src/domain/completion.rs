use super::error::ClientError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Outcome = Result<(), ClientError>;

/// Worker-side half of a delivery receipt.
///
/// Resolves exactly once. Dropping it unresolved resolves the receipt with
/// [`ClientError::Destroyed`], so no caller is ever left waiting.
#[derive(Debug)]
pub struct Completion {
    tx: Option<oneshot::Sender<Outcome>>,
}

impl Completion {
    pub fn channel() -> (Completion, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();
        (
            Completion { tx: Some(tx) },
            DeliveryReceipt {
                inner: ReceiptInner::Pending(rx),
            },
        )
    }

    pub fn resolve(mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped its receipt; that is fine.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(ClientError::Destroyed));
        }
    }
}

/// Caller-side handle for a submitted event, a flush or an end.
///
/// Awaiting it yields the delivery outcome. It can be dropped freely when
/// the caller does not care.
#[derive(Debug)]
#[must_use = "a receipt does nothing unless awaited, drop it explicitly to fire and forget"]
pub struct DeliveryReceipt {
    inner: ReceiptInner,
}

#[derive(Debug)]
enum ReceiptInner {
    Pending(oneshot::Receiver<Outcome>),
    Ready(Option<Outcome>),
}

impl DeliveryReceipt {
    /// A receipt that is already resolved, used for fail-fast paths.
    pub fn ready(outcome: Outcome) -> Self {
        Self {
            inner: ReceiptInner::Ready(Some(outcome)),
        }
    }

    /// Non-blocking check, `None` while the outcome is still pending.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        match &mut self.inner {
            ReceiptInner::Pending(rx) => match rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::Destroyed)),
            },
            ReceiptInner::Ready(outcome) => outcome.clone(),
        }
    }
}

impl Future for DeliveryReceipt {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            ReceiptInner::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(ClientError::Destroyed))),
            ReceiptInner::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(ClientError::Destroyed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_outcome() {
        let (completion, receipt) = Completion::channel();
        completion.resolve(Ok(()));
        assert_eq!(receipt.await, Ok(()));
    }

    #[tokio::test]
    async fn test_dropped_completion_reports_destroyed() {
        let (completion, receipt) = Completion::channel();
        drop(completion);
        assert_eq!(receipt.await, Err(ClientError::Destroyed));
    }

    #[tokio::test]
    async fn test_ready_receipt() {
        let receipt = DeliveryReceipt::ready(Err(ClientError::Ended));
        assert_eq!(receipt.await, Err(ClientError::Ended));
    }

    #[test]
    fn test_try_outcome_pending_then_resolved() {
        let (completion, mut receipt) = Completion::channel();
        assert_eq!(receipt.try_outcome(), None);
        completion.resolve(Err(ClientError::QueueFull { capacity: 4 }));
        assert_eq!(
            receipt.try_outcome(),
            Some(Err(ClientError::QueueFull { capacity: 4 }))
        );
    }
}
