use super::http::HttpTransport;
use super::response::{IntakeAck, interpret};
use crate::buffer::BodyFrame;
use crate::domain::ClientError;
use bytes::Bytes;
use futures::stream;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::debug;
use uuid::Uuid;

struct BodyState {
    frames: Option<mpsc::UnboundedReceiver<BodyFrame>>,
    body_done: Option<oneshot::Sender<Duration>>,
    activity: Arc<Notify>,
}

/// Spawns the task that carries one intake request.
///
/// The body streams from `frames` as the chopper produces it. Until the
/// body is complete the request is bounded by `server_timeout` of
/// inactivity; after that, by the response timeout carried in the final
/// frame.
pub fn spawn_intake_request(
    transport: Arc<HttpTransport>,
    frames: mpsc::UnboundedReceiver<BodyFrame>,
    server_timeout: Duration,
    request_id: Uuid,
) -> JoinHandle<Result<IntakeAck, ClientError>> {
    tokio::spawn(async move {
        let result = transmit(transport, frames, server_timeout).await;
        debug!(%request_id, ok = result.is_ok(), "intake request finished");
        result
    })
}

async fn transmit(
    transport: Arc<HttpTransport>,
    frames: mpsc::UnboundedReceiver<BodyFrame>,
    server_timeout: Duration,
) -> Result<IntakeAck, ClientError> {
    let activity = Arc::new(Notify::new());
    let (done_tx, mut done_rx) = oneshot::channel::<Duration>();

    let state = BodyState {
        frames: Some(frames),
        body_done: Some(done_tx),
        activity: activity.clone(),
    };
    let body = stream::unfold(state, |mut state| async move {
        loop {
            let frames = state.frames.as_mut()?;
            match frames.recv().await {
                Some(BodyFrame::Chunk(chunk)) => {
                    state.activity.notify_one();
                    if chunk.is_empty() {
                        continue;
                    }
                    return Some((Ok::<Bytes, io::Error>(chunk), state));
                }
                Some(BodyFrame::End { response_timeout }) => {
                    if let Some(done) = state.body_done.take() {
                        let _ = done.send(response_timeout);
                    }
                    return None;
                }
                None => {
                    // The controller dropped the stream without ending it.
                    state.frames = None;
                    return Some((
                        Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "intake request aborted",
                        )),
                        state,
                    ));
                }
            }
        }
    });

    let response = transport
        .intake_request()
        .body(reqwest::Body::wrap_stream(body))
        .send();
    tokio::pin!(response);

    let response_timeout = loop {
        tokio::select! {
            biased;
            // The server may answer before the body is complete, e.g. on auth errors.
            early = &mut response => {
                let response = early.map_err(|e| ClientError::from_reqwest(&e))?;
                return interpret(response).await;
            }
            done = &mut done_rx => break done.unwrap_or(server_timeout),
            _ = activity.notified() => continue,
            _ = sleep(server_timeout) => {
                return Err(ClientError::Timeout(format!(
                    "no activity on intake request for {} ms",
                    server_timeout.as_millis()
                )));
            }
        }
    };

    timeout(response_timeout, async {
        let response = (&mut response)
            .await
            .map_err(|e| ClientError::from_reqwest(&e))?;
        interpret(response).await
    })
    .await
    .map_err(|_| {
        ClientError::Timeout(format!(
            "no response from APM Server within {} ms",
            response_timeout.as_millis()
        ))
    })?
}
