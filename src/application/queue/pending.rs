use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use super::{MessageQueueError, Shared};

pub(super) type Responder = oneshot::Sender<Result<Value, MessageQueueError>>;

/// Caller side of an enqueued Call. Resolves with the CallResult payload.
///
/// Dropping it before resolution withdraws the message if it has not been
/// sent yet; an in-flight message is left alone.
pub struct PendingResponse {
    unique_id: String,
    receiver: oneshot::Receiver<Result<Value, MessageQueueError>>,
    queue: Weak<Shared>,
    finished: bool,
}

impl PendingResponse {
    pub(super) fn new(
        unique_id: String,
        receiver: oneshot::Receiver<Result<Value, MessageQueueError>>,
        queue: Weak<Shared>,
    ) -> Self {
        Self {
            unique_id,
            receiver,
            queue,
            finished: false,
        }
    }

    /// Already-resolved response, for messages refused at enqueue time.
    pub(super) fn resolved(unique_id: String, result: Result<Value, MessageQueueError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(unique_id, rx, Weak::new())
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Fire and forget: the message stays queued and its outcome is discarded.
    pub fn detach(mut self) {
        self.finished = true;
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, MessageQueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(result) => {
                self.finished = true;
                Poll::Ready(result.unwrap_or(Err(MessageQueueError::Stopped)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel(&self.unique_id);
        }
    }
}
