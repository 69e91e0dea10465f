//! Continuations: what runs when a conversation ends.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use super::DiscardReason;
use crate::codec::MsgPackCodec;
use crate::error::{Result, ServiceError, SessionError};

/// Consumed exactly once when its conversation ends.
///
/// Methods run on the session's delivery task. They may start new requests
/// but must not block waiting for them.
pub trait Continuation: Send + 'static {
    /// The server answered with a Response envelope.
    fn on_response(self: Box<Self>, payload: Bytes);

    /// The server answered with an Error envelope.
    fn on_error(self: Box<Self>, error: ServiceError);

    /// The conversation was abandoned without an answer.
    fn on_discard(self: Box<Self>, reason: DiscardReason);
}

/// Turns a response payload into `T`.
pub type Decoder<T> = fn(&[u8]) -> Result<T>;

/// Continuation that folds all three outcomes into one `FnOnce(Result<T>)`.
pub struct ResponseCallback<T> {
    decode: Decoder<T>,
    callback: Box<dyn FnOnce(Result<T>) + Send>,
}

impl<T: Send + 'static> ResponseCallback<T> {
    /// Build from an explicit payload decoder.
    pub fn new<F>(decode: Decoder<T>, callback: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self {
            decode,
            callback: Box::new(callback),
        }
    }

    /// Build with a MessagePack decoder for `T`.
    pub fn decoded<F>(callback: F) -> Self
    where
        T: DeserializeOwned,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self::new(MsgPackCodec::decode::<T>, callback)
    }
}

impl ResponseCallback<()> {
    /// Build for requests answered with an empty acknowledgment.
    pub fn ack<F>(callback: F) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        Self::new(MsgPackCodec::decode_ack, callback)
    }
}

impl<T: Send + 'static> Continuation for ResponseCallback<T> {
    fn on_response(self: Box<Self>, payload: Bytes) {
        let result = (self.decode)(&payload);
        (self.callback)(result);
    }

    fn on_error(self: Box<Self>, error: ServiceError) {
        (self.callback)(Err(SessionError::Service(error)));
    }

    fn on_discard(self: Box<Self>, reason: DiscardReason) {
        (self.callback)(Err(SessionError::Discarded(reason)));
    }
}

/// Continuation that resolves a [`ResponseFuture`].
pub struct OneshotContinuation;

impl OneshotContinuation {
    /// Pair a continuation with the future it resolves.
    pub fn channel<T: Send + 'static>(
        decode: Decoder<T>,
    ) -> (ResponseCallback<T>, ResponseFuture<T>) {
        let (tx, rx) = oneshot::channel();
        let continuation = ResponseCallback::new(decode, move |result| {
            // Receiver may have been dropped by a caller that lost interest.
            let _ = tx.send(result);
        });
        (continuation, ResponseFuture { rx })
    }
}

/// Future resolving to the outcome of one conversation.
///
/// If the continuation is dropped without running (the session itself was
/// dropped), resolves to `Discarded(SessionClosed)`.
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SessionError::Discarded(
                DiscardReason::SessionClosed,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
