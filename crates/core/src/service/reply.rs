use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{AudioWorkerError, Result};

pub(crate) type Settlement = Result<Value>;

/// Future of a dispatched request's typed result.
///
/// The request is registered when the reply is created, not when it is first
/// polled, so dropping a reply does not withdraw the request; it still settles
/// through a response, its timeout, eviction or terminate.
#[must_use = "a reply only yields its result when awaited"]
#[derive(Debug)]
pub struct Reply<T> {
    state: ReplyState,
    _marker: PhantomData<fn() -> T>,
}

#[derive(Debug)]
enum ReplyState {
    Failed(Option<AudioWorkerError>),
    Waiting(oneshot::Receiver<Settlement>),
}

impl<T> Reply<T> {
    pub(crate) fn waiting(rx: oneshot::Receiver<Settlement>) -> Self {
        Self {
            state: ReplyState::Waiting(rx),
            _marker: PhantomData,
        }
    }

    pub(crate) fn failed(err: AudioWorkerError) -> Self {
        Self {
            state: ReplyState::Failed(Some(err)),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for Reply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Failed(err) => {
                Poll::Ready(Err(err.take().expect("reply polled after completion")))
            }
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(value))) => {
                    Poll::Ready(serde_json::from_value(value).map_err(AudioWorkerError::from))
                }
                Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
                // Only reachable if the owning state vanished without draining.
                Poll::Ready(Err(_)) => Poll::Ready(Err(AudioWorkerError::Terminated)),
            },
        }
    }
}
