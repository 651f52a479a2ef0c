use std::{
    pin::Pin,
    task::{Context as TaskContext, Poll},
};

use futures::{
    Stream, StreamExt,
    stream::{BoxStream, FusedStream},
};
use tokio_util::sync::CancellationToken;

use crate::{context::Context, error::Result};

/// A change notification delivered by [`WatchStream`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),

    /// Progress notification without an object change. The resource version can be used to
    /// resume the watch later on.
    Bookmark { resource_version: String },
}

impl<K> WatchEvent<K> {
    /// Returns the object carried by the event, if any.
    pub fn object(&self) -> Option<&K> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            Self::Bookmark { .. } => None,
        }
    }

    pub fn into_object(self) -> Option<K> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            Self::Bookmark { .. } => None,
        }
    }
}

/// Closes a [`WatchStream`] from anywhere, without needing access to the stream itself.
#[derive(Clone, Debug)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// A long-lived stream of [`WatchEvent`]s.
///
/// The stream holds on to server-side resources (a connection, a subscription) until it is
/// closed, so callers must close it once they lose interest: either explicitly through
/// [`WatchStream::stop`] or a [`StopHandle`], or by dropping it. It also ends once the
/// [`Context`] it was opened with is done.
#[must_use = "watch streams do nothing unless polled"]
pub struct WatchStream<K> {
    inner: Option<BoxStream<'static, Result<WatchEvent<K>>>>,
    stop: CancellationToken,
}

impl<K> WatchStream<K>
where
    K: Send + 'static,
{
    /// Wraps a raw event stream. The stream ends when `ctx` is done or the stream is stopped.
    pub fn new<S>(ctx: &Context, events: S) -> Self
    where
        S: Stream<Item = Result<WatchEvent<K>>> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let inner = events
            .take_until(ctx.clone().into_done())
            .take_until(stop.clone().cancelled_owned())
            .boxed();

        Self {
            inner: Some(inner),
            stop,
        }
    }
}

impl<K> WatchStream<K> {
    /// Closes the stream and releases the underlying resources. Events not yet received are
    /// lost, subsequent polls return [`None`].
    pub fn stop(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!("watch stream closed by caller");
        }
        self.stop.cancel();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_none() || self.stop.is_cancelled()
    }
}

impl<K> Stream for WatchStream<K> {
    type Item = Result<WatchEvent<K>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                // Release the underlying stream as soon as it is exhausted
                self.inner = None;
                Poll::Ready(None)
            }
            poll => poll,
        }
    }
}

impl<K> FusedStream for WatchStream<K> {
    fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }
}

impl<K> Drop for WatchStream<K> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
