use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use http_body::{Body, Frame, SizeHint};

use crate::lookup::read_range;
use crate::{CacheInner, EntryStore, Fingerprint};

/// Body of a cached response between two offsets. Implements [`Stream`],
/// [`Body`], and [`IntoResponse`].
///
/// Each item is the result of one `read_range` call, so no item spans more
/// than one partition and the next partition is only fetched once the
/// previous item has been taken.
pub struct CachedBodyStream<S> {
    state: StreamState,
    inner: Arc<CacheInner<S>>,
    fingerprint: Fingerprint,
    total: u64,
    position: u64,
    end: u64,
}

enum StreamState {
    Idle,
    Reading(BoxFuture<'static, crate::Result<Bytes>>),
    Done,
}

impl<S: EntryStore> CachedBodyStream<S> {
    pub(crate) fn new(inner: Arc<CacheInner<S>>, fingerprint: Fingerprint, total: u64, begin: u64, end: u64) -> Self {
        CachedBodyStream {
            state: StreamState::Idle,
            inner,
            fingerprint,
            total,
            position: begin,
            end,
        }
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> u64 {
        self.end - self.position
    }

    fn start_read(&self) -> BoxFuture<'static, crate::Result<Bytes>> {
        let inner = self.inner.clone();
        let (fingerprint, total, begin, end) = (self.fingerprint, self.total, self.position, self.end);
        async move { read_range(&inner, fingerprint, total, begin, end).await }.boxed()
    }
}

impl<S> std::fmt::Debug for CachedBodyStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBodyStream")
            .field("fingerprint", &self.fingerprint)
            .field("position", &self.position)
            .field("end", &self.end)
            .finish()
    }
}

impl<S: EntryStore> IntoResponse for CachedBodyStream<S> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<S: EntryStore> Body for CachedBodyStream<S> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining())
    }

    fn is_end_stream(&self) -> bool {
        self.position >= self.end
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<S: EntryStore> Stream for CachedBodyStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        if let StreamState::Idle = this.state {
            if this.position >= this.end {
                this.state = StreamState::Done;
            } else {
                this.state = StreamState::Reading(this.start_read());
            }
        }

        if let StreamState::Reading(read) = &mut this.state {
            match read.poll_unpin(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => {
                    // a body that cannot be read whole is not served partially
                    this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(Ok(chunk)) if chunk.is_empty() => {
                    this.state = StreamState::Done;
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("no progress reading {} at offset {}", this.fingerprint, this.position),
                    ))));
                }
                Poll::Ready(Ok(chunk)) => {
                    this.position += chunk.len() as u64;
                    this.state = StreamState::Idle;
                    return Poll::Ready(Some(Ok(chunk)));
                }
            }
        }

        Poll::Ready(None)
    }
}
