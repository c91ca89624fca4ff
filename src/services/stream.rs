//! Request body plumbing for PATCH.

use bytes::Bytes;
use futures::{Stream, stream::BoxStream};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

/// Request body as handed over by the HTTP adapter.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Body stream the storage layer consumes.
pub type ChunkStream<'a> = dyn Stream<Item = io::Result<Bytes>> + Send + Unpin + 'a;

/// Limits how much of a request body is consumed.
///
/// The first `skip` bytes are dropped (bytes the server already holds from an
/// earlier attempt), then at most `limit` bytes are yielded. Once the limit is
/// reached the inner stream is not polled again.
pub struct BoundedStream<S> {
    inner: S,
    skip: u64,
    remaining: u64,
}

impl<S> BoundedStream<S> {
    pub fn new(inner: S, skip: u64, limit: u64) -> Self {
        Self {
            inner,
            skip,
            remaining: limit,
        }
    }
}

impl<S> Stream for BoundedStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.remaining == 0 {
                return Poll::Ready(None);
            }
            let mut chunk = match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => chunk,
                other => return Poll::Ready(other),
            };

            if this.skip > 0 {
                let dropped = this.skip.min(chunk.len() as u64);
                this.skip -= dropped;
                chunk = chunk.slice(dropped as usize..);
                if chunk.is_empty() {
                    continue;
                }
            }

            if chunk.len() as u64 > this.remaining {
                chunk.truncate(this.remaining as usize);
            }
            this.remaining -= chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }
    }
}
