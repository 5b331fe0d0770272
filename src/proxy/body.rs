// src/proxy/body.rs
use super::pool::PooledConnection;
use futures::Stream;
use hyper::body::{Bytes, HttpBody};
use hyper::Body;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{sleep_until, Instant, Sleep};

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request deadline exceeded while streaming the response")]
    DeadlineExceeded,

    #[error("upstream response stream failed: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Upstream response body on its way to the client.
///
/// Holds the pooled connection until the last chunk has been read, then
/// returns it for reuse. The last chunk is recognised either by EOF or by
/// the upstream's declared length running out. An upstream error or the request deadline ends
/// the stream with an error, which makes the server abort the client
/// response instead of letting a truncated body look complete. If the
/// client goes away the stream is dropped and the connection discarded.
pub struct UpstreamBody {
    inner: Body,
    connection: Option<PooledConnection>,
    deadline: Pin<Box<Sleep>>,
    finished: bool,
}

impl UpstreamBody {
    pub fn new(inner: Body, connection: PooledConnection, deadline: Instant) -> Self {
        Self {
            inner,
            connection: Some(connection),
            deadline: Box::pin(sleep_until(deadline)),
            finished: false,
        }
    }

    /// Bodies that are already complete (HEAD, 204, 304, zero length) hand
    /// the connection back straight away; the server never polls them.
    pub fn into_body(mut self) -> Body {
        if self.inner.is_end_stream() {
            self.release();
            return Body::empty();
        }
        Body::wrap_stream(self)
    }

    fn release(&mut self) {
        self.finished = true;
        if let Some(connection) = self.connection.take() {
            connection.release();
        }
    }

    fn abort(&mut self, error: BodyError) -> Poll<Option<Result<Bytes, BodyError>>> {
        self.finished = true;
        if let Some(connection) = self.connection.take() {
            tracing::warn!(upstream = %connection.upstream(), %error, "Aborting client response");
        }
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            return this.abort(BodyError::DeadlineExceeded);
        }

        match Pin::new(&mut this.inner).poll_data(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                // With a Content-Length the server stops polling after the
                // last byte is written, so EOF may never be observed here.
                if this.inner.is_end_stream() {
                    this.release();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => this.abort(BodyError::Upstream(err)),
            Poll::Ready(None) => {
                this.release();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
